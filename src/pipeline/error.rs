//! Station failures and where they are reported.

use uuid::Uuid;

/// Why a station could not handle an item.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StationError {
    /// The item is lost; the station carries on with the next one.
    #[error("skipped: {0}")]
    Skipped(String),
    /// Downstream is gone; the station drains nothing more and stops.
    #[error("halted: {0}")]
    Halted(String),
}

impl StationError {
    pub fn is_halt(&self) -> bool {
        matches!(self, StationError::Halted(_))
    }
}

/// Receives every error a station produces.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Logs station errors under the session they belong to.
#[derive(Debug, Clone, Copy)]
pub struct SessionReporter {
    session: Uuid,
}

impl SessionReporter {
    pub fn new(session: Uuid) -> Self {
        Self { session }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}

impl ErrorReporter for SessionReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Skipped(reason) => {
                tracing::warn!(session = %self.session, station, %reason, "item skipped")
            }
            StationError::Halted(reason) => {
                tracing::error!(session = %self.session, station, %reason, "station halted")
            }
        }
    }
}
