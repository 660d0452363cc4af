//! Core station abstraction and runner.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A processing stage of the pipeline.
///
/// Each station receives input, processes it, and produces output.
/// Stations run in their own threads and are connected by bounded channels.
pub trait Station: Send + 'static {
    /// The input type this station receives.
    type Input: Send + 'static;
    /// The output type this station produces.
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// Returns:
    /// - `Ok(Some(output))` - Successfully processed and produced output
    /// - `Ok(None)` - Successfully processed but no output (e.g., filtered)
    /// - `Err(StationError)` - Processing failed
    fn process(&mut self, input: Self::Input) -> Result<Option<Self::Output>, StationError>;

    /// Returns the name of this station for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Called once when the input closes or the station halts.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawns a station whose outputs are forwarded to `output_tx`.
    ///
    /// The station stops when `input_rx` disconnects, when `output_tx` has no
    /// receiver left, or when it halts.
    pub fn spawn(
        station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> std::io::Result<Self> {
        Self::spawn_with(station, input_rx, Some(output_tx), error_reporter)
    }

    /// Spawns a station at the end of a pipeline; its outputs are discarded.
    pub fn spawn_terminal(
        station: S,
        input_rx: Receiver<S::Input>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> std::io::Result<Self> {
        Self::spawn_with(station, input_rx, None, error_reporter)
    }

    fn spawn_with(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> std::io::Result<Self> {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("parley-{}", station_name.to_lowercase()))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            })?;

        Ok(Self {
            handle: Some(handle),
            station_name,
            _phantom: PhantomData,
        })
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Option<Sender<S::Output>>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();

        while let Ok(input) = input_rx.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if let Some(tx) = &output_tx
                        && tx.send(output).is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    error_reporter.report(station_name, &error);
                    if error.is_halt() {
                        break;
                    }
                }
            }
        }

        station.shutdown();
        tracing::debug!(station = station_name, "station stopped");
    }

    /// Waits for the station thread to complete.
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| format!("Station '{}' thread panicked", self.station_name))
        } else {
            Ok(())
        }
    }

    /// Returns the name of the station.
    pub fn name(&self) -> &'static str {
        self.station_name
    }
}
