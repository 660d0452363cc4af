//! Conversation state of one session, owned by the dispatcher task.
//!
//! Nothing else holds a reference to it: every change arrives as a session
//! event and is applied here in arrival order.

use crate::prosody::{self, EmotionState, Prosody};
use crate::transcript::{Direction, TranscriptAccumulator};
use uuid::Uuid;

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    transcripts: TranscriptAccumulator,
    emotion: EmotionState,
    prosody_enabled: bool,
}

impl Session {
    pub fn new(id: Uuid, prosody_enabled: bool) -> Self {
        Self {
            id,
            transcripts: TranscriptAccumulator::new(),
            emotion: EmotionState::Neutral,
            prosody_enabled,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Apply a transcript delta.
    ///
    /// Returns the full buffer for display, or `None` for an empty delta.
    /// Output deltas also re-derive the tone for the next segment.
    pub fn on_transcript(&mut self, direction: Direction, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        let text = self.transcripts.append_delta(direction, delta).to_string();
        if direction == Direction::Output && self.prosody_enabled {
            let emotion = prosody::classify(&text);
            if emotion != self.emotion {
                tracing::debug!(session = %self.id, from = %self.emotion, to = %emotion, "tone changed");
                self.emotion = emotion;
            }
        }
        Some(text)
    }

    pub fn on_turn_complete(&mut self) {
        self.transcripts.on_turn_complete();
        self.emotion = EmotionState::Neutral;
    }

    pub fn on_interrupted(&mut self) {
        self.transcripts.on_interrupted();
        self.emotion = EmotionState::Neutral;
    }

    /// Prosody for the next segment to be enqueued.
    pub fn next_prosody(&self) -> Prosody {
        prosody::to_prosody(self.emotion)
    }

    pub fn emotion(&self) -> EmotionState {
        self.emotion
    }

    pub fn transcript(&self, direction: Direction) -> &str {
        self.transcripts.text(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_deltas_drive_prosody() {
        let mut session = Session::new(Uuid::new_v4(), true);

        assert_eq!(
            session.on_transcript(Direction::Output, "Great").as_deref(),
            Some("Great")
        );
        assert_eq!(
            session.on_transcript(Direction::Output, " job!").as_deref(),
            Some("Great job!")
        );
        assert_eq!(session.emotion(), EmotionState::Excited);
        assert!(session.next_prosody().rate > 1.0);
    }

    #[test]
    fn test_input_deltas_do_not_change_tone() {
        let mut session = Session::new(Uuid::new_v4(), true);
        session.on_transcript(Direction::Input, "I'm so sorry!");
        assert_eq!(session.emotion(), EmotionState::Neutral);
        assert_eq!(session.transcript(Direction::Input), "I'm so sorry!");
    }

    #[test]
    fn test_empty_delta_reports_nothing() {
        let mut session = Session::new(Uuid::new_v4(), true);
        assert_eq!(session.on_transcript(Direction::Output, ""), None);
    }

    #[test]
    fn test_turn_complete_resets_tone_and_text() {
        let mut session = Session::new(Uuid::new_v4(), true);
        session.on_transcript(Direction::Output, "Wow!");
        session.on_turn_complete();

        assert_eq!(session.emotion(), EmotionState::Neutral);
        assert_eq!(session.transcript(Direction::Output), "");
        assert_eq!(session.next_prosody(), Prosody::NEUTRAL);
    }

    #[test]
    fn test_interrupt_keeps_user_text() {
        let mut session = Session::new(Uuid::new_v4(), true);
        session.on_transcript(Direction::Input, "stop");
        session.on_transcript(Direction::Output, "Absolutely, as I");
        session.on_interrupted();

        assert_eq!(session.transcript(Direction::Input), "stop");
        assert_eq!(session.transcript(Direction::Output), "");
        assert_eq!(session.emotion(), EmotionState::Neutral);
    }

    #[test]
    fn test_disabled_prosody_stays_neutral() {
        let mut session = Session::new(Uuid::new_v4(), false);
        session.on_transcript(Direction::Output, "Amazing!!!");
        assert_eq!(session.next_prosody(), Prosody::NEUTRAL);
    }
}
