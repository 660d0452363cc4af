//! Transcript accumulation for both sides of the conversation.

use serde::{Deserialize, Serialize};

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// What the user said.
    Input,
    /// What the remote engine said.
    Output,
}

impl Direction {
    pub fn is_user(self) -> bool {
        matches!(self, Direction::Input)
    }
}

/// An accumulating string plus a generation counter.
///
/// The generation increases every time the buffer is reset, so a consumer can
/// tell a fresh turn from a continuation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBuffer {
    text: String,
    generation: u64,
}

impl TranscriptBuffer {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn push(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    fn reset(&mut self) {
        self.text.clear();
        self.generation += 1;
    }
}

/// Input and output transcripts for the current turn.
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    input: TranscriptBuffer,
    output: TranscriptBuffer,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return the full buffer for display.
    ///
    /// An empty delta leaves the buffer untouched.
    pub fn append_delta(&mut self, direction: Direction, delta: &str) -> &str {
        let buffer = self.buffer_mut(direction);
        if !delta.is_empty() {
            buffer.push(delta);
        }
        buffer.text()
    }

    /// The turn ended: both sides start over.
    pub fn on_turn_complete(&mut self) {
        self.input.reset();
        self.output.reset();
    }

    /// Barge-in: drop the half-spoken response, keep what the user said.
    pub fn on_interrupted(&mut self) {
        self.output.reset();
    }

    /// Session teardown.
    pub fn reset(&mut self) {
        self.on_turn_complete();
    }

    pub fn buffer(&self, direction: Direction) -> &TranscriptBuffer {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        }
    }

    pub fn text(&self, direction: Direction) -> &str {
        self.buffer(direction).text()
    }

    fn buffer_mut(&mut self, direction: Direction) -> &mut TranscriptBuffer {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }
}
