//! Prosody modulation: infer a tone from the response text and map it to a
//! playback rate and gain.
//!
//! The classifier is lexical only. It scores keyword classes plus
//! punctuation and picks the strongest; nothing matched means neutral.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionState {
    #[default]
    Neutral,
    Excited,
    Empathetic,
    Confident,
    Curious,
}

impl fmt::Display for EmotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EmotionState::Neutral => "neutral",
            EmotionState::Excited => "excited",
            EmotionState::Empathetic => "empathetic",
            EmotionState::Confident => "confident",
            EmotionState::Curious => "curious",
        };
        f.write_str(name)
    }
}

const EXCITED_WORDS: &[&str] = &[
    "great",
    "awesome",
    "amazing",
    "fantastic",
    "wonderful",
    "excellent",
    "incredible",
    "brilliant",
    "congratulations",
    "congrats",
    "wow",
    "yay",
    "love",
    "exciting",
];

const EMPATHETIC_WORDS: &[&str] = &[
    "sorry",
    "apologize",
    "apologies",
    "unfortunately",
    "understand",
    "sad",
    "difficult",
    "condolences",
    "regret",
    "afraid",
];

const CONFIDENT_WORDS: &[&str] = &[
    "definitely",
    "certainly",
    "absolutely",
    "clearly",
    "sure",
    "exactly",
    "guaranteed",
    "confident",
    "undoubtedly",
];

const CURIOUS_WORDS: &[&str] = &[
    "what", "why", "how", "which", "wonder", "curious", "tell", "interesting",
];

/// Tie-break order when two classes score the same.
const PRIORITY: [EmotionState; 4] = [
    EmotionState::Empathetic,
    EmotionState::Excited,
    EmotionState::Curious,
    EmotionState::Confident,
];

/// Classify the response so far.
pub fn classify(text: &str) -> EmotionState {
    let mut scores = [0u32; 4];
    let slot = |emotion: EmotionState| PRIORITY.iter().position(|e| *e == emotion).unwrap_or(0);

    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        let word = word.as_str();
        if EXCITED_WORDS.contains(&word) {
            scores[slot(EmotionState::Excited)] += 1;
        }
        if EMPATHETIC_WORDS.contains(&word) {
            scores[slot(EmotionState::Empathetic)] += 1;
        }
        if CONFIDENT_WORDS.contains(&word) {
            scores[slot(EmotionState::Confident)] += 1;
        }
        if CURIOUS_WORDS.contains(&word) {
            scores[slot(EmotionState::Curious)] += 1;
        }
    }

    let exclamations = text.matches('!').count() as u32;
    let questions = text.matches('?').count() as u32;
    scores[slot(EmotionState::Excited)] += exclamations;
    scores[slot(EmotionState::Curious)] += questions;

    let best = scores.iter().copied().max().unwrap_or(0);
    if best == 0 {
        return EmotionState::Neutral;
    }
    // First in priority order among the top scorers.
    PRIORITY
        .iter()
        .zip(scores)
        .find(|(_, score)| *score == best)
        .map(|(emotion, _)| *emotion)
        .unwrap_or_default()
}

/// Playback modulation applied to one segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prosody {
    pub rate: f32,
    pub gain: f32,
}

impl Default for Prosody {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

impl Prosody {
    pub const NEUTRAL: Prosody = Prosody {
        rate: 1.0,
        gain: 1.0,
    };

    /// Force into an audible range. Non-finite values fall back to 1.0.
    pub fn clamped(self, min_rate: f32, max_rate: f32, max_gain: f32) -> Self {
        let rate = if self.rate.is_finite() { self.rate } else { 1.0 };
        let gain = if self.gain.is_finite() { self.gain } else { 1.0 };
        Self {
            rate: rate.clamp(min_rate, max_rate),
            gain: gain.clamp(0.0, max_gain),
        }
    }
}

/// Fixed lookup from tone to rate and gain.
pub fn to_prosody(emotion: EmotionState) -> Prosody {
    match emotion {
        EmotionState::Neutral => Prosody::NEUTRAL,
        EmotionState::Excited => Prosody {
            rate: 1.12,
            gain: 1.1,
        },
        EmotionState::Empathetic => Prosody {
            rate: 0.92,
            gain: 0.9,
        },
        EmotionState::Confident => Prosody {
            rate: 1.04,
            gain: 1.05,
        },
        EmotionState::Curious => Prosody {
            rate: 1.06,
            gain: 1.0,
        },
    }
}
