//! Conversation history: an append-only sequence of turns
//!
//! Only the last turn may be open. Text can be appended to an open turn until
//! it is completed; a completed turn is never modified again.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "agent",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One speaker contribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Agent turn cut short by barge-in
    #[serde(default)]
    pub interrupted: bool,
}

impl Turn {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new turn. Fails while another turn is still open.
    pub fn begin(&mut self, speaker: Speaker) -> VoiceResult<usize> {
        if let Some(index) = self.open_index() {
            return Err(VoiceError::TurnStillOpen(index));
        }
        self.turns.push(Turn {
            speaker,
            text: String::new(),
            started_at: Utc::now(),
            completed_at: None,
            interrupted: false,
        });
        Ok(self.turns.len() - 1)
    }

    /// Append text to the open turn at `index`.
    pub fn append(&mut self, index: usize, text: &str) -> VoiceResult<()> {
        let turn = self.turns.get_mut(index).ok_or(VoiceError::NoOpenTurn)?;
        if turn.is_complete() {
            return Err(VoiceError::TurnCompleted(index));
        }
        turn.text.push_str(text);
        Ok(())
    }

    /// Mark the turn at `index` complete. Its text is trimmed once, here.
    pub fn complete(&mut self, index: usize, interrupted: bool) -> VoiceResult<&Turn> {
        let turn = self.turns.get_mut(index).ok_or(VoiceError::NoOpenTurn)?;
        if turn.is_complete() {
            return Err(VoiceError::TurnCompleted(index));
        }
        let trimmed = turn.text.trim().to_string();
        turn.text = trimmed;
        turn.interrupted = interrupted;
        turn.completed_at = Some(Utc::now());
        Ok(turn)
    }

    /// Append an already finished turn.
    pub fn push_complete(&mut self, speaker: Speaker, text: &str) -> VoiceResult<&Turn> {
        let index = self.begin(speaker)?;
        self.append(index, text)?;
        self.complete(index, false)
    }

    /// Index of the open turn, if any
    pub fn open_index(&self) -> Option<usize> {
        self.turns
            .last()
            .filter(|t| !t.is_complete())
            .map(|_| self.turns.len() - 1)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Completed turns, oldest first
    pub fn completed(&self) -> Vec<Turn> {
        self.turns.iter().filter(|t| t.is_complete()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Plain-text transcript, one `speaker: text` line per completed turn.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .filter(|t| t.is_complete() && !t.text.is_empty())
            .map(|t| format!("{}: {}", t.speaker, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
