//! Reassembly of transcript events into a running conversation.
//!
//! Events for the same `result_id` supersede each other; the first event for
//! an id opens a new utterance and a final event closes it. Anything that
//! arrives for a closed utterance is ignored.

use crate::transcription::TranscriptEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub result_id: String,
    pub text: String,
    pub in_progress: bool,
    pub updated_at: DateTime<Utc>,
}

/// What applying an event did to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new utterance was appended.
    Opened,
    /// An in-progress utterance had its text replaced.
    Updated,
    /// The event closed its utterance.
    Closed,
    /// The utterance was already closed; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    utterances: Vec<Utterance>,
    index: HashMap<String, usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TranscriptEvent) -> Applied {
        match self.index.get(&event.result_id) {
            None => {
                self.index
                    .insert(event.result_id.clone(), self.utterances.len());
                self.utterances.push(Utterance {
                    result_id: event.result_id.clone(),
                    text: event.text.clone(),
                    in_progress: !event.is_final,
                    updated_at: event.timestamp,
                });
                if event.is_final {
                    Applied::Closed
                } else {
                    Applied::Opened
                }
            }
            Some(&position) => {
                let utterance = &mut self.utterances[position];
                if !utterance.in_progress {
                    return Applied::Ignored;
                }
                utterance.text.clone_from(&event.text);
                utterance.updated_at = event.timestamp;
                if event.is_final {
                    utterance.in_progress = false;
                    Applied::Closed
                } else {
                    Applied::Updated
                }
            }
        }
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    /// Text of every closed utterance, in order.
    pub fn finalized_text(&self) -> Vec<&str> {
        self.utterances
            .iter()
            .filter(|u| !u.in_progress)
            .map(|u| u.text.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}
