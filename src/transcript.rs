//! Turn-scoped accumulation of partial transcripts into an append-only log.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Sender {
    /// Speech captured from the local microphone
    Local,
    /// Speech synthesized by the remote service
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp_ms: i64,
}

impl TranscriptEntry {
    fn new(sender: Sender, text: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            text,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    local_partial: String,
    remote_partial: String,
    log: Vec<TranscriptEntry>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_partial(&mut self, sender: Sender, text: &str) {
        match sender {
            Sender::Local => self.local_partial.push_str(text),
            Sender::Remote => self.remote_partial.push_str(text),
        }
    }

    pub fn partial(&self, sender: Sender) -> &str {
        match sender {
            Sender::Local => &self.local_partial,
            Sender::Remote => &self.remote_partial,
        }
    }

    /// Flush the current turn: one entry per non-empty accumulator, local
    /// first. Both accumulators are reset. Returns the entries appended.
    pub fn complete_turn(&mut self) -> &[TranscriptEntry] {
        let before = self.log.len();

        let local = std::mem::take(&mut self.local_partial);
        let remote = std::mem::take(&mut self.remote_partial);

        if !local.is_empty() {
            self.log.push(TranscriptEntry::new(Sender::Local, local));
        }
        if !remote.is_empty() {
            self.log.push(TranscriptEntry::new(Sender::Remote, remote));
        }

        &self.log[before..]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.log
    }
}
