//! Event channel payloads.
//!
//! Serialized shapes are what application code reads off a player's event
//! channel, so field names are fixed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::download::ClientDownloadState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PlayerEvent {
    /// Window length in milliseconds (0 when the source has no known length).
    Initialized { duration: u64 },
    BufferingStart,
    BufferingEnd,
    /// Buffered ranges; a single `[0, buffered_ms]` range.
    BufferingUpdate { values: Vec<u64> },
    #[serde(rename_all = "camelCase")]
    PlayStateChanged { is_playing: bool },
    Completed,
    DownloadState {
        state: ClientDownloadState,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        progress: Option<f32>,
    },
}

impl PlayerEvent {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Everything a sink can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SinkMessage {
    Success { event: PlayerEvent },
    Error {
        code: String,
        message: String,
        details: Option<String>,
    },
    EndOfStream,
}

impl SinkMessage {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn event(&self) -> Option<&PlayerEvent> {
        match self {
            SinkMessage::Success { event } => Some(event),
            _ => None,
        }
    }
}
