//! Errors surfaced on the method channel.

use nine_s_core::errors::NineSError;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("No audio player associated with player id {0}")]
    UnknownPlayer(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("method not implemented: {0}")]
    NotImplemented(String),

    #[error("asset not found: {0}")]
    AssetNotFound(String),

    #[error("download error: {0}")]
    Download(String),

    #[error("store error: {0}")]
    Store(String),
}

impl PluginError {
    /// Error code as seen by application code.
    pub fn code(&self) -> &'static str {
        match self {
            PluginError::UnknownPlayer(_) => "Unknown playerId",
            PluginError::InvalidArguments(_) => "Unknown arguments",
            PluginError::NotImplemented(_) => "NotImplemented",
            PluginError::AssetNotFound(_) => "AssetNotFound",
            PluginError::Download(_) => "DownloadError",
            PluginError::Store(_) => "StoreError",
        }
    }

    /// `{code, message, details}` payload for the host.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": Value::Null,
        })
    }

}

impl From<NineSError> for PluginError {
    fn from(e: NineSError) -> Self {
        PluginError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// Log errors from scroll operations without panicking.
pub(crate) fn log_err<T, E: std::fmt::Display>(result: std::result::Result<T, E>, context: &str) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            log::warn!("reprise: {} failed: {}", context, e);
            false
        }
    }
}
