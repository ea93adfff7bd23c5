//! Download records, persisted as scrolls under `/reprise/downloads`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Download manager state of a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Downloading,
    Completed,
    Failed,
    Removing,
}

/// What to download and the opaque data that travels with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: String,
    pub uri: String,
    /// Notification title as UTF-8 bytes.
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl DownloadRequest {
    pub fn new(uri: &str, name: &str) -> Self {
        Self {
            id: download_id(uri),
            uri: uri.to_string(),
            data: name.as_bytes().to_vec(),
        }
    }

    /// Request data as a display title (lossy UTF-8).
    pub fn title(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub request: DownloadRequest,
    pub state: DownloadState,
    #[serde(default)]
    pub bytes_downloaded: u64,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub start_time_ms: i64,
    #[serde(default)]
    pub update_time_ms: i64,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Download {
    pub fn queued(request: DownloadRequest, now_ms: i64) -> Self {
        Self {
            request,
            state: DownloadState::Queued,
            bytes_downloaded: 0,
            content_length: None,
            start_time_ms: now_ms,
            update_time_ms: now_ms,
            failure_reason: None,
        }
    }

    /// Percentage in `[0, 100]`, or `-1.0` when the length is unknown.
    pub fn percent_downloaded(&self) -> f32 {
        if self.state == DownloadState::Completed {
            return 100.0;
        }
        match self.content_length {
            Some(0) => 100.0,
            Some(len) => ((self.bytes_downloaded as f64 * 100.0) / len as f64).min(100.0) as f32,
            None => -1.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DownloadState::Completed | DownloadState::Failed)
    }
}

/// Download state as reported to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientDownloadState {
    Undownloaded = 0,
    Downloading = 1,
    Completed = 2,
    Error = 3,
}

impl ClientDownloadState {
    /// Unknown downloads, queued ones and ones being removed all read as
    /// not downloaded.
    pub fn from_download(download: Option<&Download>) -> (Self, Option<f32>) {
        match download.map(|d| d.state) {
            Some(DownloadState::Completed) => (ClientDownloadState::Completed, None),
            Some(DownloadState::Downloading) => (
                ClientDownloadState::Downloading,
                download.map(|d| d.percent_downloaded()),
            ),
            Some(DownloadState::Failed) => (ClientDownloadState::Error, None),
            _ => (ClientDownloadState::Undownloaded, None),
        }
    }
}

impl Serialize for ClientDownloadState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ClientDownloadState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(ClientDownloadState::Undownloaded),
            1 => Ok(ClientDownloadState::Downloading),
            2 => Ok(ClientDownloadState::Completed),
            3 => Ok(ClientDownloadState::Error),
            other => Err(serde::de::Error::custom(format!(
                "unknown download state {}",
                other
            ))),
        }
    }
}

/// Stable download id for a URI; FNV-1a, so the same URI maps to the same
/// id (and cache file) across runs.
pub fn download_id(uri: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in uri.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
