//! Data sources: where a player's audio comes from.
//!
//! Assets resolve under the host's asset root; `file://` URIs and bare
//! paths are local files; `http(s)` URIs stream from the network unless a
//! completed download of the same URI is sitting in the cache.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::download::{DownloadManager, DownloadTracker};
use crate::effects::ResolvedSource;
use crate::error::{PluginError, Result};
use crate::models::args::ArgsExt;
use crate::models::download::DownloadState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Asset {
        asset: String,
        package: Option<String>,
    },
    Uri(String),
}

impl DataSource {
    /// `asset` (with optional `package`) wins over `uri`.
    pub fn from_args(args: &Value) -> Result<Self> {
        if let Some(asset) = args.str_field("asset") {
            return Ok(DataSource::Asset {
                asset: asset.to_string(),
                package: args.str_field("package").map(String::from),
            });
        }
        match args.str_field("uri") {
            Some(uri) if !uri.is_empty() => Ok(DataSource::Uri(uri.to_string())),
            _ => Err(PluginError::InvalidArguments(
                "either 'asset' or 'uri' is required".into(),
            )),
        }
    }

    /// Lookup key of an asset inside the host bundle.
    pub fn asset_key(&self) -> Option<String> {
        match self {
            DataSource::Asset { asset, package } => Some(asset_key(asset, package.as_deref())),
            DataSource::Uri(_) => None,
        }
    }

    /// Network URI, if this source streams.
    pub fn remote_uri(&self) -> Option<&str> {
        match self {
            DataSource::Uri(uri) if is_http_url(uri) => Some(uri),
            _ => None,
        }
    }

    /// Local files and assets are never downloaded.
    pub fn is_file_or_asset(&self) -> bool {
        self.remote_uri().is_none()
    }
}

/// Maps data sources to something the audio backend can open.
pub struct SourceResolver {
    asset_root: PathBuf,
    tracker: Arc<DownloadTracker>,
    downloads: Arc<DownloadManager>,
}

impl SourceResolver {
    pub fn new(asset_root: PathBuf, tracker: Arc<DownloadTracker>, downloads: Arc<DownloadManager>) -> Self {
        Self {
            asset_root,
            tracker,
            downloads,
        }
    }

    pub fn resolve(&self, source: &DataSource) -> Result<ResolvedSource> {
        let uri = match source {
            DataSource::Asset { asset, package } => {
                let key = asset_key(asset, package.as_deref());
                let path = self.asset_root.join(&key);
                if !path.is_file() {
                    return Err(PluginError::AssetNotFound(key));
                }
                return Ok(ResolvedSource::Local(path));
            }
            DataSource::Uri(uri) => uri,
        };
        if is_http_url(uri) {
            return Ok(self.resolve_remote(uri));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(ResolvedSource::Local(PathBuf::from(path)));
        }
        if uri.contains("://") {
            return Err(PluginError::InvalidArguments(format!("unsupported uri: {}", uri)));
        }
        Ok(ResolvedSource::Local(PathBuf::from(uri)))
    }

    /// Cached bytes win once the download has completed.
    fn resolve_remote(&self, uri: &str) -> ResolvedSource {
        let completed = self
            .tracker
            .download(uri)
            .map_or(false, |d| d.state == DownloadState::Completed);
        if completed {
            let cached = self.downloads.cached_file(uri);
            if cached.is_file() {
                log::debug!("reprise: playing {} from cache", uri);
                return ResolvedSource::Local(cached);
            }
        }
        ResolvedSource::Remote(uri.to_string())
    }
}

fn asset_key(asset: &str, package: Option<&str>) -> String {
    match package {
        Some(package) => format!("flutter_assets/packages/{}/{}", package, asset),
        None => format!("flutter_assets/{}", asset),
    }
}

/// Extract file extension from a URL, stripping query parameters.
///
/// `"https://example.com/song.mp3?token=abc"` → `Some("mp3")`
pub fn extension_from_url(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let path = path.split('#').next().unwrap_or(path);
    let segment = path.rsplit('/').next()?;
    let ext = segment.rsplit('.').next()?;
    if ext == segment || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Check if a path looks like an HTTP URL.
pub fn is_http_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::download::DownloadListener;
    use crate::models::download::{Download, DownloadRequest};
    use crate::test_support::{temp_shell, MemoryFetcher};

    #[test]
    fn asset_wins_over_uri() {
        let args = serde_json::json!({"asset": "audio/a.mp3", "package": "tunes", "uri": "https://x/y.mp3"});
        let source = DataSource::from_args(&args).unwrap();
        assert_eq!(
            source.asset_key().as_deref(),
            Some("flutter_assets/packages/tunes/audio/a.mp3")
        );
        assert!(source.is_file_or_asset());

        let plain = DataSource::from_args(&serde_json::json!({"asset": "a.mp3"})).unwrap();
        assert_eq!(plain.asset_key().as_deref(), Some("flutter_assets/a.mp3"));
    }

    #[test]
    fn missing_source_is_invalid() {
        let err = DataSource::from_args(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.code(), "Unknown arguments");
    }

    #[test]
    fn remote_uri_detection() {
        let remote = DataSource::Uri("https://cdn.example.com/a.mp3".into());
        assert_eq!(remote.remote_uri(), Some("https://cdn.example.com/a.mp3"));
        assert!(!remote.is_file_or_asset());
        assert!(DataSource::Uri("file:///tmp/a.mp3".into()).is_file_or_asset());
    }

    #[test]
    fn resolution_prefers_completed_cache() {
        let (dir, shell, _guard) = temp_shell("test-source");
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            asset_root: dir.path().join("bundle"),
            ..EngineConfig::default()
        };
        std::fs::create_dir_all(config.asset_root.join("flutter_assets")).unwrap();
        std::fs::write(config.asset_root.join("flutter_assets/a.mp3"), b"x").unwrap();

        let manager = Arc::new(DownloadManager::new(shell, &config, Arc::new(MemoryFetcher::new())));
        let tracker = Arc::new(DownloadTracker::new(Vec::new()));
        let resolver = SourceResolver::new(config.asset_root.clone(), tracker.clone(), manager.clone());

        let asset = DataSource::Asset { asset: "a.mp3".into(), package: None };
        assert_eq!(
            resolver.resolve(&asset).unwrap(),
            ResolvedSource::Local(config.asset_root.join("flutter_assets/a.mp3"))
        );
        let missing = DataSource::Asset { asset: "b.mp3".into(), package: None };
        assert_eq!(resolver.resolve(&missing).unwrap_err().code(), "AssetNotFound");

        let uri = "https://cdn.example.com/a.mp3";
        let remote = DataSource::Uri(uri.into());
        assert_eq!(resolver.resolve(&remote).unwrap(), ResolvedSource::Remote(uri.into()));

        let mut done = Download::queued(DownloadRequest::new(uri, ""), 0);
        done.state = DownloadState::Completed;
        tracker.on_download_changed(&done);
        // Completed but the file is gone: stream.
        assert_eq!(resolver.resolve(&remote).unwrap(), ResolvedSource::Remote(uri.into()));

        std::fs::write(manager.cached_file(uri), b"bytes").unwrap();
        assert_eq!(
            resolver.resolve(&remote).unwrap(),
            ResolvedSource::Local(manager.cached_file(uri))
        );

        assert_eq!(
            resolver.resolve(&DataSource::Uri("file:///tmp/x.wav".into())).unwrap(),
            ResolvedSource::Local(PathBuf::from("/tmp/x.wav"))
        );
        assert!(resolver.resolve(&DataSource::Uri("rtsp://x/y".into())).is_err());
    }

    #[test]
    fn extension_from_url_strips_query() {
        assert_eq!(
            extension_from_url("https://example.com/song.mp3?token=abc"),
            Some("mp3".into())
        );
        assert_eq!(
            extension_from_url("https://cdn.example.com/audio/track.FLAC"),
            Some("flac".into())
        );
        assert_eq!(extension_from_url("https://example.com/stream"), None);
    }

    #[test]
    fn is_http_url_checks_scheme() {
        assert!(is_http_url("https://example.com/song.mp3"));
        assert!(is_http_url("http://example.com/song.mp3"));
        assert!(!is_http_url("/home/user/song.mp3"));
    }
}
