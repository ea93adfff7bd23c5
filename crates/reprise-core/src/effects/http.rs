//! HTTP fetcher: streams remote audio for playback and downloads.
//!
//! Feature-gated behind `http` to keep the default build minimal.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::download::{FetchResponse, Fetcher};
use crate::error::{PluginError, Result};

pub struct HttpFetcher {
    agent: ureq::Agent,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(config: &EngineConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.request_timeout_secs)))
            .build()
            .into();
        Self {
            agent,
            user_agent: config.user_agent.clone(),
        }
    }

    fn get(&self, uri: &str, offset: u64) -> std::result::Result<FetchResponse, ureq::Error> {
        let mut request = self.agent.get(uri).header("User-Agent", self.user_agent.as_str());
        if offset > 0 {
            request = request.header("Range", range_header(offset).as_str());
        }
        let response = request.call()?;

        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let resumed = response.status().as_u16() == 206;
        Ok(FetchResponse {
            content_length,
            resumed,
            reader: Box::new(response.into_body().into_reader()),
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &str, offset: u64) -> Result<FetchResponse> {
        fetch_resuming(uri, offset, |from| self.get(uri, from))
    }
}

/// GET from `offset`, falling back to the whole body when the server
/// rejects the range.
fn fetch_resuming(
    uri: &str,
    offset: u64,
    get: impl Fn(u64) -> std::result::Result<FetchResponse, ureq::Error>,
) -> Result<FetchResponse> {
    match get(offset) {
        Ok(response) => Ok(response),
        // Partial file is stale or already complete: start over.
        Err(ureq::Error::StatusCode(416)) if offset > 0 => {
            log::info!("reprise: range rejected for {}, restarting", uri);
            get(0).map_err(|e| fetch_error(uri, e))
        }
        Err(e) => Err(fetch_error(uri, e)),
    }
}

fn fetch_error(uri: &str, e: ureq::Error) -> PluginError {
    PluginError::Download(format!("GET {}: {}", uri, e))
}

fn range_header(offset: u64) -> String {
    format!("bytes={}-", offset)
}
