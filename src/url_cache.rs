use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use url::Url;

use crate::errors::FixErrorKind;

/// Why a URL's body could not be retrieved. Failures are cached, so a broken
/// URL costs one request per process.
#[derive(Error, Debug, Clone)]
pub enum UrlError {
    #[error("bad URL {url}: {reason}")]
    BadUrl { url: String, reason: String },

    #[error("request for {url} failed: {reason}")]
    FailedHttpRequest { url: String, reason: String },

    #[error("{url} returned HTTP {status}")]
    CannotFetchUrl { url: String, status: u16 },
}

impl UrlError {
    pub fn kind(&self) -> FixErrorKind {
        match self {
            UrlError::BadUrl { .. } => FixErrorKind::BadUrl,
            UrlError::FailedHttpRequest { .. } => FixErrorKind::FailedHttpRequest,
            UrlError::CannotFetchUrl { .. } => FixErrorKind::CannotFetchUrl,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            UrlError::BadUrl { url, .. }
            | UrlError::FailedHttpRequest { url, .. }
            | UrlError::CannotFetchUrl { url, .. } => url,
        }
    }
}

#[derive(Clone)]
enum Fetched {
    Body(Arc<Vec<u8>>),
    Failed(UrlError),
}

/// Process-lifetime cache of HTTP GET bodies, keyed by URL. The first call
/// for a URL performs the fetch; both successes and definitive failures are
/// cached and never invalidated. Concurrent first calls for the same URL may
/// each issue a request; the last writer wins, which is harmless because the
/// body for a URL does not change within a run.
pub struct UrlCache {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, Fetched>>,
}

impl UrlCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, raw_url: &str) -> Result<Arc<Vec<u8>>, UrlError> {
        let hit = self
            .cache
            .lock()
            .expect("url cache poisoned")
            .get(raw_url)
            .cloned();
        if let Some(found) = hit {
            tracing::trace!(url = raw_url, "URL cache hit");
            return match found {
                Fetched::Body(body) => Ok(body),
                Fetched::Failed(err) => Err(err),
            };
        }

        let result = self.fetch(raw_url).await;
        let entry = match &result {
            Ok(body) => Fetched::Body(body.clone()),
            Err(err) => {
                tracing::debug!(url = raw_url, error = %err, "caching failed fetch");
                Fetched::Failed(err.clone())
            }
        };
        self.cache
            .lock()
            .expect("url cache poisoned")
            .insert(raw_url.to_string(), entry);
        result
    }

    /// Pre-seeds the cache so `url` resolves to `body` without any network
    /// traffic.
    pub fn prime(&self, url: &str, body: Vec<u8>) {
        self.cache
            .lock()
            .expect("url cache poisoned")
            .insert(url.to_string(), Fetched::Body(Arc::new(body)));
    }

    async fn fetch(&self, raw_url: &str) -> Result<Arc<Vec<u8>>, UrlError> {
        let parsed = Url::parse(raw_url).map_err(|e| UrlError::BadUrl {
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(UrlError::BadUrl {
                url: raw_url.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }

        let response =
            self.client
                .get(parsed)
                .send()
                .await
                .map_err(|e| UrlError::FailedHttpRequest {
                    url: raw_url.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(UrlError::CannotFetchUrl {
                url: raw_url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| UrlError::FailedHttpRequest {
                url: raw_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(body.to_vec()))
    }
}
