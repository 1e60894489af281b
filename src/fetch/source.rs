//! HTTP access seam for gallery pages and images

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::trace;

/// Boxed future returned by object-safe async traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Default User-Agent; some image hosts reject requests without one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors from fetching or parsing a remote page
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {detail}")]
    Transport { url: String, detail: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("no image found on {url}: {detail}")]
    Parse { url: String, detail: String },

    #[error("empty response body from {0}")]
    EmptyBody(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn parse(url: &str, detail: impl Into<String>) -> Self {
        Self::Parse {
            url: url.to_string(),
            detail: detail.into(),
        }
    }
}

/// Async access to remote gallery pages.
///
/// Implemented over `reqwest` for real use and in memory for tests.
pub trait PageSource: Send + Sync {
    /// Fetch a page as text.
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>>;

    /// Fetch raw bytes (an image).
    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;
}

/// `PageSource` backed by a pooled async `reqwest` client.
#[derive(Clone)]
pub struct ReqwestSource {
    client: reqwest::Client,
}

impl ReqwestSource {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_options(Duration::from_secs(DEFAULT_TIMEOUT_SECS), DEFAULT_USER_AGENT)
    }

    pub fn with_options(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        trace!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

impl PageSource for ReqwestSource {
    fn fetch_text<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            self.get(url)
                .await?
                .text()
                .await
                .map_err(|e| FetchError::Transport {
                    url: url.to_string(),
                    detail: format!("failed to read body: {e}"),
                })
        })
    }

    fn fetch_bytes<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(async move {
            let body = self
                .get(url)
                .await?
                .bytes()
                .await
                .map_err(|e| FetchError::Transport {
                    url: url.to_string(),
                    detail: format!("failed to read body: {e}"),
                })?;

            if body.is_empty() {
                return Err(FetchError::EmptyBody(url.to_string()));
            }
            Ok(body.to_vec())
        })
    }
}
