//! HTTP client for upstream media fetches.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Consistent timeouts and headers
//! * Retries with exponential backoff for transient failures
//! * Range requests to resume a stream at a byte offset
//! * Classification of responses into [`FetchError`]
//!
//! # Retries
//!
//! A fetch is attempted once and then retried up to the configured number of
//! times, waiting `base`, `2 * base`, `4 * base` and so on in between. Only
//! transport errors and 408/429/5xx responses are retried. A 403, 404 or
//! 410 means the signed URL is no longer accepted, which retrying the same
//! URL cannot fix.
//!
//! # Example
//!
//! ```no_run
//! use streamrelay::{config::ProxyConfig, http::Client};
//! use url::Url;
//!
//! async fn example(url: Url) -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(&ProxyConfig::default())?;
//!     // Resume at 64 KiB.
//!     let response = client.open(&url, Some(65_536)).await?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use exponential_backoff::Backoff;
use reqwest::{
    header::{HeaderValue, ACCEPT, RANGE},
    Response, StatusCode, Url,
};
use thiserror::Error;

use crate::{config::ProxyConfig, error::Result};

/// Why an upstream fetch did not produce a usable response.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream refused the URL itself, typically because the signature
    /// expired.
    #[error("upstream rejected url with {0}")]
    Rejected(StatusCode),

    /// Any other unsuccessful status.
    #[error("upstream responded with {0}")]
    Status(StatusCode),

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl FetchError {
    /// Whether the same request may succeed when tried again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Rejected(_) => false,
        }
    }

    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                Self::Rejected(status)
            }
            _ => Self::Status(status),
        }
    }
}

/// Upstream HTTP client with retrying fetches.
#[derive(Clone, Debug)]
pub struct Client {
    inner: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl Client {
    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates a client using the upstream settings in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let user_agent = format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("audio/*, */*;q=0.8"));

        let inner = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(config.upstream_connect_timeout())
            .read_timeout(config.upstream_read_timeout())
            .default_headers(headers)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            inner,
            retries: config.upstream_retries,
            backoff: config.upstream_backoff(),
        })
    }

    /// Opens `url`, starting at byte `offset` if given.
    ///
    /// On success the response status is 200 or, for ranged requests that
    /// the upstream honored, 206. The body has not been read yet.
    ///
    /// # Errors
    ///
    /// Returns the last failure once retries are exhausted, or the first
    /// failure that is not transient.
    pub async fn open(&self, url: &Url, offset: Option<u64>) -> std::result::Result<Response, FetchError> {
        let host = url.host_str().unwrap_or("upstream");

        let max_backoff = self.backoff * 2_u32.saturating_pow(self.retries);
        let mut backoff = Backoff::new(self.retries + 1, self.backoff, max_backoff);
        backoff.set_factor(2);
        backoff.set_jitter(0.0);

        let mut last_error = None;
        for delay in &backoff {
            match self.try_open(url, offset).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => {
                    let Some(delay) = delay else {
                        last_error = Some(e);
                        break;
                    };
                    warn!(
                        "fetching from {host} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => self.try_open(url, offset).await,
        }
    }

    async fn try_open(&self, url: &Url, offset: Option<u64>) -> std::result::Result<Response, FetchError> {
        let mut request = self.inner.get(url.clone());
        if let Some(offset) = offset {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(FetchError::from_status(status))
        }
    }
}
