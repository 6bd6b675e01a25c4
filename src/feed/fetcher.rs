use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::parser::{parse_feed, ParsedFeed};
use crate::config::Config;
use crate::util::{validate_feed_url, UrlValidationError};

const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while retrieving and parsing one feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Feed URL rejected: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// A redirect pointed at a URL the host policy rejects
    #[error("Redirect rejected: {0}")]
    RedirectRejected(String),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Fetch + parse exceeded the configured bound (seconds)
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    /// Fatal parse failure: invalid XML or no recognizable feed root
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Retrieves and normalizes feed documents.
///
/// Every call is bounded by the configured timeout. Parsing runs on the
/// blocking pool so a large document never stalls the async workers; when the
/// bound is hit the in-flight work is abandoned and no partial result is used.
#[derive(Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
    allow_private_hosts: bool,
}

impl FeedFetcher {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy(config.allow_private_hosts))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Build a fetcher around an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            timeout: config.fetch_timeout(),
            max_bytes: config.max_feed_bytes,
            allow_private_hosts: config.allow_private_hosts,
        }
    }

    /// Validate and normalize a feed URL under this fetcher's host policy.
    pub fn check_url(&self, url: &str) -> Result<Url, UrlValidationError> {
        validate_feed_url(url, self.allow_private_hosts)
    }

    /// Fetch `url` and return its canonical descriptor and entries.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] - scheme or host rejected before any request
    /// - [`FetchError::Timeout`] - fetch + parse exceeded the bound
    /// - [`FetchError::Network`] / [`FetchError::HttpStatus`] - remote unreachable
    /// - [`FetchError::ResponseTooLarge`] / [`FetchError::IncompleteResponse`]
    /// - [`FetchError::Parse`] - document is not a usable feed
    pub async fn fetch(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let url = self.check_url(url)?;

        let fetch = self.fetch_and_parse(url.clone());
        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    url = %url,
                    timeout_secs = self.timeout.as_secs(),
                    "Feed fetch timed out"
                );
                Err(FetchError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    async fn fetch_and_parse(&self, url: Url) -> Result<ParsedFeed, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_send_error)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = read_limited_bytes(response, self.max_bytes).await?;
        let now = chrono::Utc::now().timestamp();

        let parsed = tokio::task::spawn_blocking(move || {
            parse_feed(&bytes, &url, content_type.as_deref(), now)
        })
        .await
        .map_err(|e| FetchError::Parse(format!("parser task failed: {}", e)))??;

        for anomaly in &parsed.anomalies {
            tracing::warn!(
                url = %parsed.descriptor.url,
                anomaly = %anomaly,
                "Survivable feed anomaly, continuing"
            );
        }

        tracing::debug!(
            url = %parsed.descriptor.url,
            version = %parsed.descriptor.version,
            entries = parsed.entries.len(),
            "Feed parsed"
        );

        Ok(parsed)
    }
}

/// Redirect policy that re-applies the feed URL rules on every hop.
fn redirect_policy(allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        let checked = check_redirect(attempt.url(), attempt.previous(), allow_private_hosts);
        if let Err(e) = checked {
            return attempt.error(e);
        }
        tracing::debug!(
            to = %attempt.url(),
            hop = attempt.previous().len(),
            "Following redirect"
        );
        attempt.follow()
    })
}

#[derive(Debug, Error)]
enum RedirectError {
    #[error("too many redirects (max {0})")]
    TooMany(usize),
    #[error("redirect loop detected")]
    Loop,
    #[error(transparent)]
    Rejected(#[from] UrlValidationError),
}

/// `previous` holds every URL already requested, starting with the original.
fn check_redirect(
    next: &Url,
    previous: &[Url],
    allow_private_hosts: bool,
) -> Result<(), RedirectError> {
    if previous.len() > MAX_REDIRECTS {
        return Err(RedirectError::TooMany(MAX_REDIRECTS));
    }
    if previous.iter().any(|p| p == next) {
        return Err(RedirectError::Loop);
    }
    validate_feed_url(next.as_str(), allow_private_hosts)?;
    Ok(())
}

/// Surface a policy-rejected redirect as a validation failure.
fn classify_send_error(err: reqwest::Error) -> FetchError {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(RedirectError::Rejected(rejected)) = cause.downcast_ref::<RedirectError>() {
            return FetchError::RedirectRejected(rejected.to_string());
        }
        source = cause.source();
    }
    FetchError::Network(err)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
