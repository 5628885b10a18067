//! HTTP client with bounded retries for transport failures.
//!
//! Only connection errors and timeouts are retried. Any HTTP status, including
//! 4xx/5xx, is handed back to the caller as a normal response.

use std::time::Duration;

use reqwest::{Client, Method, Response};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::constants::{ARCHIVAL_USER_AGENT, ARCHIVE_COOLDOWN, ARCHIVE_HOST};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to fetch {url} after {attempts} attempts: {last_error}")]
    RetryLimitExceeded {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Retry and timeout policy shared by every request of a client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Attempts per request, including the first one.
    pub max_tries: u32,
    /// Limit on connecting, on waiting for the response head and on each gap
    /// between body reads. A slow body that keeps arriving is never cut off.
    pub timeout: Duration,
    /// Base of the exponential backoff, in seconds.
    pub backoff_factor: f64,
    /// Extra wait when the archive host refuses connections.
    pub archive_cooldown: Duration,
    /// Host that gets the cooldown treatment.
    pub archive_host: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_tries: 5,
            timeout: Duration::from_secs(30),
            backoff_factor: 0.5,
            archive_cooldown: ARCHIVE_COOLDOWN,
            archive_host: ARCHIVE_HOST.to_string(),
        }
    }
}

/// Per-request overrides.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    query: Vec<(String, String)>,
    max_tries: Option<u32>,
    timeout: Option<Duration>,
    follow_redirects: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            query: Vec::new(),
            max_tries: None,
            timeout: None,
            follow_redirects: true,
        }
    }
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Return 3xx responses as-is instead of following them.
    #[must_use]
    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }
}

/// Retrying HTTP client.
///
/// Cheap to clone; the underlying connection pools are shared.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    no_redirect_client: Client,
    settings: HttpSettings,
}

impl HttpClient {
    /// Create a client with the given retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(settings: HttpSettings) -> Result<Self, HttpError> {
        let build = |policy: reqwest::redirect::Policy| {
            Client::builder()
                .user_agent(ARCHIVAL_USER_AGENT)
                .connect_timeout(settings.timeout)
                .read_timeout(settings.timeout)
                .redirect(policy)
                .build()
                .map_err(|e| HttpError::Request {
                    url: String::new(),
                    source: e,
                })
        };

        Ok(Self {
            client: build(reqwest::redirect::Policy::limited(10))?,
            no_redirect_client: build(reqwest::redirect::Policy::none())?,
            settings,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Send a request, retrying transport failures with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::RetryLimitExceeded`] once every attempt failed at the
    /// transport level, or [`HttpError::Request`] for non-transport failures such
    /// as a malformed URL.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        let max_tries = options.max_tries.unwrap_or(self.settings.max_tries).max(1);
        let timeout = options.timeout.unwrap_or(self.settings.timeout);
        let client = if options.follow_redirects {
            &self.client
        } else {
            &self.no_redirect_client
        };
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        let mut last_error = String::new();
        for attempt in 1..=max_tries {
            let mut builder = client.request(method.clone(), url);
            if !options.query.is_empty() {
                builder = builder.query(&options.query);
            }

            // Only the wait for the response head is bounded here; the body
            // is governed by the client's read timeout.
            last_error = match tokio::time::timeout(timeout, builder.send()).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if is_transport_error(&e) => error_chain(&e),
                Ok(Err(e)) => {
                    return Err(HttpError::Request {
                        url: url.to_string(),
                        source: e,
                    })
                }
                Err(_) => format!("no response within {}s", timeout.as_secs_f64()),
            };
            debug!(
                url = %url,
                attempt,
                max_tries,
                error = %last_error,
                "Transport error"
            );
            if attempt == max_tries {
                break;
            }

            if host.as_deref() == Some(self.settings.archive_host.as_str())
                && is_archive_overload(&last_error)
            {
                warn!(
                    cooldown_secs = self.settings.archive_cooldown.as_secs(),
                    "Wayback Machine has overheated, cooling off"
                );
                sleep(self.settings.archive_cooldown).await;
            }
            sleep(self.backoff_delay(attempt)).await;
        }

        Err(HttpError::RetryLimitExceeded {
            url: url.to_string(),
            attempts: max_tries,
            last_error,
        })
    }

    /// GET with default options.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, &RequestOptions::default())
            .await
    }

    /// GET with explicit options.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn get_with(&self, url: &str, options: &RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::GET, url, options).await
    }

    /// HEAD with default options.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::HEAD, url, &RequestOptions::default())
            .await
    }

    /// HEAD with explicit options.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::request`].
    pub async fn head_with(&self, url: &str, options: &RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::HEAD, url, options).await
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.settings.backoff_factor * 2f64.powi(attempt as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

fn is_transport_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

/// Check whether an error message means the archive host refused the connection.
///
/// The Wayback Machine drops connections outright when it is rate limiting,
/// which surfaces as `ECONNREFUSED` (errno 61 on macOS, 111 on Linux).
#[must_use]
pub fn is_archive_overload(message: &str) -> bool {
    message.contains("Errno 61")
        || message.contains("os error 61")
        || message.contains("os error 111")
        || message.to_ascii_lowercase().contains("connection refused")
}

/// Render an error with all of its sources, `outer: inner: innermost`.
#[must_use]
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
