//! HTTP fetch utilities: retrying requests over a cookie-backed session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
    #[error("no attempt was made for {url}")]
    NoAttempt { url: String },
}

/// Sequential HTTP client whose cookie jar carries a login session across requests.
///
/// A fetcher is owned by one sync run; dropping it releases the session.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cookies: Arc<Jar>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let cookies = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_provider(cookies.clone())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            cookies,
            backoff: config.backoff,
        })
    }

    /// Whether the jar holds any cookie that would be sent to `url`.
    pub fn has_session_for(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|url| self.cookies.cookies(&url))
            .is_some()
    }

    /// Submit a login form; the resulting session cookie is reused by later requests.
    pub async fn login_form(
        &self,
        run_id: Uuid,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<(), FetchError> {
        let span = info_span!("http_login", %run_id, url);
        async {
            let response = self
                .send_with_retry(url, || self.client.post(url).form(fields))
                .await?;
            debug!(status = %response.status, "login form accepted");
            Ok::<(), FetchError>(())
        }
        .instrument(span)
        .await
    }

    pub async fn get_bytes(
        &self,
        run_id: Uuid,
        label: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, label, url);
        self.send_with_retry(url, || self.client.get(url))
            .instrument(span)
            .await
    }

    /// POST a plain-text body (e.g. a query) and ask for `accept` back.
    pub async fn post_text(
        &self,
        run_id: Uuid,
        label: &str,
        url: &str,
        body: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, label, url);
        self.send_with_retry(url, || {
            self.client
                .post(url)
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(ACCEPT, accept)
                .body(body.to_string())
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        if Url::parse(url).is_err() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::NoAttempt {
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_side_statuses_are_retried() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn malformed_urls_fail_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .get_bytes(Uuid::new_v4(), "test", "not a url")
            .await
            .expect_err("invalid url");
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert!(!fetcher.has_session_for("https://data.icos-cp.eu/csv/abc"));
    }
}
