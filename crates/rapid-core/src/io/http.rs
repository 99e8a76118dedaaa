//! HTTP access with bounded retry.
//!
//! Every request goes through [`Fetcher`], which reads the whole body inside
//! the retry loop so a connection dropped mid-body is retried like any
//! other transient failure.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rapid_schema::ETag;
use reqwest::header::{IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Retry budget for a single request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further one.
    pub base_delay: Duration,
    /// Upper bound for the computed backoff.
    pub max_delay: Duration,
    /// A server `Retry-After` longer than this aborts instead of waiting.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), jittered into `[d/2, d]`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16));
        let full = exp.min(self.max_delay).as_millis() as u64;
        let jittered = rand::rng().random_range(full / 2..=full);
        Duration::from_millis(jittered)
    }
}

/// Outcome of a conditional GET.
#[derive(Debug)]
pub enum Fetched {
    /// A 2xx response and its full body.
    Modified { body: Bytes },
    NotModified,
}

struct Failure {
    error: SyncError,
    retry_after: Option<Duration>,
}

impl From<SyncError> for Failure {
    fn from(error: SyncError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// A `reqwest` client bound to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|source| SyncError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self::with_client(client, policy))
    }

    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET a resource, requiring a 2xx response.
    pub async fn get(&self, url: &str) -> Result<Bytes, SyncError> {
        match self.execute(url, || self.client.get(url)).await? {
            Fetched::Modified { body } => Ok(body),
            Fetched::NotModified => Err(SyncError::Protocol {
                resource: url.to_string(),
                reason: "304 Not Modified without a conditional request".into(),
            }),
        }
    }

    /// GET with `If-None-Match` when a tag is given.
    pub async fn get_conditional(
        &self,
        url: &str,
        etag: Option<&ETag>,
    ) -> Result<Fetched, SyncError> {
        self.execute(url, || {
            let req = self.client.get(url);
            match etag {
                Some(tag) => req.header(IF_NONE_MATCH, tag.as_str()),
                None => req,
            }
        })
        .await
    }

    /// POST a body, requiring a 2xx response.
    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<Bytes, SyncError> {
        let body = Bytes::from(body);
        match self
            .execute(url, || self.client.post(url).body(body.clone()))
            .await?
        {
            Fetched::Modified { body } => Ok(body),
            Fetched::NotModified => Err(SyncError::Protocol {
                resource: url.to_string(),
                reason: "unexpected 304 Not Modified".into(),
            }),
        }
    }

    async fn execute<F>(&self, url: &str, build: F) -> Result<Fetched, SyncError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let failure = match send_once(url, build()).await {
                Ok(fetched) => return Ok(fetched),
                Err(failure) => failure,
            };

            if !failure.error.is_transient() || attempt >= self.policy.max_attempts {
                return Err(failure.error);
            }

            let delay = match failure.retry_after {
                Some(wait) if wait > self.policy.max_retry_after => {
                    return Err(SyncError::RetryAfterTooLong {
                        url: url.to_string(),
                        seconds: wait.as_secs(),
                    });
                }
                Some(wait) => wait,
                None => self.policy.backoff(attempt),
            };

            warn!(
                url,
                attempt,
                max_attempts = self.policy.max_attempts,
                error = %failure.error,
                ?delay,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

async fn send_once(url: &str, request: RequestBuilder) -> Result<Fetched, Failure> {
    let transport = |source| SyncError::Transport {
        url: url.to_string(),
        source,
    };

    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    debug!(url, status = status.as_u16(), "response");

    if status == StatusCode::NOT_MODIFIED {
        return Ok(Fetched::NotModified);
    }
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(Failure {
            error: SyncError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            },
            retry_after,
        });
    }

    let body = response.bytes().await.map_err(transport)?;
    Ok(Fetched::Modified { body })
}
