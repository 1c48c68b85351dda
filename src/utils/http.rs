//! Rate-limited request gateway with identity rotation and retry
//!
//! Every outbound call to an upstream service goes through one
//! [`RateLimitedGateway`] per service. The gateway enforces a minimum
//! spacing between requests, bounds concurrency, rotates caller identities
//! when the service throttles us, and retries transient failures.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// Body text NCBI returns (with a 200 or 429) when a key exceeds its quota
const NCBI_RATE_LIMIT_MARKER: &str = "API rate limit exceeded";

/// Credentials a request is issued under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: Option<String>,
    pub api_key: Option<String>,
}

impl Identity {
    pub fn new(email: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            email: Some(email.into()),
            api_key,
        }
    }
}

/// Retry behaviour shared by every gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 3_000,
            max_delay_ms: 60_000,
        }
    }
}

/// Outcome of one attempt, decided by [`RetryPolicy::next_step`]
#[derive(Debug, PartialEq)]
pub enum Step<T> {
    Success(T),
    NotFound,
    Retry {
        delay: Duration,
        rotate_identity: bool,
        error: GatewayError,
    },
    Fail(GatewayError),
}

impl RetryPolicy {
    /// Exponential backoff used after a rate-limit signal: `base * 2^attempt`
    ///
    /// `attempt` is 0-indexed.
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        self.capped(self.base_delay_ms.saturating_mul(factor))
    }

    /// Linear backoff used after a transient failure: `base * (attempt + 1)`
    pub fn transient_backoff(&self, attempt: u32) -> Duration {
        self.capped(self.base_delay_ms.saturating_mul(attempt as u64 + 1))
    }

    fn capped(&self, millis: u64) -> Duration {
        Duration::from_millis(millis.min(self.max_delay_ms))
    }

    /// Decide what happens after attempt number `attempt` (0-indexed)
    pub fn next_step<T>(&self, attempt: u32, result: Result<T, GatewayError>) -> Step<T> {
        let err = match result {
            Ok(value) => return Step::Success(value),
            Err(GatewayError::NotFound) => return Step::NotFound,
            Err(err) => err,
        };

        let attempts_left = attempt + 1 < self.max_attempts.max(1);
        match err {
            GatewayError::RateLimited(_) if attempts_left => Step::Retry {
                delay: self.rate_limit_backoff(attempt),
                rotate_identity: true,
                error: err,
            },
            GatewayError::Transient(_) if attempts_left => Step::Retry {
                delay: self.transient_backoff(attempt),
                rotate_identity: false,
                error: err,
            },
            other => Step::Fail(other),
        }
    }
}

struct GatewayState {
    /// Earliest instant the next request may start
    next_slot: Option<Instant>,
    identities: Vec<Identity>,
    current: usize,
    rotations: u64,
}

/// Serializes calls to one upstream service
pub struct RateLimitedGateway {
    name: String,
    min_interval: Duration,
    timeout: Duration,
    policy: RetryPolicy,
    permits: Semaphore,
    state: Mutex<GatewayState>,
}

impl RateLimitedGateway {
    /// Create a gateway from a service configuration
    pub fn new(config: &GatewayConfig, policy: RetryPolicy) -> Self {
        let rate = if config.max_requests_per_sec > 0.0 {
            config.max_requests_per_sec
        } else {
            1.0
        };
        let mut identities = config.identities.clone();
        if identities.is_empty() {
            identities.push(Identity::default());
        }

        Self {
            name: config.name.clone(),
            min_interval: Duration::from_secs_f64(1.0 / rate),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            policy,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            state: Mutex::new(GatewayState {
                next_slot: None,
                identities,
                current: 0,
                rotations: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` through the gateway
    ///
    /// The operation receives the identity the request must be issued under.
    /// Returns `Ok(None)` when the upstream reports the item does not exist.
    /// Rate-limit and transient failures are retried; once attempts are
    /// exhausted the last error is returned to the caller.
    pub async fn call<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<Option<T>, GatewayError>
    where
        F: FnMut(Identity) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            let result = self.attempt(&mut operation).await;
            match self.policy.next_step(attempt, result) {
                Step::Success(value) => {
                    if attempt > 0 {
                        debug!("{} {} succeeded on attempt {}", self.name, operation_name, attempt + 1);
                    }
                    return Ok(Some(value));
                }
                Step::NotFound => return Ok(None),
                Step::Retry {
                    delay,
                    rotate_identity,
                    error,
                } => {
                    if rotate_identity {
                        self.rotate_identity().await;
                    }
                    warn!(
                        "{} {} failed (attempt {}): {}. Retrying in {:?}",
                        self.name,
                        operation_name,
                        attempt + 1,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Step::Fail(error) => {
                    warn!(
                        "{} {} gave up after {} attempt(s): {}",
                        self.name,
                        operation_name,
                        attempt + 1,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, operation: &mut F) -> Result<T, GatewayError>
    where
        F: FnMut(Identity) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let _permit = self.permits.acquire().await.map_err(|_| GatewayError::Closed)?;

        // Reserve a start slot while holding the lock, then wait outside it
        let (wait, identity) = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let slot = state.next_slot.map_or(now, |next| next.max(now));
            state.next_slot = Some(slot + self.min_interval);
            (slot - now, state.identities[state.current].clone())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match tokio::time::timeout(self.timeout, operation(identity)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Advance to the next identity, round-robin
    pub async fn rotate_identity(&self) {
        let mut state = self.state.lock().await;
        state.current = (state.current + 1) % state.identities.len();
        state.rotations += 1;
        debug!(
            "{} rotated to identity {}/{}",
            self.name,
            state.current + 1,
            state.identities.len()
        );
    }

    pub async fn current_identity(&self) -> Identity {
        let state = self.state.lock().await;
        state.identities[state.current].clone()
    }

    /// Number of rotations performed so far
    pub async fn rotations(&self) -> u64 {
        self.state.lock().await.rotations
    }

    pub async fn identity_count(&self) -> usize {
        self.state.lock().await.identities.len()
    }
}

/// Map a non-success HTTP status onto the gateway error taxonomy
pub fn error_for_status(status: StatusCode, message: &str) -> GatewayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimited(message.to_string()),
        StatusCode::NOT_FOUND => GatewayError::NotFound,
        StatusCode::REQUEST_TIMEOUT => GatewayError::Transient(message.to_string()),
        s if s.is_server_error() => GatewayError::Transient(format!("status {}: {}", s, message)),
        s => GatewayError::Http {
            status: s.as_u16(),
            message: message.to_string(),
        },
    }
}

/// Check a response status and return its body text
///
/// NCBI occasionally reports throttling in a 200 body, so the text is
/// inspected as well.
pub async fn read_body(resp: reqwest::Response) -> Result<String, GatewayError> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        if body.contains(NCBI_RATE_LIMIT_MARKER) {
            return Err(GatewayError::RateLimited(status.to_string()));
        }
        return Err(error_for_status(status, status.canonical_reason().unwrap_or("")));
    }
    if is_rate_limit_body(&body) {
        return Err(GatewayError::RateLimited("rate limit reported in body".into()));
    }
    Ok(body)
}

/// Detect an NCBI-style rate-limit error body
pub fn is_rate_limit_body(body: &str) -> bool {
    // Only short error documents; a full article could quote the phrase
    body.len() < 512 && body.contains(NCBI_RATE_LIMIT_MARKER)
}
