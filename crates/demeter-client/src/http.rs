//! Breaker-gated, retry-aware HTTP execution.
//!
//! Single fetches go through the circuit breaker, classify failures into
//! the explicit error taxonomy, and retry transient classes with capped
//! exponential backoff. Batch fetches are strictly sequential with a
//! fixed inter-request delay and never raise out of the batch: each item
//! reports its own result.

use std::time::Duration;

use demeter_core::circuit_breaker::CircuitBreaker;
use demeter_core::error::AppError;
use demeter_core::retry::{BackoffPolicy, retry_with_backoff};
use demeter_core::traits::Fetcher;
use reqwest::Client;

/// Tuning for the HTTP execution layer.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    /// Attempts per URL, including the first.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Delay between items in a sequential batch.
    pub request_delay: Duration,
    /// How many circuit-open waits one attempt tolerates before giving up.
    pub max_gate_waits: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Demeter/0.2 (ranking harvester)".to_string(),
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30)),
            request_delay: Duration::from_millis(800),
            max_gate_waits: 3,
        }
    }
}

/// HTTP fetcher with circuit breaking and per-URL retry.
///
/// The underlying reqwest client owns one shared connection pool; clones
/// share it. The breaker instance is injected at construction — one per
/// process, owned by the application context.
#[derive(Clone)]
pub struct ResilientHttpClient {
    client: Client,
    breaker: CircuitBreaker,
    config: HttpClientConfig,
    timeout_secs: u64,
}

impl ResilientHttpClient {
    pub fn new(breaker: CircuitBreaker) -> Result<Self, AppError> {
        Self::with_config(breaker, HttpClientConfig::default())
    }

    pub fn with_config(breaker: CircuitBreaker, config: HttpClientConfig) -> Result<Self, AppError> {
        let timeout_secs = config.timeout.as_secs();
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Network(e.to_string()))?;

        Ok(Self {
            client,
            breaker,
            config,
            timeout_secs,
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fetch one URL, retrying transient failures up to the configured
    /// attempt budget. Overload responses feed the breaker; while the
    /// breaker is open the client waits out the recovery window instead
    /// of consuming attempts.
    pub async fn fetch_one(&self, url: &str) -> Result<serde_json::Value, AppError> {
        retry_with_backoff(
            move |attempt| self.attempt(url, attempt),
            |kind| kind.is_retryable(),
            self.config.max_attempts,
            self.config.backoff,
        )
        .await
    }

    /// Fetch a batch of URLs sequentially, a fixed delay apart.
    ///
    /// Results preserve input order. One item's permanent failure never
    /// aborts the remaining items.
    pub async fn fetch_many(&self, urls: &[String]) -> Vec<Result<serde_json::Value, AppError>> {
        let mut results = Vec::with_capacity(urls.len());
        for (idx, url) in urls.iter().enumerate() {
            if idx > 0 {
                tokio::time::sleep(self.config.request_delay).await;
            }
            let result = self.fetch_one(url).await;
            if let Err(err) = &result {
                tracing::warn!(%url, error = %err, "Batch item failed");
            }
            results.push(result);
        }
        results
    }

    /// One gated attempt: breaker admission, request, classification.
    async fn attempt(&self, url: &str, attempt: u32) -> Result<serde_json::Value, AppError> {
        self.wait_for_gate().await?;
        tracing::debug!(%url, attempt, "Issuing request");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                // Probe bookkeeping: a transient send failure is not an
                // overload signal but still releases its half-open slot.
                self.breaker.record_failure(false);
                return Err(self.classify_send_error(err));
            }
        };

        let status = response.status();
        if is_overload(status.as_u16()) {
            self.breaker.record_failure(true);
            return Err(AppError::Overload {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            self.breaker.record_failure(false);
            return Err(AppError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        match response.json::<serde_json::Value>().await {
            Ok(payload) => {
                self.breaker.record_success();
                Ok(payload)
            }
            Err(err) => {
                self.breaker.record_failure(false);
                Err(AppError::Decode(err.to_string()))
            }
        }
    }

    /// Block until the breaker admits this call, sleeping out the
    /// advertised wait. Bounded so a permanently-open breaker surfaces as
    /// a terminal `CircuitOpen` instead of hanging forever.
    async fn wait_for_gate(&self) -> Result<(), AppError> {
        let mut waits = 0;
        loop {
            match self.breaker.acquire() {
                Ok(()) => return Ok(()),
                Err(AppError::CircuitOpen { retry_after }) => {
                    if waits >= self.config.max_gate_waits {
                        return Err(AppError::CircuitOpen { retry_after });
                    }
                    waits += 1;
                    tracing::debug!(
                        wait_ms = retry_after.as_millis() as u64,
                        "Circuit open, waiting for recovery window"
                    );
                    tokio::time::sleep(retry_after + Duration::from_millis(10)).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn classify_send_error(&self, err: reqwest::Error) -> AppError {
        if err.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if err.is_connect() {
            AppError::Network(format!("Connection failed: {err}"))
        } else {
            // Resets and truncated exchanges mid-flight land here.
            AppError::Network(err.to_string())
        }
    }
}

/// The platform sheds load with 503; 429 is treated the same way.
fn is_overload(status: u16) -> bool {
    status == 503 || status == 429
}

impl Fetcher for ResilientHttpClient {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        self.fetch_one(url).await
    }
}
