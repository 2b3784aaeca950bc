//! Resilient outbound fetch: per-source token bucket, retry with jittered
//! exponential backoff, and a circuit breaker that isolates degraded sources.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};

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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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
    /// Upper bound of the random extra delay, as a fraction of the capped delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let capped = self.delay_for_attempt(attempt_index);
        let spread_ms = (capped.as_millis() as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(fastrand::u64(0..=spread_ms))
    }

    /// Delay before the next attempt, honouring a server `Retry-After` up to `max_delay`.
    pub fn retry_delay(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let backoff = self.jittered_delay(attempt_index);
        match retry_after {
            Some(hint) => backoff.max(hint.min(self.max_delay)),
            None => backoff,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    /// Burst size.
    pub capacity: u32,
    /// One token is added per interval.
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token, suspending until the bucket refills when empty.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            self.refill(&mut state, now);

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = (state.last_refill + self.refill_every).saturating_duration_since(now);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }

    pub async fn available(&self) -> u32 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut TokenBucketState, now: Instant) {
        if self.refill_every.is_zero() {
            state.tokens = self.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos())
            .unwrap_or(u32::MAX);
        if refills == 0 {
            return;
        }
        state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
        if state.tokens == self.capacity {
            state.last_refill = now;
        } else {
            state.last_refill += self.refill_every * refills;
        }
    }
}

/// Limits applied independently to each source.
#[derive(Debug, Clone, Copy)]
pub struct SourcePolicy {
    pub concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
    pub backoff: BackoffPolicy,
    pub circuit: CircuitBreakerConfig,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            concurrency: 4,
            token_bucket: Some(TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(250),
            }),
            backoff: BackoffPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub default_policy: SourcePolicy,
    pub per_source: HashMap<String, SourcePolicy>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            default_policy: SourcePolicy::default(),
            per_source: HashMap::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn policy_for(&self, source_id: &str) -> SourcePolicy {
        self.per_source
            .get(source_id)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::NonRetryable,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

/// Single network round trip. The fetcher layers limits, retries and isolation on top.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.bytes().await?.to_vec();
        Ok(TransportResponse {
            status,
            final_url,
            body,
            retry_after,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {message}")]
    Transport {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("circuit open for source {source_id}; retry after {retry_after:?}")]
    CircuitOpen {
        source_id: String,
        retry_after: Duration,
    },
    #[error("fetch client is shut down")]
    Closed,
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::CircuitOpen { .. } | Self::Closed | Self::Cancelled => false,
        }
    }
}

#[derive(Debug)]
struct SourceGate {
    concurrency: Semaphore,
    bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl SourceGate {
    fn new(policy: SourcePolicy) -> Self {
        Self {
            concurrency: Semaphore::new(policy.concurrency.max(1)),
            bucket: policy
                .token_bucket
                .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every)),
            backoff: policy.backoff,
            breaker: Mutex::new(CircuitBreaker::new(policy.circuit)),
        }
    }

    async fn record_failure(&self, source_id: &str) {
        let mut breaker = self.breaker.lock().await;
        let before = breaker.state();
        breaker.record_failure(Instant::now());
        if before != CircuitState::Open && breaker.state() == CircuitState::Open {
            warn!(source_id, "circuit opened; failing fast until cooldown elapses");
        }
    }

    async fn record_success(&self, source_id: &str) {
        let mut breaker = self.breaker.lock().await;
        if breaker.state() != CircuitState::Closed {
            warn!(source_id, "circuit closed after successful probe");
        }
        breaker.record_success();
    }
}

/// Shared fetch client. Rate-limit and breaker state is kept per source id.
pub struct HttpFetcher {
    transport: Arc<dyn Transport>,
    config: HttpClientConfig,
    global_limit: Semaphore,
    gates: Mutex<HashMap<String, Arc<SourceGate>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: HttpClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            config,
            gates: Mutex::new(HashMap::new()),
        }
    }

    async fn gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut map = self.gates.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(SourceGate::new(self.config.policy_for(source_id))))
            .clone()
    }

    pub async fn circuit_state(&self, source_id: &str) -> CircuitState {
        let gate = self.gate(source_id).await;
        let state = gate.breaker.lock().await.state();
        state
    }

    pub async fn fetch(
        &self,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_until(source_id, request, &CancellationToken::new())
            .await
    }

    /// Like [`HttpFetcher::fetch`], but gives up with [`FetchError::Cancelled`] once
    /// `cancel` fires. An in-flight request is allowed to finish; waits are not.
    pub async fn fetch_until(
        &self,
        source_id: &str,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %request.url);
        self.fetch_with_retries(source_id, request, cancel)
            .instrument(span)
            .await
    }

    async fn fetch_with_retries(
        &self,
        source_id: &str,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = self.global_limit.acquire() => permit.map_err(|_| FetchError::Closed)?,
        };
        let gate = self.gate(source_id).await;
        let _source = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            permit = gate.concurrency.acquire() => permit.map_err(|_| FetchError::Closed)?,
        };

        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                debug!(source_id, attempt = attempt as u64, "fetch cancelled before attempt");
                return Err(FetchError::Cancelled);
            }
            let admission = gate.breaker.lock().await.admit(Instant::now());
            match admission {
                Admission::Rejected { retry_after } => {
                    return Err(FetchError::CircuitOpen {
                        source_id: source_id.to_string(),
                        retry_after,
                    });
                }
                Admission::Probe => debug!(source_id, "half-open probe request"),
                Admission::Allowed => {}
            }

            if let Some(bucket) = &gate.bucket {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        gate.breaker.lock().await.release_probe();
                        return Err(FetchError::Cancelled);
                    }
                    _ = bucket.take() => {}
                }
            }

            let (error, retry_after) = match self.transport.send(request).await {
                Ok(resp) if resp.status.is_success() => {
                    gate.record_success(source_id).await;
                    return Ok(FetchedResponse {
                        status: resp.status,
                        final_url: resp.final_url,
                        body: resp.body,
                    });
                }
                Ok(resp) => {
                    let error = FetchError::HttpStatus {
                        status: resp.status.as_u16(),
                        url: resp.final_url,
                    };
                    if classify_status(resp.status) == RetryDisposition::NonRetryable {
                        // The source answered; a client error is not a health signal.
                        gate.record_success(source_id).await;
                        return Err(error);
                    }
                    (error, resp.retry_after)
                }
                Err(err) => {
                    let retryable = err.disposition == RetryDisposition::Retryable;
                    let error = FetchError::Transport {
                        url: request.url.clone(),
                        message: err.message,
                        retryable,
                    };
                    if !retryable {
                        gate.breaker.lock().await.release_probe();
                        return Err(error);
                    }
                    (error, None)
                }
            };

            gate.record_failure(source_id).await;
            if attempt >= gate.backoff.max_retries {
                return Err(error);
            }
            let delay = gate.backoff.retry_delay(attempt, retry_after);
            debug!(
                source_id,
                attempt = attempt as u64,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying fetch"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(source_id, attempt = attempt as u64, "fetch cancelled during backoff");
                    return Err(FetchError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Transport that replays a fixed script of responses, for offline runs and tests.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: std::sync::Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    calls: std::sync::atomic::AtomicUsize,
    urls: std::sync::Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_status(&self, status: u16, body: impl Into<Vec<u8>>) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.push(Ok(TransportResponse {
            status,
            final_url: "scripted://response".to_string(),
            body: body.into(),
            retry_after: None,
        }));
    }

    pub fn push(&self, outcome: Result<TransportResponse, TransportError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().map(|urls| urls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Ok(mut urls) = self.urls.lock() {
            urls.push(request.url.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| {
            Ok(TransportResponse {
                status: StatusCode::SERVICE_UNAVAILABLE,
                final_url: request.url.clone(),
                body: Vec::new(),
                retry_after: None,
            })
        })
    }
}
