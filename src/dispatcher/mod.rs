//! Request dispatcher: circuit breaker, retry wrapper, health accounting.
//!
//! Grounded on the source `CircuitBreaker`/`MCPServer._execute_with_retry`/
//! `process_request`/`get_health`. Handlers here are boxed async closures
//! rather than Python callables, and blocking `time.sleep` becomes
//! `tokio::time::sleep`; the failure-threshold/reset-timeout/retry-count
//! constants and the exact health-status transitions are unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, ErrorEnvelope};

const FAILURE_THRESHOLD: u32 = 3;
const RESET_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

struct BreakerState {
    failure_count: u32,
    open: bool,
    last_failure_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self { failure_count: 0, open: false, last_failure_at: None }
    }
}

/// Per-action failure tracking that trips after `FAILURE_THRESHOLD`
/// consecutive failures and resets itself after `RESET_TIMEOUT` of
/// quiet (half-open retry on the next request).
#[derive(Default)]
pub struct CircuitBreaker {
    state: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_open(&self, action: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(action) else { return false };
        if !entry.open {
            return false;
        }
        let quiet_long_enough = entry.last_failure_at.map(|t| t.elapsed() > RESET_TIMEOUT).unwrap_or(true);
        if quiet_long_enough {
            entry.open = false;
            entry.failure_count = 0;
            info!(action, "circuit reset");
            false
        } else {
            true
        }
    }

    pub async fn record_success(&self, action: &str) {
        let mut state = self.state.lock().await;
        state.entry(action.to_string()).or_default().failure_count = 0;
        if let Some(entry) = state.get_mut(action) {
            entry.open = false;
        }
    }

    pub async fn record_failure(&self, action: &str) {
        let mut state = self.state.lock().await;
        let entry = state.entry(action.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure_at = Some(Instant::now());
        if entry.failure_count >= FAILURE_THRESHOLD && !entry.open {
            warn!(action, failures = entry.failure_count, "circuit opened");
            entry.open = true;
        }
    }
}

/// Health snapshot returned by the `health_check` action.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub status: &'static str,
    pub request_count: u64,
    pub error_count: u64,
    pub slow_request_count: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct HealthCounters {
    request_count: AtomicU64,
    error_count: AtomicU64,
    slow_request_count: AtomicU64,
    degraded: std::sync::atomic::AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Wraps registered handlers with circuit breaking, bounded retry, and
/// request/error/slow-request accounting.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    breaker: CircuitBreaker,
    health: HealthCounters,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { handlers: HashMap::new(), breaker: CircuitBreaker::new(), health: HealthCounters::default() }
    }

    pub fn register<F>(&mut self, action: &str, handler: F)
    where
        F: Fn(Value) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(action.to_string(), Arc::new(handler));
    }

    /// Parse and dispatch one request line, returning the JSON response
    /// envelope (either the handler's success body or an error envelope).
    /// Never panics or propagates; every failure mode is represented in the
    /// return value so the transport can always write exactly one line.
    pub async fn dispatch(&self, request_json: &str) -> Value {
        let start = Instant::now();
        self.health.request_count.fetch_add(1, Ordering::Relaxed);

        let result = self.dispatch_inner(request_json).await;

        let elapsed = start.elapsed();
        if elapsed > SLOW_REQUEST_THRESHOLD {
            self.health.slow_request_count.fetch_add(1, Ordering::Relaxed);
            warn!(elapsed_ms = elapsed.as_millis() as u64, "slow request detected");
        }

        match result {
            Ok(value) => value,
            Err(e) => {
                self.health.error_count.fetch_add(1, Ordering::Relaxed);
                serde_json::to_value(ErrorEnvelope::from(&e)).unwrap_or_else(|_| {
                    serde_json::json!({"status": "ERROR", "error": "failed to serialize error"})
                })
            }
        }
    }

    async fn dispatch_inner(&self, request_json: &str) -> Result<Value, EngineError> {
        let request: Value = serde_json::from_str(request_json)
            .map_err(|e| EngineError::InvalidRequest(format!("invalid JSON in request: {e}")))?;

        let action = request
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidRequest("missing 'action' in request".to_string()))?
            .to_string();

        if self.breaker.is_open(&action).await {
            warn!(action = %action, "circuit breaker open, rejecting request");
            return Err(EngineError::CircuitOpen { action, retry_after_secs: RESET_TIMEOUT.as_secs() });
        }

        let handler = self
            .handlers
            .get(&action)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAction(action.clone()))?;

        self.execute_with_retry(&action, handler, request).await
    }

    async fn execute_with_retry(&self, action: &str, handler: Handler, request: Value) -> Result<Value, EngineError> {
        let mut attempts = 0u32;
        let mut last_error = None;

        while attempts < MAX_RETRY_ATTEMPTS {
            info!(action, "processing command");
            match handler(request.clone()).await {
                Ok(response) => {
                    debug!(action, "command succeeded");
                    self.breaker.record_success(action).await;
                    self.health.degraded.store(false, Ordering::Relaxed);
                    *self.health.last_error.lock().await = None;
                    return Ok(response);
                }
                Err(e) => {
                    attempts += 1;
                    error!(action, attempt = attempts, max = MAX_RETRY_ATTEMPTS, error = %e, "command failed");
                    if !e.is_retryable() {
                        self.breaker.record_failure(action).await;
                        self.health.degraded.store(true, Ordering::Relaxed);
                        *self.health.last_error.lock().await = Some(e.to_string());
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempts < MAX_RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        self.breaker.record_failure(action).await;
        self.health.degraded.store(true, Ordering::Relaxed);
        let message = format!(
            "command failed after {attempts} attempts: {}",
            last_error.as_ref().map(|e| e.to_string()).unwrap_or_default()
        );
        *self.health.last_error.lock().await = Some(message.clone());
        Err(EngineError::Internal(message))
    }

    pub async fn health(&self) -> Health {
        Health {
            status: if self.health.degraded.load(Ordering::Relaxed) { "degraded" } else { "ok" },
            request_count: self.health.request_count.load(Ordering::Relaxed),
            error_count: self.health.error_count.load(Ordering::Relaxed),
            slow_request_count: self.health.slow_request_count.load(Ordering::Relaxed),
            last_error: self.health.last_error.lock().await.clone(),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn failing_handler(counter: Arc<AtomicU32>) -> Handler {
        Arc::new(move |_req| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::StoreError("simulated failure".to_string()))
            })
        })
    }

    #[tokio::test]
    async fn dispatch_unknown_action_returns_error_envelope() {
        let dispatcher = Dispatcher::new();
        let response = dispatcher.dispatch(r#"{"action": "does_not_exist"}"#).await;
        assert_eq!(response["status"], "ERROR");
    }

    #[tokio::test]
    async fn dispatch_missing_action_field_is_invalid_request() {
        let dispatcher = Dispatcher::new();
        let response = dispatcher.dispatch(r#"{"foo": "bar"}"#).await;
        assert_eq!(response["status"], "ERROR");
    }

    #[tokio::test]
    async fn dispatch_malformed_json_does_not_panic() {
        let dispatcher = Dispatcher::new();
        let response = dispatcher.dispatch("not json at all").await;
        assert_eq!(response["status"], "ERROR");
    }

    #[tokio::test]
    async fn successful_dispatch_returns_handler_response() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("ping", |_req| Box::pin(async { Ok(serde_json::json!({"status": "SUCCESS"})) }));
        let response = dispatcher.dispatch(r#"{"action": "ping"}"#).await;
        assert_eq!(response["status"], "SUCCESS");
        let health = dispatcher.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.request_count, 1);
    }

    #[tokio::test]
    async fn retryable_failure_exhausts_attempts_then_opens_circuit() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicU32::new(0));
        let handler = failing_handler(Arc::clone(&counter));
        dispatcher.handlers.insert("flaky".to_string(), handler);

        for _ in 0..FAILURE_THRESHOLD {
            let response = dispatcher.dispatch(r#"{"action": "flaky"}"#).await;
            assert_eq!(response["status"], "ERROR");
        }

        assert!(dispatcher.breaker.is_open("flaky").await);
        assert_eq!(counter.load(Ordering::Relaxed), FAILURE_THRESHOLD * MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_without_calling_handler() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicU32::new(0));
        dispatcher.handlers.insert("flaky".to_string(), failing_handler(Arc::clone(&counter)));

        for _ in 0..FAILURE_THRESHOLD {
            dispatcher.dispatch(r#"{"action": "flaky"}"#).await;
        }
        let calls_before = counter.load(Ordering::Relaxed);
        let response = dispatcher.dispatch(r#"{"action": "flaky"}"#).await;
        assert_eq!(response["status"], "ERROR");
        assert!(response["error"].as_str().unwrap().contains("temporarily unavailable"));
        assert_eq!(response["retry_after"], RESET_TIMEOUT.as_secs());
        assert_eq!(counter.load(Ordering::Relaxed), calls_before);
    }

    #[tokio::test]
    async fn non_retryable_error_skips_retry_loop() {
        let mut dispatcher = Dispatcher::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        dispatcher.register("bad_input", move |_req| {
            let counter = Arc::clone(&counter_clone);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::InvalidRequest("nope".to_string()))
            })
        });
        let response = dispatcher.dispatch(r#"{"action": "bad_input"}"#).await;
        assert_eq!(response["status"], "ERROR");
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn health_degrades_after_failure_and_recovers_after_success() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("bad_input", |_req| {
            Box::pin(async { Err(EngineError::InvalidRequest("nope".to_string())) })
        });
        dispatcher.dispatch(r#"{"action": "bad_input"}"#).await;
        assert_eq!(dispatcher.health().await.status, "degraded");

        dispatcher.register("ping", |_req| Box::pin(async { Ok(serde_json::json!({"status": "SUCCESS"})) }));
        dispatcher.dispatch(r#"{"action": "ping"}"#).await;
        assert_eq!(dispatcher.health().await.status, "ok");
    }
}
