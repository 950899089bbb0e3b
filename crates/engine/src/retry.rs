//! Retry policy: exponential backoff with jitter, a circuit breaker, and a
//! sliding-window retry budget, wrapped around an arbitrary async attempt.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::EngineError;
use crate::observability::{self, EngineEvent, EventSink};

/// Circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryBudgetConfig {
    pub enabled: bool,
    pub max_retries_per_window: u32,
    pub window: Duration,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries_per_window: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// Decides whether a given [`EngineError`] should be retried. Defaults to
/// treating per-attempt node timeouts and node errors classified as
/// `Retryable` as retryable; everything else ends the loop immediately.
pub type RetryCondition = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

fn default_retry_condition(err: &EngineError) -> bool {
    matches!(err, EngineError::NodeTimeout { .. })
        || matches!(err, EngineError::UserError { retryable: true, .. })
}

#[derive(Clone)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_fraction: f64,
    /// Overall deadline for the whole retry loop (not per attempt).
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry_budget: RetryBudgetConfig,
    pub retry_condition: RetryCondition,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.1,
            timeout: Duration::from_secs(60),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry_budget: RetryBudgetConfig::default(),
            retry_condition: Arc::new(default_retry_condition),
        }
    }
}

impl std::fmt::Debug for RetryPolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("timeout", &self.timeout)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("retry_budget", &self.retry_budget)
            .finish_non_exhaustive()
    }
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    half_open_probe_in_flight: bool,
}

struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl CircuitBreaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                half_open_probe_in_flight: false,
            }),
            config,
        }
    }

    fn precheck(&self) -> Result<Transition, EngineError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let mut g = self.inner.lock().unwrap();
        match g.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let elapsed = g.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    g.state = CircuitState::HalfOpen;
                    g.half_open_probe_in_flight = true;
                    Ok(Some((CircuitState::Open, CircuitState::HalfOpen)))
                } else {
                    Err(EngineError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if g.half_open_probe_in_flight {
                    Err(EngineError::CircuitOpen)
                } else {
                    g.half_open_probe_in_flight = true;
                    Ok(None)
                }
            }
        }
    }

    fn record_success(&self) -> Transition {
        if !self.config.enabled {
            return None;
        }
        let mut g = self.inner.lock().unwrap();
        let old = g.state;
        g.half_open_probe_in_flight = false;
        g.failures = 0;
        g.state = CircuitState::Closed;
        if old != CircuitState::Closed {
            Some((old, CircuitState::Closed))
        } else {
            None
        }
    }

    fn record_failure(&self) -> Transition {
        if !self.config.enabled {
            return None;
        }
        let mut g = self.inner.lock().unwrap();
        let old = g.state;
        g.half_open_probe_in_flight = false;
        g.failures += 1;
        g.last_failure = Some(Instant::now());
        let should_open = old == CircuitState::HalfOpen || g.failures >= self.config.failure_threshold;
        if should_open && old != CircuitState::Open {
            g.state = CircuitState::Open;
            Some((old, CircuitState::Open))
        } else {
            None
        }
    }

    fn is_open(&self) -> bool {
        let g = self.inner.lock().unwrap();
        match g.state {
            CircuitState::Open => {
                let elapsed = g.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                elapsed < self.config.reset_timeout
            }
            _ => false,
        }
    }

    fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().failures
    }

    fn reset(&self) {
        let mut g = self.inner.lock().unwrap();
        g.state = CircuitState::Closed;
        g.failures = 0;
        g.last_failure = None;
        g.half_open_probe_in_flight = false;
    }
}

struct RetryBudget {
    timestamps: Mutex<VecDeque<Instant>>,
    config: RetryBudgetConfig,
}

impl RetryBudget {
    fn new(config: RetryBudgetConfig) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn prune(&self, g: &mut VecDeque<Instant>) {
        let now = Instant::now();
        while let Some(&front) = g.front() {
            if now.duration_since(front) > self.config.window {
                g.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_consume(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut g = self.timestamps.lock().unwrap();
        self.prune(&mut g);
        if g.len() as u32 >= self.config.max_retries_per_window {
            false
        } else {
            g.push_back(Instant::now());
            true
        }
    }

    fn len(&self) -> usize {
        let mut g = self.timestamps.lock().unwrap();
        self.prune(&mut g);
        g.len()
    }

    fn reset(&self) {
        self.timestamps.lock().unwrap().clear();
    }
}

/// A point-in-time read of a retry policy's internal state.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicyMetrics {
    pub circuit_state: CircuitState,
    pub circuit_failure_count: u32,
    pub retries_in_window: usize,
    pub max_retries: u32,
    pub max_retries_per_window: u32,
}

type SleepFn = Arc<dyn Fn(Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn default_sleep() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

/// Wraps an arbitrary async attempt with exponential backoff, a circuit
/// breaker, and a sliding-window retry budget. One `RetryPolicy` instance is
/// typically shared (via `Arc`) across every node that opts into it, so that
/// the circuit breaker and budget are a cross-cutting, shared resource.
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    breaker: CircuitBreaker,
    budget: RetryBudget,
    sleep: SleepFn,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self::with_sleep(config, default_sleep())
    }

    /// Build a policy with an injectable sleep implementation, for
    /// deterministic tests (e.g. one that resolves immediately, or one tied
    /// to `tokio::time::pause`/`advance`).
    pub fn with_sleep(config: RetryPolicyConfig, sleep: SleepFn) -> Self {
        Self {
            breaker: CircuitBreaker::new(config.circuit_breaker),
            budget: RetryBudget::new(config.retry_budget),
            config,
            sleep,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn metrics(&self) -> RetryPolicyMetrics {
        RetryPolicyMetrics {
            circuit_state: self.breaker.state(),
            circuit_failure_count: self.breaker.failure_count(),
            retries_in_window: self.budget.len(),
            max_retries: self.config.max_retries,
            max_retries_per_window: self.config.retry_budget.max_retries_per_window,
        }
    }

    pub fn reset(&self) {
        self.breaker.reset();
        self.budget.reset();
    }

    fn emit_transition(&self, sink: Option<&EventSink>, label: &str, transition: Transition, reason: &'static str) {
        if let Some((old, new)) = transition {
            observability::emit(
                sink,
                EngineEvent::CircuitStateChange {
                    node_id: Some(label.to_string()),
                    old,
                    new,
                    reason,
                },
            );
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let raw_ms = self.config.base_delay.as_secs_f64() * 1000.0 * self.config.multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.config.max_delay.as_millis() as f64);
        let jitter = capped_ms * self.config.jitter_fraction;
        let jittered_ms = if jitter > 0.0 {
            let delta = rand::thread_rng().gen_range(-jitter..=jitter);
            capped_ms + delta
        } else {
            capped_ms
        };
        let clamped = jittered_ms.max(0.0).min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(clamped.round() as u64)
    }

    /// Execute `f` under this policy. `label` identifies the caller (e.g. a
    /// node id) purely for log/event context. `max_retries_override`, when
    /// set, replaces this policy's configured `max_retries` for this call
    /// only, so a single node can ask for more or fewer attempts than its
    /// peers without disturbing the policy's shared circuit-breaker/budget
    /// state.
    pub async fn execute<F, Fut, T>(
        &self,
        label: &str,
        max_retries_override: Option<u32>,
        sink: Option<&EventSink>,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_retries = max_retries_override.unwrap_or(self.config.max_retries);
        let transition = self.breaker.precheck()?;
        self.emit_transition(sink, label, transition, "reset timeout elapsed, probing");

        let deadline = Instant::now() + self.config.timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let transition = self.breaker.record_failure();
                self.emit_transition(sink, label, transition, "operation timeout");
                return Err(EngineError::OperationTimeout { attempts: attempt.saturating_sub(1).max(1) });
            }

            let outcome = match tokio::time::timeout(remaining, f()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(EngineError::OperationTimeout { attempts: attempt }),
            };

            match outcome {
                Ok(value) => {
                    let transition = self.breaker.record_success();
                    self.emit_transition(sink, label, transition, "attempt succeeded");
                    return Ok(value);
                }
                Err(err @ EngineError::OperationTimeout { .. }) => {
                    let transition = self.breaker.record_failure();
                    self.emit_transition(sink, label, transition, "operation timeout");
                    return Err(err);
                }
                Err(err) => {
                    if !(self.config.retry_condition)(&err) {
                        let transition = self.breaker.record_failure();
                        self.emit_transition(sink, label, transition, "non-retryable error");
                        return Err(err);
                    }
                    if attempt > max_retries {
                        let transition = self.breaker.record_failure();
                        self.emit_transition(sink, label, transition, "retries exhausted");
                        if attempt == 1 {
                            // max_retries == 0: no retry was actually attempted, so the
                            // original error's classification (e.g. NodeTimeout) must
                            // survive rather than being re-wrapped as RetryExhausted.
                            return Err(err);
                        }
                        return Err(EngineError::RetryExhausted { attempts: attempt, cause: err.to_string() });
                    }
                    if !self.budget.try_consume() {
                        let transition = self.breaker.record_failure();
                        self.emit_transition(sink, label, transition, "retry budget exhausted");
                        return Err(EngineError::RetryBudgetExhausted);
                    }

                    let delay = self.backoff_delay(attempt);
                    observability::emit(
                        sink,
                        EngineEvent::RetryAttempt {
                            correlation_id: String::new(),
                            node_id: label.to_string(),
                            attempt,
                            delay,
                            cause: err.to_string(),
                        },
                    );
                    (self.sleep)(delay).await;
                }
            }
        }
    }
}
