//! Circuit breaker guarding calls to failure-prone dependencies.
//!
//! States:
//! - Closed: calls pass through, failures are counted
//! - Open: `failure_count` reached `max_failures` and `reset_timeout` has
//!   not elapsed since the last failure; calls are rejected without
//!   invoking the wrapped operation
//! - Half-open (implicit): `reset_timeout` elapsed, the next call is
//!   allowed as a trial; success closes the circuit, failure reopens it
//!
//! Breakers are obtained by name from a [`BreakerRegistry`] owned by the
//! application context, so tests and embedded uses can run isolated
//! registries side by side. The same key always yields the same breaker
//! instance for the registry's lifetime.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Error, Debug)]
pub enum BreakerError<E>
where
    E: std::error::Error,
{
    #[error("Circuit breaker `{name}` is open")]
    Open { name: String },

    #[error(transparent)]
    Inner(#[from] E),
}

#[derive(Debug, Default)]
struct BreakerInner {
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Per-key failure counter that fails fast once open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: std::time::Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            max_failures: config.max_failures,
            reset_timeout: config.reset_timeout,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }

    /// Logical state derived from the failure count and elapsed time.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.failure_count < self.max_failures {
            return CircuitState::Closed;
        }
        match inner.last_failure {
            Some(at) if at.elapsed() >= self.reset_timeout => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    /// Invokes the operation under breaker protection.
    ///
    /// In the Closed state the operation runs and a success resets the
    /// failure count; a failure increments it, records the failure time
    /// and is re-raised as [`BreakerError::Inner`]. In the Open state the
    /// operation is not invoked and [`BreakerError::Open`] is returned.
    /// Once the reset timeout elapses the next call runs as a trial: a
    /// success closes the circuit, a failure reopens it regardless of
    /// `max_failures`.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let trial = {
            let inner = self.inner.lock().expect("breaker lock poisoned");
            if inner.failure_count >= self.max_failures {
                match inner.last_failure {
                    Some(at) if at.elapsed() >= self.reset_timeout => {
                        // Half-open: the call runs as a trial.
                        debug!(breaker = %self.name, "reset timeout elapsed, allowing trial call");
                        true
                    }
                    _ => {
                        warn!(breaker = %self.name, "circuit open, rejecting call");
                        return Err(BreakerError::Open {
                            name: self.name.clone(),
                        });
                    }
                }
            } else {
                false
            }
        };

        match op().await {
            Ok(value) => {
                let mut inner = self.inner.lock().expect("breaker lock poisoned");
                inner.failure_count = 0;
                inner.last_failure = None;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock().expect("breaker lock poisoned");
                inner.failure_count += 1;
                if trial {
                    // A failed trial reopens the circuit immediately,
                    // whatever the threshold.
                    inner.failure_count = inner.failure_count.max(self.max_failures);
                }
                inner.last_failure = Some(Instant::now());
                debug!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "wrapped call failed"
                );
                Err(BreakerError::Inner(e))
            }
        }
    }
}

/// Registry of named breakers.
///
/// Owned by the application context and passed by reference, so multiple
/// isolated registries can coexist in one process.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Returns the breaker for `name`, creating it with the registry
    /// defaults on first use.
    pub fn get_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_breaker_with(name, &self.defaults)
    }

    /// Returns the breaker for `name`, creating it with the given config
    /// on first use. An existing breaker keeps its original config.
    pub fn get_breaker_with(&self, name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Error, Debug)]
    #[error("test failure")]
    struct TestError;

    fn config(max_failures: u32, reset_timeout: Duration) -> BreakerConfig {
        BreakerConfig {
            max_failures,
            reset_timeout,
        }
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let breaker = CircuitBreaker::new("test", &config(2, Duration::from_secs(30)));
        let invocations = AtomicUsize::new(0);

        for _ in 0..2 {
            let result: Result<(), _> = breaker
                .call(|| async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err(TestError)
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open circuit rejects without invoking the wrapped function.
        let result: Result<(), _> = breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(TestError)
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", &config(3, Duration::from_secs(30)));

        let _: Result<(), _> = breaker.call(|| async { Err(TestError) }).await;
        assert_eq!(breaker.failure_count(), 1);

        let result: Result<u32, BreakerError<TestError>> =
            breaker.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trial_call_after_reset_timeout() {
        let breaker = CircuitBreaker::new("test", &config(1, Duration::from_millis(20)));

        let _: Result<(), _> = breaker.call(|| async { Err(TestError) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Trial call is attempted again and closes the circuit on success.
        let result: Result<&str, BreakerError<TestError>> =
            breaker.call(|| async { Ok("recovered") }).await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("test", &config(1, Duration::from_millis(20)));

        let _: Result<(), _> = breaker.call(|| async { Err(TestError) }).await;
        sleep(Duration::from_millis(40)).await;

        let result: Result<(), _> = breaker.call(|| async { Err(TestError) }).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_below_threshold() {
        let breaker = CircuitBreaker::new("test", &config(3, Duration::from_millis(20)));
        let invocations = AtomicUsize::new(0);
        let failing = || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError)
        };

        for _ in 0..3 {
            let _ = breaker.call(failing).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        sleep(Duration::from_millis(40)).await;

        // One failed trial is enough to reopen, even with the count far
        // below max_failures.
        let result = breaker.call(failing).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(failing).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_registry_returns_same_instance_per_key() {
        let registry = BreakerRegistry::default();
        let a = registry.get_breaker("resource.db");
        let b = registry.get_breaker("resource.db");
        let other = registry.get_breaker("resource.cache");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.names().len(), 2);
    }
}
