//! Contention and failure scenarios for the pool and circuit breaker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use chassis::config::{BreakerConfig, PoolConfig};
use chassis::resource::{ConnectionFactory, ResourceError, ResourcePool, ResourceResult};
use chassis::{BreakerError, BreakerRegistry, CircuitState};

/// Counters live behind `Arc`s so the test keeps visibility after the
/// factory moves into the pool.
#[derive(Clone)]
struct CountingFactory {
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for CountingFactory {
    type Connection = usize;

    async fn create(&self) -> ResourceResult<usize> {
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    async fn close(&self, _conn: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool_config(max_size: usize, acquire_timeout: Duration) -> PoolConfig {
    PoolConfig {
        max_size,
        min_size: 0,
        max_idle_time: Duration::from_secs(300),
        acquire_timeout,
        maintenance_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn pool_serves_more_tasks_than_capacity() {
    let factory = CountingFactory::new();
    let pool = Arc::new(ResourcePool::new(
        "shared",
        factory.clone(),
        pool_config(2, Duration::from_secs(2)),
    ));
    pool.start().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(conn);
            Ok::<(), ResourceError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Capacity was never exceeded; connections were reused.
    assert!(factory.created.load(Ordering::SeqCst) <= 2);
    let stats = pool.stats().await;
    assert!(stats.total <= 2);
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.waiting, 0);
}

#[tokio::test]
async fn exhausted_pool_times_out_with_a_named_error() {
    let factory = CountingFactory::new();
    let pool = Arc::new(ResourcePool::new(
        "tiny",
        factory.clone(),
        pool_config(1, Duration::from_millis(50)),
    ));
    pool.start().await.unwrap();

    let held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    match err {
        ResourceError::PoolExhausted { name, max_size } => {
            assert_eq!(name, "tiny");
            assert_eq!(max_size, 1);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    drop(held);
}

#[tokio::test]
async fn invalidated_connections_are_not_reused() {
    let factory = CountingFactory::new();
    let pool = Arc::new(ResourcePool::new(
        "flaky",
        factory.clone(),
        pool_config(1, Duration::from_millis(500)),
    ));
    pool.start().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    let first = *conn;
    conn.invalidate();
    drop(conn);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conn = pool.acquire().await.unwrap();
    assert_ne!(*conn, first);
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
}

#[derive(thiserror::Error, Debug)]
#[error("downstream unavailable")]
struct DownstreamError;

#[tokio::test]
async fn breaker_trips_and_recovers_through_the_registry() {
    let registry = BreakerRegistry::new(BreakerConfig {
        max_failures: 2,
        reset_timeout: Duration::from_millis(40),
    });
    let breaker = registry.get_breaker("resource.payments");
    let attempts = AtomicUsize::new(0);

    for _ in 0..2 {
        let result: Result<(), _> = breaker
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(DownstreamError)
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, the downstream is not touched at all.
    let result: Result<(), _> = breaker
        .call(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(DownstreamError)
        })
        .await;
    assert!(matches!(result, Err(BreakerError::Open { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // After the reset timeout a trial call goes through and closes it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let result: Result<&str, BreakerError<DownstreamError>> =
        breaker.call(|| async { Ok("recovered") }).await;
    assert_eq!(result.unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);

    // The registry hands back the same breaker, so callers share state.
    assert_eq!(registry.get_breaker("resource.payments").failure_count(), 0);
}
