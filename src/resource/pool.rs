//! Bounded connection pool with fair waiting.
//!
//! The pool owns up to `max_size` connections produced by a
//! [`ConnectionFactory`]. [`ResourcePool::acquire`] hands out a
//! [`Pooled`] guard that returns the connection on drop; when the pool
//! is at capacity, acquirers queue FIFO and are served directly as
//! connections come back. Connections are validated on acquire, and a
//! connection returned as invalid is replaced immediately if someone is
//! waiting, so a burst of broken connections cannot starve the queue.
//!
//! [`ResourcePool::start`] must run before the first acquire; it
//! pre-warms `min_size` connections and spawns the return-processing
//! and maintenance tasks.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::event_bus::{Event, EventBus, EventType};
use crate::resource::{ResourceError, ResourceResult};

/// Produces and retires the connections a pool manages.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> ResourceResult<Self::Connection>;

    /// Checked before an idle connection is handed out.
    async fn validate(&self, _conn: &Self::Connection) -> bool {
        true
    }

    async fn close(&self, _conn: Self::Connection) {}
}

struct PoolEntry<C> {
    id: u64,
    conn: C,
    last_used: Instant,
}

struct Returned<C> {
    entry: PoolEntry<C>,
    valid: bool,
}

struct PoolState<C> {
    available: VecDeque<PoolEntry<C>>,
    in_use: HashMap<u64, Instant>,
    waiters: VecDeque<oneshot::Sender<ResourceResult<PoolEntry<C>>>>,
    /// Connections alive or being created. Never exceeds `max_size`.
    total: usize,
}

/// Point-in-time snapshot of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub available: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub total: usize,
    pub max_size: usize,
    pub created: u64,
    pub closed: u64,
}

/// A connection checked out of a [`ResourcePool`].
///
/// Dereferences to the underlying connection and returns it to the pool
/// on drop. Call [`Pooled::invalidate`] first if the connection turned
/// out to be broken; the pool will close it instead of reusing it.
pub struct Pooled<F: ConnectionFactory> {
    entry: Option<PoolEntry<F::Connection>>,
    returns: mpsc::UnboundedSender<Returned<F::Connection>>,
    valid: bool,
}

impl<F: ConnectionFactory> Pooled<F> {
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

impl<F: ConnectionFactory> Deref for Pooled<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry.as_ref().expect("pool entry already returned").conn
    }
}

impl<F: ConnectionFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.entry.as_mut().expect("pool entry already returned").conn
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("conn", &self.entry.as_ref().map(|entry| entry.id))
            .field("valid", &self.valid)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            // Fails only when the pool is stopped; the connection is
            // then dropped without an explicit close.
            let _ = self.returns.send(Returned {
                entry,
                valid: self.valid,
            });
        }
    }
}

/// Bounded pool of reusable connections.
pub struct ResourcePool<F: ConnectionFactory> {
    name: String,
    factory: Arc<F>,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    returns_tx: mpsc::UnboundedSender<Returned<F::Connection>>,
    returns_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Returned<F::Connection>>>>,
    returns_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    maintenance_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    event_bus: Option<Arc<EventBus>>,
    next_id: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    shutdown: AtomicBool,
}

impl<F: ConnectionFactory> ResourcePool<F> {
    pub fn new(name: impl Into<String>, factory: F, config: PoolConfig) -> Self {
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                in_use: HashMap::new(),
                waiters: VecDeque::new(),
                total: 0,
            }),
            returns_tx,
            returns_rx: std::sync::Mutex::new(Some(returns_rx)),
            returns_task: std::sync::Mutex::new(None),
            maintenance_task: std::sync::Mutex::new(None),
            event_bus: None,
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Publishes `PoolExhausted`/`PoolDrained` events on the given bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pre-warms `min_size` connections and spawns the background tasks.
    pub async fn start(self: &Arc<Self>) -> ResourceResult<()> {
        info!(pool = %self.name, min_size = self.config.min_size, "starting pool");
        for _ in 0..self.config.min_size {
            let conn = self.factory.create().await?;
            self.created.fetch_add(1, Ordering::Relaxed);
            let entry = self.new_entry(conn);
            let mut state = self.state.lock().await;
            state.total += 1;
            state.available.push_back(entry);
        }

        let rx = self
            .returns_rx
            .lock()
            .expect("pool task lock poisoned")
            .take();
        if let Some(mut rx) = rx {
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(returned) = rx.recv().await {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.handle_return(returned).await;
                }
            });
            *self.returns_task.lock().expect("pool task lock poisoned") = Some(task);
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.maintenance_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.run_maintenance().await;
            }
        });
        *self.maintenance_task.lock().expect("pool task lock poisoned") = Some(task);
        Ok(())
    }

    /// Checks out a connection, waiting up to `acquire_timeout` when the
    /// pool is at capacity. Waiters are served in arrival order.
    pub async fn acquire(&self) -> ResourceResult<Pooled<F>> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(ResourceError::Shutdown {
                    name: self.name.clone(),
                });
            }

            enum Plan<C> {
                Reuse(PoolEntry<C>),
                Create,
                Wait,
            }

            let plan = {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.available.pop_front() {
                    state.in_use.insert(entry.id, Instant::now());
                    Plan::Reuse(entry)
                } else if state.total < self.config.max_size {
                    state.total += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(mut entry) => {
                    if self.factory.validate(&entry.conn).await {
                        entry.last_used = Instant::now();
                        return Ok(self.guard(entry));
                    }
                    debug!(pool = %self.name, conn = entry.id, "idle connection failed validation");
                    self.retire(entry, true).await;
                    continue;
                }
                Plan::Create => match self.factory.create().await {
                    Ok(conn) => {
                        self.created.fetch_add(1, Ordering::Relaxed);
                        let entry = self.new_entry(conn);
                        let mut state = self.state.lock().await;
                        state.in_use.insert(entry.id, Instant::now());
                        drop(state);
                        return Ok(self.guard(entry));
                    }
                    Err(e) => {
                        self.state.lock().await.total -= 1;
                        return Err(e);
                    }
                },
                Plan::Wait => {
                    let (tx, mut rx) = oneshot::channel();
                    self.state.lock().await.waiters.push_back(tx);
                    match timeout(self.config.acquire_timeout, &mut rx).await {
                        Ok(Ok(Ok(entry))) => return Ok(self.guard(entry)),
                        Ok(Ok(Err(e))) => return Err(e),
                        Ok(Err(_)) => {
                            return Err(ResourceError::Shutdown {
                                name: self.name.clone(),
                            })
                        }
                        Err(_) => {
                            // A hand-off can race the deadline. Close the
                            // channel so later sends bounce back to the
                            // dispatcher, then claim anything delivered
                            // in the meantime.
                            rx.close();
                            if let Ok(result) = rx.try_recv() {
                                return result.map(|entry| self.guard(entry));
                            }
                            warn!(
                                pool = %self.name,
                                max_size = self.config.max_size,
                                "acquire timed out, pool exhausted"
                            );
                            if let Some(bus) = &self.event_bus {
                                bus.publish(
                                    Event::new(EventType::PoolExhausted)
                                        .with_entry("pool", self.name.clone())
                                        .with_entry("max_size", self.config.max_size),
                                )
                                .await;
                            }
                            return Err(ResourceError::PoolExhausted {
                                name: self.name.clone(),
                                max_size: self.config.max_size,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Fails pending waiters, closes idle connections and stops the
    /// background tasks. Checked-out connections are dropped when their
    /// guards go out of scope.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // The returns task keeps running so guards dropped after stop
        // still get their connections closed.
        if let Some(task) = self
            .maintenance_task
            .lock()
            .expect("pool task lock poisoned")
            .take()
        {
            task.abort();
        }

        let (waiters, idle) = {
            let mut state = self.state.lock().await;
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            let idle: Vec<_> = state.available.drain(..).collect();
            state.total -= idle.len();
            (waiters, idle)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(ResourceError::Shutdown {
                name: self.name.clone(),
            }));
        }
        let closed = idle.len();
        for entry in idle {
            self.factory.close(entry.conn).await;
            self.closed.fetch_add(1, Ordering::Relaxed);
        }

        info!(pool = %self.name, closed, "pool stopped");
        if let Some(bus) = &self.event_bus {
            bus.publish(
                Event::new(EventType::PoolDrained)
                    .with_entry("pool", self.name.clone())
                    .with_entry("closed", closed),
            )
            .await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            name: self.name.clone(),
            available: state.available.len(),
            in_use: state.in_use.len(),
            waiting: state.waiters.len(),
            total: state.total,
            max_size: self.config.max_size,
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }

    fn new_entry(&self, conn: F::Connection) -> PoolEntry<F::Connection> {
        PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            conn,
            last_used: Instant::now(),
        }
    }

    fn guard(&self, entry: PoolEntry<F::Connection>) -> Pooled<F> {
        Pooled {
            entry: Some(entry),
            returns: self.returns_tx.clone(),
            valid: true,
        }
    }

    /// Processes one returned connection from a dropped guard.
    async fn handle_return(&self, returned: Returned<F::Connection>) {
        let known = {
            let mut state = self.state.lock().await;
            state.in_use.remove(&returned.entry.id).is_some()
        };
        if !known {
            warn!(pool = %self.name, conn = returned.entry.id, "returned connection is not checked out");
            self.factory.close(returned.entry.conn).await;
            self.closed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let usable = returned.valid
            && !self.shutdown.load(Ordering::SeqCst)
            && self.factory.validate(&returned.entry.conn).await;
        if !usable {
            self.retire(returned.entry, false).await;
            if !self.shutdown.load(Ordering::SeqCst) {
                self.replace_for_waiter().await;
            }
            return;
        }
        self.dispatch_entry(returned.entry).await;
    }

    /// Closes a connection that is counted in `total` but held by the
    /// caller (not in `available` or `in_use`).
    async fn retire(&self, entry: PoolEntry<F::Connection>, was_in_use: bool) {
        {
            let mut state = self.state.lock().await;
            if was_in_use {
                state.in_use.remove(&entry.id);
            }
            state.total -= 1;
        }
        self.factory.close(entry.conn).await;
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Hands the entry to the oldest live waiter, or parks it as idle.
    async fn dispatch_entry(&self, mut entry: PoolEntry<F::Connection>) {
        entry.last_used = Instant::now();
        let mut state = self.state.lock().await;
        while let Some(waiter) = state.waiters.pop_front() {
            let id = entry.id;
            state.in_use.insert(id, Instant::now());
            match waiter.send(Ok(entry)) {
                Ok(()) => return,
                Err(rejected) => {
                    // Waiter timed out and dropped its receiver.
                    state.in_use.remove(&id);
                    entry = match rejected {
                        Ok(entry) => entry,
                        Err(_) => return,
                    };
                }
            }
        }
        state.available.push_back(entry);
    }

    /// After an invalid return, creates a replacement connection when a
    /// waiter is queued. A creation failure is delivered to the waiter
    /// instead of leaving it to time out.
    async fn replace_for_waiter(&self) {
        let should_create = {
            let mut state = self.state.lock().await;
            if state.waiters.is_empty() || state.total >= self.config.max_size {
                false
            } else {
                state.total += 1;
                true
            }
        };
        if !should_create {
            return;
        }
        match self.factory.create().await {
            Ok(conn) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.name, "replaced invalid connection for waiter");
                self.dispatch_entry(self.new_entry(conn)).await;
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.total -= 1;
                if let Some(waiter) = state.waiters.pop_front() {
                    let _ = waiter.send(Err(e));
                } else {
                    warn!(pool = %self.name, "replacement connection failed: {}", e);
                }
            }
        }
    }

    /// Evicts idle connections past `max_idle_time` down to `min_size`,
    /// then re-warms up to `min_size` if the pool shrank below it.
    async fn run_maintenance(&self) {
        let victims = {
            let mut state = self.state.lock().await;
            let mut victims = Vec::new();
            while state.total > self.config.min_size {
                match state.available.front() {
                    Some(entry) if entry.last_used.elapsed() > self.config.max_idle_time => {
                        let entry = state.available.pop_front().expect("front checked");
                        state.total -= 1;
                        victims.push(entry);
                    }
                    _ => break,
                }
            }
            victims
        };
        if !victims.is_empty() {
            debug!(pool = %self.name, evicted = victims.len(), "evicting idle connections");
        }
        for entry in victims {
            self.factory.close(entry.conn).await;
            self.closed.fetch_add(1, Ordering::Relaxed);
        }

        loop {
            let need = {
                let mut state = self.state.lock().await;
                if state.total < self.config.min_size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !need {
                break;
            }
            match self.factory.create().await {
                Ok(conn) => {
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.dispatch_entry(self.new_entry(conn)).await;
                }
                Err(e) => {
                    self.state.lock().await.total -= 1;
                    warn!(pool = %self.name, "re-warm failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    struct TestFactory {
        created: AtomicUsize,
        closed: AtomicUsize,
        fail_create: AtomicBool,
        reject_validation: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                reject_validation: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<TestFactory> {
        type Connection = usize;

        async fn create(&self) -> ResourceResult<usize> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ResourceError::connection("test", "backend down"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _conn: &usize) -> bool {
            !self.reject_validation.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            min_size: 0,
            max_idle_time: Duration::from_secs(300),
            acquire_timeout: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(60),
        }
    }

    async fn pool(
        factory: &Arc<TestFactory>,
        config: PoolConfig,
    ) -> Arc<ResourcePool<Arc<TestFactory>>> {
        let pool = Arc::new(ResourcePool::new("test-pool", factory.clone(), config));
        pool.start().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(4)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        drop(conn);
        sleep(Duration::from_millis(50)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_waiter_served_on_release() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(2)).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().await.waiting, 1);

        drop(a);
        let handed_off = waiter.await.unwrap().unwrap();
        // No new connection was created for the waiter.
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let stats = pool.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_use, 2);
        drop(b);
        drop(handed_off);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(1)).await;

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        match err {
            ResourceError::PoolExhausted { name, max_size } => {
                assert_eq!(name, "test-pool");
                assert_eq!(max_size, 1);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_return_is_replaced_for_waiter() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(1)).await;

        let mut held = pool.acquire().await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        sleep(Duration::from_millis(20)).await;

        held.invalidate();
        drop(held);

        let replacement = waiter.await.unwrap().unwrap();
        assert_eq!(*replacement, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_replacement_failure_reaches_waiter() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(1)).await;

        let mut held = pool.acquire().await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        sleep(Duration::from_millis(20)).await;

        factory.fail_create.store(true, Ordering::SeqCst);
        held.invalidate();
        drop(held);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ResourceError::Connection { .. }));
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_failed_validation_closes_and_recreates() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(2)).await;

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().await.available, 1);

        factory.reject_validation.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_fails_waiters_and_closes_idle() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(1)).await;

        let held = pool.acquire().await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        sleep(Duration::from_millis(20)).await;

        pool.stop().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ResourceError::Shutdown { .. }));

        drop(held);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ResourceError::Shutdown { .. }));
    }

    #[tokio::test]
    async fn test_pre_warm_and_idle_eviction() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(
            &factory,
            PoolConfig {
                max_size: 4,
                min_size: 2,
                max_idle_time: Duration::from_millis(10),
                acquire_timeout: Duration::from_millis(100),
                maintenance_interval: Duration::from_millis(20),
            },
        )
        .await;

        assert_eq!(pool.stats().await.available, 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        // Eviction never shrinks below min_size.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().await.total, 2);
    }

    #[tokio::test]
    async fn test_waiter_timeout_does_not_leak_capacity() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(
            &factory,
            PoolConfig {
                max_size: 1,
                min_size: 0,
                max_idle_time: Duration::from_secs(300),
                acquire_timeout: Duration::from_millis(5),
                maintenance_interval: Duration::from_secs(60),
            },
        )
        .await;

        // Repeatedly race a waiter's deadline against the hand-off.
        for _ in 0..20 {
            let held = pool.acquire().await.unwrap();
            let waiter_pool = pool.clone();
            let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
            sleep(Duration::from_millis(4)).await;
            drop(held);
            if let Ok(conn) = waiter.await.unwrap() {
                drop(conn);
            }
            sleep(Duration::from_millis(10)).await;
        }

        // Whether each hand-off won or lost, the connection stays
        // accounted for and the pool keeps serving.
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert!(stats.total <= 1);
        let conn = pool.acquire().await.unwrap();
        drop(conn);
    }

    #[tokio::test]
    async fn test_connection_returned_after_stop_is_closed() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(1)).await;

        let held = pool.acquire().await.unwrap();
        pool.stop().await;
        drop(held);
        sleep(Duration::from_millis(50)).await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let factory = Arc::new(TestFactory::new());
        let pool = pool(&factory, config(3)).await;

        let mut guards = Vec::new();
        for _ in 0..3 {
            guards.push(pool.acquire().await.unwrap());
        }
        let stats = pool.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.in_use, 3);
        assert!(pool.acquire().await.is_err());
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }
}
