//! Central registry and bulk lifecycle orchestration for resources.
//!
//! The manager starts registered resources concurrently (bounded by
//! `startup_concurrency`), guards each resource's startup behind a named
//! circuit breaker, stops them in reverse registration order under a
//! global timeout, and runs a periodic health monitor that publishes
//! health events on the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{BreakerError, BreakerRegistry};
use crate::config::ManagerConfig;
use crate::event_bus::{Event, EventBus, EventType};
use crate::resource::base::{Resource, ResourceStats};
use crate::resource::state::{ResourceHealth, ResourceState};
use crate::resource::{ResourceError, ResourceResult};

/// Outcome of [`ResourceManager::start_all_resources`].
#[derive(Debug, Default)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl StartupReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregate health across all registered resources.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub by_resource: HashMap<String, ResourceHealth>,
}

impl HealthSummary {
    pub fn total(&self) -> usize {
        self.by_resource.len()
    }

    pub fn all_healthy(&self) -> bool {
        self.healthy == self.by_resource.len()
    }
}

/// Registry and orchestrator for all managed resources.
pub struct ResourceManager {
    resources: DashMap<String, Arc<Resource>>,
    /// Registration order; shutdown walks it in reverse.
    order: std::sync::Mutex<Vec<String>>,
    event_bus: Arc<EventBus>,
    breakers: Arc<BreakerRegistry>,
    config: ManagerConfig,
    started: AtomicBool,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceManager {
    pub fn new(
        event_bus: Arc<EventBus>,
        breakers: Arc<BreakerRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            resources: DashMap::new(),
            order: std::sync::Mutex::new(Vec::new()),
            event_bus,
            breakers,
            config,
            started: AtomicBool::new(false),
            health_task: std::sync::Mutex::new(None),
        }
    }

    /// Adds a resource to the registry. Names are unique.
    pub async fn register(&self, resource: Resource) -> ResourceResult<Arc<Resource>> {
        let name = resource.name().to_string();
        let resource = Arc::new(resource);
        match self.resources.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ResourceError::operation(
                    &name,
                    "a resource with this name is already registered",
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(resource.clone());
            }
        }
        self.order.lock().expect("order lock poisoned").push(name.clone());

        info!(resource = %name, "resource registered");
        self.event_bus
            .publish(Event::new(EventType::ResourceRegistered).with_entry("resource", name))
            .await;
        Ok(resource)
    }

    /// Removes a resource, disconnecting and cleaning it up best-effort.
    pub async fn unregister(&self, name: &str) -> ResourceResult<()> {
        let Some((_, resource)) = self.resources.remove(name) else {
            return Err(ResourceError::NotFound {
                name: name.to_string(),
            });
        };
        self.order
            .lock()
            .expect("order lock poisoned")
            .retain(|n| n != name);

        self.teardown(&resource).await;
        info!(resource = %name, "resource unregistered");
        self.event_bus
            .publish(
                Event::new(EventType::ResourceUnregistered).with_entry("resource", name),
            )
            .await;
        Ok(())
    }

    pub fn get_resource(&self, name: &str) -> ResourceResult<Arc<Resource>> {
        self.resources
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResourceError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.order.lock().expect("order lock poisoned").clone()
    }

    /// Starts every registered resource, at most `startup_concurrency` at
    /// a time. One resource's failure never aborts the others; the
    /// report lists both outcomes. Startup runs behind a per-resource
    /// circuit breaker keyed `resource.<name>`, so a resource that keeps
    /// failing is rejected fast on repeated attempts.
    pub async fn start_all_resources(self: &Arc<Self>) -> StartupReport {
        let names = self.resource_names();
        info!(count = names.len(), "starting all resources");
        let semaphore = Arc::new(Semaphore::new(self.config.startup_concurrency.max(1)));

        let tasks = names.iter().map(|name| {
            let semaphore = semaphore.clone();
            let name = name.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = self.start_one(&name).await;
                (name, result)
            }
        });

        let mut report = StartupReport::default();
        for (name, result) in join_all(tasks).await {
            match result {
                Ok(()) => {
                    self.event_bus
                        .publish(
                            Event::new(EventType::ResourceStarted)
                                .with_entry("resource", name.clone()),
                        )
                        .await;
                    report.started.push(name);
                }
                Err(e) => {
                    error!(resource = %name, "resource failed to start: {}", e);
                    self.event_bus
                        .publish(
                            Event::new(EventType::ResourceFailed)
                                .with_entry("resource", name.clone())
                                .with_entry("error", e.to_string()),
                        )
                        .await;
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        self.event_bus
            .publish(
                Event::new(EventType::ResourcesStarted)
                    .with_entry("started", report.started.len())
                    .with_entry("failed", report.failed.len()),
            )
            .await;
        self.started.store(true, Ordering::SeqCst);
        self.spawn_health_monitor();
        report
    }

    /// Stops all resources in reverse registration order, bounded by
    /// `shutdown_timeout` overall. Resources not reached before the
    /// deadline are logged as abandoned.
    pub async fn stop_all_resources(self: &Arc<Self>) {
        if let Some(task) = self.health_task.lock().expect("health task lock poisoned").take() {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);

        let mut names = self.resource_names();
        names.reverse();
        info!(count = names.len(), "stopping all resources");

        let stopped = Arc::new(std::sync::Mutex::new(Vec::new()));
        let progress = stopped.clone();
        let shutdown = async {
            for name in &names {
                if let Ok(resource) = self.get_resource(name) {
                    self.teardown(&resource).await;
                    self.event_bus
                        .publish(
                            Event::new(EventType::ResourceStopped)
                                .with_entry("resource", name.clone()),
                        )
                        .await;
                }
                progress.lock().expect("progress lock poisoned").push(name.clone());
            }
        };

        if timeout(self.config.shutdown_timeout, shutdown).await.is_err() {
            let stopped = stopped.lock().expect("progress lock poisoned");
            let abandoned: Vec<_> = names
                .iter()
                .filter(|name| !stopped.contains(name))
                .collect();
            warn!(?abandoned, "shutdown timeout reached, abandoning resources");
        }

        self.event_bus
            .publish(
                Event::new(EventType::ResourcesStopped)
                    .with_entry("stopped", stopped.lock().expect("progress lock poisoned").len()),
            )
            .await;
    }

    /// Probes every resource once and aggregates the results.
    pub async fn health_check_all(&self) -> HealthSummary {
        let resources: Vec<Arc<Resource>> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let probes = resources.iter().map(|resource| async {
            (resource.name().to_string(), resource.health_check().await)
        });

        let mut summary = HealthSummary {
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            by_resource: HashMap::new(),
        };
        for (name, health) in join_all(probes).await {
            match health {
                ResourceHealth::Healthy => summary.healthy += 1,
                ResourceHealth::Degraded => summary.degraded += 1,
                ResourceHealth::Unhealthy => summary.unhealthy += 1,
                ResourceHealth::Unknown => summary.unknown += 1,
            }
            summary.by_resource.insert(name, health);
        }
        summary
    }

    pub async fn resource_stats(&self) -> Vec<ResourceStats> {
        let resources: Vec<Arc<Resource>> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        join_all(resources.iter().map(|resource| resource.get_stats())).await
    }

    /// Walks one resource to CONNECTED from wherever it currently is,
    /// behind its circuit breaker.
    async fn start_one(&self, name: &str) -> ResourceResult<()> {
        let resource = self.get_resource(name)?;
        let breaker = self.breakers.get_breaker(&format!("resource.{}", name));

        let result = breaker
            .call(|| async {
                match resource.state().await {
                    ResourceState::Created => {
                        resource.initialize().await?;
                        resource.connect().await
                    }
                    ResourceState::Ready | ResourceState::Disconnected => {
                        resource.connect().await
                    }
                    ResourceState::Connected => {
                        debug!(resource = %name, "already connected, skipping");
                        Ok(())
                    }
                    state => Err(ResourceError::State {
                        name: name.to_string(),
                        current: state,
                        required: "`created`, `ready` or `disconnected`".to_string(),
                    }),
                }
            })
            .await;

        result.map_err(|e| match e {
            BreakerError::Open { name: breaker_name } => ResourceError::operation(
                name,
                format!("startup rejected, circuit breaker `{}` is open", breaker_name),
            ),
            BreakerError::Inner(e) => e,
        })
    }

    /// Best-effort disconnect and cleanup; errors are logged only.
    async fn teardown(&self, resource: &Arc<Resource>) {
        let state = resource.state().await;
        if matches!(state, ResourceState::Connected | ResourceState::Error) {
            if let Err(e) = resource.disconnect().await {
                warn!(resource = %resource.name(), "disconnect failed: {}", e);
            }
        }
        if resource.state().await != ResourceState::Destroyed {
            if let Err(e) = resource.cleanup().await {
                warn!(resource = %resource.name(), "cleanup failed: {}", e);
            }
        }
    }

    /// Periodic health probe publishing `ResourceHealthChanged` on
    /// transitions and a `HealthReport` summary every interval.
    fn spawn_health_monitor(self: &Arc<Self>) {
        let mut slot = self.health_task.lock().expect("health task lock poisoned");
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            let mut last: HashMap<String, ResourceHealth> = HashMap::new();
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let summary = manager.health_check_all().await;
                for (name, health) in &summary.by_resource {
                    if let Some(previous) = last.get(name) {
                        if previous != health {
                            info!(resource = %name, from = %previous, to = %health, "resource health changed");
                            manager
                                .event_bus
                                .publish(
                                    Event::new(EventType::ResourceHealthChanged)
                                        .with_entry("resource", name.clone())
                                        .with_entry("from", previous.to_string())
                                        .with_entry("to", health.to_string()),
                                )
                                .await;
                        }
                    }
                }
                last = summary.by_resource.clone();
                manager
                    .event_bus
                    .publish(
                        Event::new(EventType::HealthReport)
                            .with_entry("healthy", summary.healthy)
                            .with_entry("degraded", summary.degraded)
                            .with_entry("unhealthy", summary.unhealthy)
                            .with_entry("unknown", summary.unknown),
                    )
                    .await;
            }
        }));
    }
}
