//! Base resource wrapper driving one external dependency's lifecycle.
//!
//! A concrete resource type (database, cache, file area, message broker)
//! implements the [`ResourceDriver`] hooks; [`Resource`] owns the state
//! machine around them, validating every transition against the shared
//! table in [`crate::resource::state`] and keeping operation counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::event_bus::Value;
use crate::resource::state::{ResourceHealth, ResourceOp, ResourceState};
use crate::resource::{ResourceError, ResourceResult};

/// Health checks are bounded regardless of driver behavior.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The hooks a concrete resource type implements.
///
/// The framework depends on nothing resource-type-specific beyond these.
/// Hooks run under the timeouts enforced by [`Resource`]; they should not
/// implement their own outer timeout for connect or health checks.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    async fn initialize(&self) -> ResourceResult<()> {
        Ok(())
    }

    async fn connect(&self) -> ResourceResult<()>;

    async fn disconnect(&self) -> ResourceResult<()>;

    async fn health_check(&self) -> ResourceResult<ResourceHealth> {
        Ok(ResourceHealth::Healthy)
    }

    async fn cleanup(&self) -> ResourceResult<()> {
        Ok(())
    }
}

/// Point-in-time snapshot of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStats {
    pub name: String,
    pub resource_type: String,
    pub state: ResourceState,
    pub health: ResourceHealth,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub operation_count: u64,
    pub error_count: u64,
}

/// One managed external dependency.
///
/// Construction leaves the resource in CREATED; the lifecycle methods
/// walk it through the state machine. Operations invoked from a state
/// that does not satisfy their precondition fail with
/// [`ResourceError::State`] naming the current and required states.
pub struct Resource {
    name: String,
    resource_type: String,
    config: HashMap<String, Value>,
    timeout: Duration,
    driver: Box<dyn ResourceDriver>,
    state: RwLock<ResourceState>,
    health: RwLock<ResourceHealth>,
    created_at: DateTime<Utc>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    operation_count: AtomicU64,
    error_count: AtomicU64,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("resource_type", &self.resource_type)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        driver: Box<dyn ResourceDriver>,
    ) -> Self {
        let name = name.into();
        let resource_type = resource_type.into();
        debug!(resource = %name, resource_type = %resource_type, "resource created");
        Self {
            name,
            resource_type,
            config: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            driver,
            state: RwLock::new(ResourceState::Created),
            health: RwLock::new(ResourceHealth::Unknown),
            created_at: Utc::now(),
            last_health_check: RwLock::new(None),
            operation_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    /// Bound on the connect hook.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn config(&self) -> &HashMap<String, Value> {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn state(&self) -> ResourceState {
        *self.state.read().await
    }

    pub async fn health(&self) -> ResourceHealth {
        *self.health.read().await
    }

    pub async fn is_ready(&self) -> bool {
        self.state().await.is_ready()
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// CREATED -> INITIALIZING -> READY.
    pub async fn initialize(&self) -> ResourceResult<()> {
        let transition = self.begin(ResourceOp::Initialize).await?;
        info!(resource = %self.name, "initializing resource");

        match self.driver.initialize().await {
            Ok(()) => {
                *self.state.write().await = transition.on_success;
                info!(resource = %self.name, "resource initialized");
                Ok(())
            }
            Err(e) => {
                self.fail().await;
                Err(ResourceError::operation(
                    &self.name,
                    format!("initialization failed: {}", e),
                ))
            }
        }
    }

    /// READY/DISCONNECTED -> CONNECTING -> CONNECTED, bounded by the
    /// resource timeout. A timeout leaves the resource in ERROR with
    /// UNHEALTHY health.
    pub async fn connect(&self) -> ResourceResult<()> {
        let transition = self.begin(ResourceOp::Connect).await?;
        info!(resource = %self.name, "connecting resource");

        match timeout(self.timeout, self.driver.connect()).await {
            Ok(Ok(())) => {
                *self.state.write().await = transition.on_success;
                *self.health.write().await = ResourceHealth::Healthy;
                info!(resource = %self.name, "resource connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.fail().await;
                Err(ResourceError::connection(&self.name, e.to_string()))
            }
            Err(_) => {
                self.fail().await;
                Err(ResourceError::Timeout {
                    name: self.name.clone(),
                    operation: "connect",
                    timeout: self.timeout,
                })
            }
        }
    }

    /// CONNECTED/ERROR -> DISCONNECTING -> DISCONNECTED.
    pub async fn disconnect(&self) -> ResourceResult<()> {
        let transition = self.begin(ResourceOp::Disconnect).await?;
        info!(resource = %self.name, "disconnecting resource");

        match self.driver.disconnect().await {
            Ok(()) => {
                *self.state.write().await = transition.on_success;
                *self.health.write().await = ResourceHealth::Unknown;
                info!(resource = %self.name, "resource disconnected");
                Ok(())
            }
            Err(e) => {
                self.fail().await;
                Err(ResourceError::operation(
                    &self.name,
                    format!("disconnect failed: {}", e),
                ))
            }
        }
    }

    /// Bounded health probe. Never fails: a probe error or timeout is
    /// reported as UNHEALTHY.
    pub async fn health_check(&self) -> ResourceHealth {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        *self.last_health_check.write().await = Some(Utc::now());

        let health = match timeout(HEALTH_CHECK_TIMEOUT, self.driver.health_check()).await {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => {
                warn!(resource = %self.name, "health check failed: {}", e);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                ResourceHealth::Unhealthy
            }
            Err(_) => {
                warn!(resource = %self.name, "health check timed out");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                ResourceHealth::Unhealthy
            }
        };

        *self.health.write().await = health;
        debug!(resource = %self.name, health = %health, "health check");
        health
    }

    /// -> CLEANUP -> DESTROYED.
    pub async fn cleanup(&self) -> ResourceResult<()> {
        let transition = self.begin(ResourceOp::Cleanup).await?;
        info!(resource = %self.name, "cleaning up resource");

        match self.driver.cleanup().await {
            Ok(()) => {
                *self.state.write().await = transition.on_success;
                info!(resource = %self.name, "resource destroyed");
                Ok(())
            }
            Err(e) => {
                self.fail().await;
                Err(ResourceError::operation(
                    &self.name,
                    format!("cleanup failed: {}", e),
                ))
            }
        }
    }

    pub async fn get_stats(&self) -> ResourceStats {
        ResourceStats {
            name: self.name.clone(),
            resource_type: self.resource_type.clone(),
            state: self.state().await,
            health: self.health().await,
            created_at: self.created_at,
            last_health_check: *self.last_health_check.read().await,
            operation_count: self.operation_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }

    /// Validates the transition and enters the in-progress state.
    async fn begin(
        &self,
        op: ResourceOp,
    ) -> ResourceResult<crate::resource::state::Transition> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        let transition = state.begin(op).map_err(|e| ResourceError::State {
            name: self.name.clone(),
            current: e.current,
            required: e.required.to_string(),
        })?;
        *state = transition.in_progress;
        Ok(transition)
    }

    async fn fail(&self) {
        *self.state.write().await = ResourceState::Error;
        *self.health.write().await = ResourceHealth::Unhealthy;
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}
