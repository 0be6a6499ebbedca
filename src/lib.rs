//! # Chassis
//!
//! An async application chassis: the lifecycle, messaging and
//! resilience plumbing an application is built on.
//!
//! - [`event_bus`]: typed publish/subscribe messaging with priorities,
//!   filters and middleware
//! - [`resource`]: managed external dependencies with an explicit
//!   lifecycle state machine, connection pooling and bulk orchestration
//! - [`circuit_breaker`]: fail-fast protection around unreliable calls
//! - [`di`]: type-keyed dependency injection
//! - [`component`]: the [`App`](component::App) shell hosting
//!   application components
//! - [`config`]: JSON configuration with per-field defaults
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chassis::component::App;
//! use chassis::config::AppConfig;
//!
//! # async fn run() -> chassis::error::AppResult<()> {
//! let app = Arc::new(App::new(AppConfig::default()));
//! app.start().await?;
//! // ... serve ...
//! app.stop().await?;
//! # Ok(())
//! # }
//! ```

use tracing_subscriber::EnvFilter;

pub mod circuit_breaker;
pub mod component;
pub mod config;
pub mod di;
pub mod error;
pub mod event_bus;
pub mod resource;

pub use circuit_breaker::{BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};
pub use component::{App, Component, ComponentError};
pub use config::AppConfig;
pub use di::{Container, DependencyError, Scope};
pub use error::{AppResult, Error};
pub use event_bus::{Event, EventBus, EventFilter, EventHandler, EventType, Value};
pub use resource::{
    ConnectionFactory, Resource, ResourceDriver, ResourceError, ResourceHealth, ResourceManager,
    ResourcePool, ResourceState,
};

/// Installs a global `tracing` subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
