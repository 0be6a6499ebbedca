//! Application components and the [`App`] that hosts them.
//!
//! An [`App`] wires the framework's core services together: one event
//! bus, one dependency container, one breaker registry and one resource
//! manager, all shared. Components are started in registration order
//! and stopped in reverse; one component's failure is logged and never
//! prevents the others from starting or stopping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::circuit_breaker::BreakerRegistry;
use crate::config::AppConfig;
use crate::di::Container;
use crate::error::{AppResult, Error};
use crate::event_bus::{Event, EventBus, EventType};
use crate::resource::ResourceManager;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Component `{name}` failed to start: {message}")]
    Start { name: String, message: String },

    #[error("Component `{name}` failed to stop: {message}")]
    Stop { name: String, message: String },

    #[error("Component `{name}` rejected configuration: {message}")]
    Config { name: String, message: String },
}

impl ComponentError {
    pub fn start(name: impl Into<String>, message: impl Into<String>) -> Self {
        ComponentError::Start {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn stop(name: impl Into<String>, message: impl Into<String>) -> Self {
        ComponentError::Stop {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type ComponentResult<T> = Result<T, ComponentError>;

/// A unit of application functionality hosted by an [`App`].
///
/// Components obtain their dependencies at construction time, typically
/// from the app's [`Container`], and communicate through the event bus
/// rather than holding references to each other.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> ComponentResult<()>;

    async fn stop(&self) -> ComponentResult<()>;

    /// Called after the app's configuration is replaced at runtime.
    async fn on_config_update(&self, _config: &AppConfig) -> ComponentResult<()> {
        Ok(())
    }
}

/// The application shell owning the framework's core services.
pub struct App {
    config: RwLock<AppConfig>,
    event_bus: Arc<EventBus>,
    container: Arc<Container>,
    breakers: Arc<BreakerRegistry>,
    resources: Arc<ResourceManager>,
    components: std::sync::Mutex<Vec<Arc<dyn Component>>>,
    started: AtomicBool,
}

impl App {
    /// Builds an app and registers its core services in the container.
    pub fn new(config: AppConfig) -> Self {
        let event_bus = Arc::new(EventBus::new());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let resources = Arc::new(ResourceManager::new(
            event_bus.clone(),
            breakers.clone(),
            config.manager.clone(),
        ));
        let container = Arc::new(Container::new());
        container.register_arc(event_bus.clone());
        container.register_arc(breakers.clone());
        container.register_arc(resources.clone());

        Self {
            config: RwLock::new(config),
            event_bus,
            container,
            breakers,
            resources,
            components: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    pub fn add_component(&self, component: Arc<dyn Component>) {
        self.components
            .lock()
            .expect("component lock poisoned")
            .push(component);
    }

    fn components(&self) -> Vec<Arc<dyn Component>> {
        self.components
            .lock()
            .expect("component lock poisoned")
            .clone()
    }

    /// Starts resources, then components in registration order.
    ///
    /// A component that fails to start is logged and skipped; the rest
    /// of the app comes up regardless.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("application already started"));
        }
        let name = self.config.read().await.name.clone();
        info!(app = %name, "starting application");
        self.event_bus.start();
        self.event_bus.publish(Event::new(EventType::AppStarting)).await;

        let report = self.resources.start_all_resources().await;
        if !report.all_started() {
            warn!(failed = report.failed.len(), "some resources failed to start");
        }

        for component in self.components() {
            match component.start().await {
                Ok(()) => {
                    info!(component = %component.name(), "component started");
                    self.event_bus
                        .publish(
                            Event::new(EventType::ComponentStarted)
                                .with_entry("component", component.name()),
                        )
                        .await;
                }
                Err(e) => error!(component = %component.name(), "component failed to start: {}", e),
            }
        }

        self.event_bus.publish(Event::new(EventType::AppStarted)).await;
        info!(app = %name, "application started");
        Ok(())
    }

    /// Stops components in reverse order, then resources, then the bus.
    pub async fn stop(self: &Arc<Self>) -> AppResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            warn!("application is not started");
            return Ok(());
        }
        info!("stopping application");
        self.event_bus.publish(Event::new(EventType::AppStopping)).await;

        for component in self.components().into_iter().rev() {
            match component.stop().await {
                Ok(()) => {
                    info!(component = %component.name(), "component stopped");
                    self.event_bus
                        .publish(
                            Event::new(EventType::ComponentStopped)
                                .with_entry("component", component.name()),
                        )
                        .await;
                }
                Err(e) => error!(component = %component.name(), "component failed to stop: {}", e),
            }
        }

        self.resources.stop_all_resources().await;
        self.event_bus.publish(Event::new(EventType::AppStopped)).await;
        self.event_bus.shutdown();
        info!("application stopped");
        Ok(())
    }

    /// Replaces the configuration and notifies every component.
    pub async fn update_config(&self, config: AppConfig) {
        *self.config.write().await = config.clone();
        info!(app = %config.name, "configuration updated");
        self.event_bus
            .publish(Event::new(EventType::ConfigUpdated).with_entry("app", config.name.clone()))
            .await;

        for component in self.components() {
            if let Err(e) = component.on_config_update(&config).await {
                error!(
                    component = %component.name(),
                    "component rejected configuration update: {}", e
                );
            }
        }
    }
}
