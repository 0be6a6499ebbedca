//! # Event Bus
//!
//! The EventBus is the central messaging hub for the framework's
//! event-driven architecture. Components publish immutable [`Event`]
//! records and subscribe handlers by [`EventType`] without depending on
//! each other directly.
//!
//! ## Features
//!
//! - **Typed dispatch**: handlers are registered against a concrete
//!   `EventType` variant, no runtime reflection
//! - **Priority ordering**: higher priority handlers run first, ties keep
//!   insertion order
//! - **Filtering**: per-handler [`EventFilter`]s narrow delivery
//! - **Failure isolation**: a failing handler or middleware never stops
//!   delivery to the remaining handlers
//! - **Weak subscriptions**: handlers bound to an object can be held
//!   weakly so the bus does not pin the subscriber's lifetime
//!
//! ## Dispatch modes
//!
//! [`EventBus::publish`] awaits matching handlers one by one on the
//! caller's task, in priority order. [`EventBus::publish_async`] runs all
//! matching handlers concurrently and gathers their results. In both
//! modes handler errors are logged and swallowed; publication is
//! fire-and-forget from the publisher's point of view.

use std::collections::HashMap;
use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Event categories dispatched through the bus.
///
/// Lifecycle variants carry no fields; the affected object's name travels
/// in the event payload. This keeps the variant usable as a registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum EventType {
    // Application lifecycle
    AppStarting,
    AppStarted,
    AppStopping,
    AppStopped,
    ConfigUpdated,
    // Component lifecycle
    ComponentStarted,
    ComponentStopped,
    // Resource lifecycle
    ResourceRegistered,
    ResourceUnregistered,
    ResourceStarted,
    ResourceStopped,
    ResourceFailed,
    ResourceHealthChanged,
    ResourcesStarted,
    ResourcesStopped,
    HealthReport,
    // Pooling
    PoolExhausted,
    PoolDrained,
    Custom(String),
}

/// Payload value type for event parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Duration(Duration),
    Map(HashMap<String, Value>),
    Null,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

/// An immutable record describing something that occurred.
///
/// Events carry an id, a timestamp, the source module that created them
/// and a string-keyed payload. There is no mutating API; payload entries
/// are attached with the consuming [`Event::with_entry`] builder before
/// publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_id: String,
    timestamp: DateTime<Utc>,
    source: String,
    event_type: EventType,
    payload: HashMap<String, Value>,
}

impl Event {
    /// Creates an event of the given type.
    ///
    /// The source is detected from the caller's location, so events
    /// report the module that constructed them without the caller having
    /// to spell it out.
    #[track_caller]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: detect_source(Location::caller()),
            event_type,
            payload: HashMap::new(),
        }
    }

    /// Overrides the auto-detected source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Attaches one payload entry.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole payload.
    pub fn with_payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn payload(&self) -> &HashMap<String, Value> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

fn detect_source(location: &Location<'_>) -> String {
    Path::new(location.file())
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Filter narrowing which events reach a handler.
///
/// All configured conditions must hold for the filter to match. An empty
/// filter matches everything.
#[derive(Clone, Default)]
pub struct EventFilter {
    sources: Vec<String>,
    payload_patterns: Vec<(String, Value)>,
    predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only match events published from one of the given sources.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Only match events whose payload contains the given key/value pair.
    pub fn payload_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload_patterns.push((key.into(), value.into()));
        self
    }

    /// Attaches an arbitrary predicate. Predicates must not panic.
    pub fn predicate(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == event.source()) {
            return false;
        }
        for (key, expected) in &self.payload_patterns {
            match event.get(key) {
                Some(value) if value == expected => {}
                _ => return false,
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(event) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("sources", &self.sources)
            .field("payload_patterns", &self.payload_patterns)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A subscriber invoked when a matching event is published.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> EventResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> EventResult<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> EventResult<()> {
        (self.0)(event)
    }
}

/// Pre-processing stage run before dispatch.
///
/// Middlewares run in registration order and may transform the event. A
/// failing middleware is logged and the prior event value retained.
pub trait EventMiddleware: Send + Sync {
    fn process(&self, event: Event) -> EventResult<Event>;
}

impl<F> EventMiddleware for F
where
    F: Fn(Event) -> EventResult<Event> + Send + Sync,
{
    fn process(&self, event: Event) -> EventResult<Event> {
        self(event)
    }
}

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum HandlerRef {
    Strong(Arc<dyn EventHandler>),
    Weak(Weak<dyn EventHandler>),
}

impl HandlerRef {
    /// Upgrades to a callable handler; `None` means the backing object
    /// was dropped and the entry must be pruned.
    fn upgrade(&self) -> Option<Arc<dyn EventHandler>> {
        match self {
            HandlerRef::Strong(handler) => Some(handler.clone()),
            HandlerRef::Weak(weak) => weak.upgrade(),
        }
    }
}

struct HandlerEntry {
    id: HandlerId,
    priority: i32,
    seq: u64,
    filters: Vec<EventFilter>,
    handler: HandlerRef,
}

impl HandlerEntry {
    fn matches(&self, event: &Event) -> bool {
        self.filters.iter().all(|filter| filter.matches(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BusState {
    Stopped,
    Running,
}

/// Central dispatcher for publish/subscribe messaging.
///
/// The handler table is keyed by [`EventType`]; entries are kept sorted
/// by priority (descending, insertion-stable) so dispatch never re-sorts.
/// Entries whose weakly-held handler has been dropped are pruned on each
/// dispatch lookup.
pub struct EventBus {
    handlers: DashMap<EventType, Vec<HandlerEntry>>,
    middlewares: RwLock<Vec<Arc<dyn EventMiddleware>>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus in the Running state.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            middlewares: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> BusState {
        if self.running.load(Ordering::SeqCst) {
            BusState::Running
        } else {
            BusState::Stopped
        }
    }

    /// (Re)enables publication after a shutdown.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stops the bus and clears all handlers and middlewares.
    ///
    /// Subsequent publishes are warn-logged no-ops until [`start`] is
    /// called again.
    ///
    /// [`start`]: EventBus::start
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let cleared = self.clear_handlers(None);
        self.middlewares
            .write()
            .expect("middleware lock poisoned")
            .clear();
        debug!(cleared, "event bus shut down");
    }

    /// Registers a handler held strongly by the bus.
    ///
    /// Returns an id usable with [`EventBus::unsubscribe`].
    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
        priority: i32,
        filters: Vec<EventFilter>,
    ) -> HandlerId {
        self.add_entry(event_type, HandlerRef::Strong(handler), priority, filters)
    }

    /// Registers a handler held weakly, so the subscription does not pin
    /// the subscriber's lifetime. Once the last strong reference to the
    /// handler is dropped the entry is pruned on the next dispatch and no
    /// longer counted.
    pub fn subscribe_weak<H>(
        &self,
        event_type: EventType,
        handler: &Arc<H>,
        priority: i32,
        filters: Vec<EventFilter>,
    ) -> HandlerId
    where
        H: EventHandler + 'static,
    {
        let weak = Arc::downgrade(handler);
        let weak: Weak<dyn EventHandler> = weak;
        self.add_entry(event_type, HandlerRef::Weak(weak), priority, filters)
    }

    /// Convenience wrapper registering a plain closure.
    pub fn subscribe_fn<F>(&self, event_type: EventType, priority: i32, f: F) -> HandlerId
    where
        F: Fn(&Event) -> EventResult<()> + Send + Sync + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler(f)), priority, Vec::new())
    }

    fn add_entry(
        &self,
        event_type: EventType,
        handler: HandlerRef,
        priority: i32,
        filters: Vec<EventFilter>,
    ) -> HandlerId {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = HandlerId(seq);
        let mut entries = self.handlers.entry(event_type.clone()).or_default();
        entries.push(HandlerEntry {
            id,
            priority,
            seq,
            filters,
            handler,
        });
        // Priority descending, insertion order stable for ties.
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        debug!(%event_type, priority, handler_id = id.0, "handler subscribed");
        id
    }

    /// Removes a subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&self, event_type: &EventType, id: HandlerId) -> bool {
        if let Some(mut entries) = self.handlers.get_mut(event_type) {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            if entries.len() < before {
                debug!(%event_type, handler_id = id.0, "handler unsubscribed");
                return true;
            }
        }
        false
    }

    /// Adds a middleware to the end of the pipeline.
    pub fn add_middleware(&self, middleware: Arc<dyn EventMiddleware>) {
        self.middlewares
            .write()
            .expect("middleware lock poisoned")
            .push(middleware);
    }

    /// Number of live handlers for one event type, or for all types.
    ///
    /// Weakly-held handlers whose target has been dropped stop counting
    /// once a publish cycle has pruned them.
    pub fn handler_count(&self, event_type: Option<&EventType>) -> usize {
        match event_type {
            Some(event_type) => self
                .handlers
                .get(event_type)
                .map(|entries| entries.len())
                .unwrap_or(0),
            None => self.handlers.iter().map(|entry| entry.value().len()).sum(),
        }
    }

    /// Event types that currently have at least one handler.
    pub fn event_types(&self) -> Vec<EventType> {
        self.handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Clears handlers for one event type, or all of them. Returns the
    /// number removed.
    pub fn clear_handlers(&self, event_type: Option<&EventType>) -> usize {
        match event_type {
            Some(event_type) => self
                .handlers
                .remove(event_type)
                .map(|(_, entries)| entries.len())
                .unwrap_or(0),
            None => {
                let total = self.handler_count(None);
                self.handlers.clear();
                total
            }
        }
    }

    /// Publishes an event, awaiting matching handlers one by one in
    /// priority order on the caller's task.
    ///
    /// Handler errors are logged and never abort delivery to the
    /// remaining handlers. Publishing on a stopped bus is a no-op.
    pub async fn publish(&self, event: Event) {
        let Some((event, handlers)) = self.prepare(event) else {
            return;
        };
        for (id, handler) in handlers {
            if let Err(e) = handler.handle(&event).await {
                error!(
                    handler_id = id.0,
                    event_type = %event.event_type(),
                    "event handler failed: {}", e
                );
            }
        }
    }

    /// Publishes an event, running all matching handlers concurrently and
    /// awaiting them together.
    ///
    /// Each handler's failure is captured and logged individually; none
    /// propagates to the publisher.
    pub async fn publish_async(&self, event: Event) {
        let Some((event, handlers)) = self.prepare(event) else {
            return;
        };
        let event = Arc::new(event);
        let tasks = handlers.into_iter().map(|(id, handler)| {
            let event = event.clone();
            async move { (id, handler.handle(&event).await) }
        });
        for (id, result) in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(
                    handler_id = id.0,
                    event_type = %event.event_type(),
                    "event handler failed: {}", e
                );
            }
        }
    }

    /// Runs the middleware pipeline and collects matching handlers.
    /// Returns `None` when the bus is stopped.
    fn prepare(&self, event: Event) -> Option<(Event, Vec<(HandlerId, Arc<dyn EventHandler>)>)> {
        if !self.running.load(Ordering::SeqCst) {
            warn!(event_type = %event.event_type(), "event bus is stopped, skipping publication");
            return None;
        }
        debug_event("publishing", &event);
        let event = self.apply_middlewares(event);
        let handlers = self.matching_handlers(&event);
        Some((event, handlers))
    }

    fn apply_middlewares(&self, event: Event) -> Event {
        let middlewares = self
            .middlewares
            .read()
            .expect("middleware lock poisoned")
            .clone();
        let mut processed = event;
        for middleware in middlewares {
            match middleware.process(processed.clone()) {
                Ok(event) => processed = event,
                Err(e) => error!("event middleware failed, keeping prior event: {}", e),
            }
        }
        processed
    }

    /// Prunes dead weak entries for the event's type, then returns the
    /// matching handlers in dispatch order.
    fn matching_handlers(&self, event: &Event) -> Vec<(HandlerId, Arc<dyn EventHandler>)> {
        let Some(mut entries) = self.handlers.get_mut(event.event_type()) else {
            return Vec::new();
        };
        entries.retain(|entry| match &entry.handler {
            HandlerRef::Strong(_) => true,
            HandlerRef::Weak(weak) => {
                let alive = weak.strong_count() > 0;
                if !alive {
                    trace!(handler_id = entry.id.0, "pruned dead weak handler");
                }
                alive
            }
        });
        entries
            .iter()
            .filter(|entry| entry.matches(event))
            .filter_map(|entry| entry.handler.upgrade().map(|h| (entry.id, h)))
            .collect()
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    match event.event_type() {
        EventType::HealthReport => trace!("{} event: {:?}", prefix, event),
        _ => debug!("{} event: {:?}", prefix, event),
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event handler failed: {message}")]
    Handler { message: String },

    #[error("Event middleware failed: {message}")]
    Middleware { message: String },

    #[error("Invalid event payload: {message}")]
    InvalidPayload { message: String },
}

impl EventError {
    pub fn handler(message: impl Into<String>) -> Self {
        EventError::Handler {
            message: message.into(),
        }
    }

    pub fn middleware(message: impl Into<String>) -> Self {
        EventError::Middleware {
            message: message.into(),
        }
    }
}

pub type EventResult<T> = Result<T, EventError>;
