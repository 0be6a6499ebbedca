//! Managed external dependencies: lifecycle state machine, connection
//! pooling and bulk orchestration.

pub mod base;
pub mod manager;
pub mod pool;
pub mod state;

pub use base::{Resource, ResourceDriver, ResourceStats};
pub use manager::{HealthSummary, ResourceManager, StartupReport};
pub use pool::{ConnectionFactory, PoolStats, Pooled, ResourcePool};
pub use state::{ResourceHealth, ResourceOp, ResourceState};

use std::time::Duration;

use thiserror::Error;

use state::ResourceState as State;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource operation failed for `{name}`: {message}")]
    Operation { name: String, message: String },

    #[error("Resource not found: {name}")]
    NotFound { name: String },

    #[error("Resource `{name}` is in state `{current}` but requires {required}")]
    State {
        name: String,
        current: State,
        required: String,
    },

    #[error("Failed to connect resource `{name}`: {message}")]
    Connection { name: String, message: String },

    #[error("Resource operation `{operation}` timed out after {timeout:?} for `{name}`")]
    Timeout {
        name: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Resource pool `{name}` exhausted (max size: {max_size})")]
    PoolExhausted { name: String, max_size: usize },

    #[error("Invalid configuration for `{name}`: {key} should be {expected}")]
    Configuration {
        name: String,
        key: String,
        expected: String,
    },

    #[error("Resource `{name}` is shut down")]
    Shutdown { name: String },
}

impl ResourceError {
    pub fn operation(name: impl Into<String>, message: impl Into<String>) -> Self {
        ResourceError::Operation {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn connection(name: impl Into<String>, message: impl Into<String>) -> Self {
        ResourceError::Connection {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;
