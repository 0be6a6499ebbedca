//! Crate-wide error type aggregating the per-module errors.

use thiserror::Error;

use crate::component::ComponentError;
use crate::config::ConfigError;
use crate::di::DependencyError;
use crate::event_bus::EventError;
use crate::resource::ResourceError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

pub type AppResult<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_errors_convert() {
        fn lookup() -> AppResult<()> {
            Err(ResourceError::NotFound {
                name: "db".to_string(),
            })?;
            Ok(())
        }

        let err = lookup().unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert_eq!(err.to_string(), "Resource not found: db");
    }
}
