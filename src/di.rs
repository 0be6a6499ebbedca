//! Type-keyed dependency injection container.
//!
//! Providers are registered per concrete type, either as a ready
//! instance or as a factory that may resolve its own dependencies
//! through the [`Resolver`] it receives. Singleton factories run once
//! and cache their value; transient factories run on every resolution.
//! Circular factory chains are detected and reported with the full
//! resolution path instead of overflowing the stack.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Scope {
    /// The factory runs once; every resolution shares the value.
    Singleton,
    /// The factory runs on every resolution.
    Transient,
}

#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("No provider registered for type `{type_name}`")]
    NoProvider { type_name: &'static str },

    #[error("Circular dependency: {path}")]
    Circular { path: String },

    #[error("Provider for `{type_name}` failed: {message}")]
    Provider {
        type_name: &'static str,
        message: String,
    },
}

pub type DependencyResult<T> = Result<T, DependencyError>;

type AnyArc = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Resolver<'_>) -> DependencyResult<AnyArc> + Send + Sync>;

struct Provider {
    type_name: &'static str,
    scope: Scope,
    factory: Factory,
    cached: RwLock<Option<AnyArc>>,
}

/// Registry of providers keyed by [`TypeId`].
#[derive(Default)]
pub struct Container {
    providers: DashMap<TypeId, Arc<Provider>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an existing value as a singleton.
    pub fn register_instance<T: Send + Sync + 'static>(&self, instance: T) {
        self.register_arc(Arc::new(instance));
    }

    /// Registers an already shared value as a singleton.
    pub fn register_arc<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
        let type_name = std::any::type_name::<T>();
        debug!(type_name, "instance registered");
        self.providers.insert(
            TypeId::of::<T>(),
            Arc::new(Provider {
                type_name,
                scope: Scope::Singleton,
                factory: Arc::new(move |_| Ok(instance.clone() as AnyArc)),
                cached: RwLock::new(None),
            }),
        );
    }

    /// Registers a factory for `T` under the given scope.
    ///
    /// The factory receives a [`Resolver`] to obtain its own
    /// dependencies from the same container.
    pub fn register_factory<T, F>(&self, scope: Scope, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> DependencyResult<T> + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        debug!(type_name, %scope, "factory registered");
        self.providers.insert(
            TypeId::of::<T>(),
            Arc::new(Provider {
                type_name,
                scope,
                factory: Arc::new(move |resolver| {
                    factory(resolver).map(|value| Arc::new(value) as AnyArc)
                }),
                cached: RwLock::new(None),
            }),
        );
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.providers.contains_key(&TypeId::of::<T>())
    }

    /// Resolves a `T`, running factories as needed.
    pub fn get<T: Send + Sync + 'static>(&self) -> DependencyResult<Arc<T>> {
        Resolver {
            container: self,
            path: RefCell::new(Vec::new()),
        }
        .resolve::<T>()
    }
}

/// Resolution context threaded through factories.
///
/// Tracks the chain of types being resolved so a factory that directly
/// or indirectly requires itself fails with the full path.
pub struct Resolver<'a> {
    container: &'a Container,
    path: RefCell<Vec<&'static str>>,
}

impl Resolver<'_> {
    pub fn resolve<T: Send + Sync + 'static>(&self) -> DependencyResult<Arc<T>> {
        let provider = self
            .container
            .providers
            .get(&TypeId::of::<T>())
            .map(|entry| entry.value().clone())
            .ok_or(DependencyError::NoProvider {
                type_name: std::any::type_name::<T>(),
            })?;

        if self.path.borrow().contains(&provider.type_name) {
            let mut path = self.path.borrow().join(" -> ");
            path.push_str(" -> ");
            path.push_str(provider.type_name);
            return Err(DependencyError::Circular { path });
        }

        if provider.scope == Scope::Singleton {
            if let Some(cached) = provider.cached.read().expect("provider lock poisoned").clone() {
                return Ok(downcast(cached, provider.type_name));
            }
        }

        self.path.borrow_mut().push(provider.type_name);
        let produced = (provider.factory)(self);
        self.path.borrow_mut().pop();
        let value = produced?;

        if provider.scope == Scope::Singleton {
            let mut cached = provider.cached.write().expect("provider lock poisoned");
            // Another resolver may have raced us; keep the first value.
            if let Some(existing) = cached.clone() {
                return Ok(downcast(existing, provider.type_name));
            }
            *cached = Some(value.clone());
        }
        Ok(downcast(value, provider.type_name))
    }
}

fn downcast<T: Send + Sync + 'static>(value: AnyArc, type_name: &'static str) -> Arc<T> {
    value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("provider for `{}` produced a foreign type", type_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    struct Settings {
        url: String,
    }

    #[derive(Debug)]
    struct Repository {
        settings: Arc<Settings>,
    }

    #[derive(Debug)]
    struct Service {
        repository: Arc<Repository>,
    }

    #[test]
    fn test_instance_resolution() {
        let container = Container::new();
        container.register_instance(Settings {
            url: "postgres://localhost".to_string(),
        });

        let settings = container.get::<Settings>().unwrap();
        assert_eq!(settings.url, "postgres://localhost");
        assert!(container.contains::<Settings>());
        assert!(!container.contains::<Service>());
    }

    #[test]
    fn test_factories_resolve_their_dependencies() {
        let container = Container::new();
        container.register_instance(Settings {
            url: "postgres://localhost".to_string(),
        });
        container.register_factory(Scope::Singleton, |r: &Resolver<'_>| {
            Ok(Repository {
                settings: r.resolve()?,
            })
        });
        container.register_factory(Scope::Transient, |r: &Resolver<'_>| {
            Ok(Service {
                repository: r.resolve()?,
            })
        });

        let service = container.get::<Service>().unwrap();
        assert_eq!(service.repository.settings.url, "postgres://localhost");
    }

    #[test]
    fn test_singleton_is_shared_transient_is_not() {
        let container = Container::new();
        container.register_instance(Settings {
            url: "x".to_string(),
        });
        container.register_factory(Scope::Singleton, |r: &Resolver<'_>| {
            Ok(Repository {
                settings: r.resolve()?,
            })
        });
        container.register_factory(Scope::Transient, |r: &Resolver<'_>| {
            Ok(Service {
                repository: r.resolve()?,
            })
        });

        let a = container.get::<Repository>().unwrap();
        let b = container.get::<Repository>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let s1 = container.get::<Service>().unwrap();
        let s2 = container.get::<Service>().unwrap();
        assert!(!Arc::ptr_eq(&s1, &s2));
        assert!(Arc::ptr_eq(&s1.repository, &s2.repository));
    }

    #[test]
    fn test_missing_provider() {
        let container = Container::new();
        let err = container.get::<Service>().unwrap_err();
        match err {
            DependencyError::NoProvider { type_name } => {
                assert!(type_name.contains("Service"));
            }
            other => panic!("expected NoProvider, got {:?}", other),
        }
    }

    #[test]
    fn test_circular_dependency_is_reported() {
        #[derive(Debug)]
        struct A(#[allow(dead_code)] Arc<B>);
        #[derive(Debug)]
        struct B(#[allow(dead_code)] Arc<A>);

        let container = Container::new();
        container.register_factory(Scope::Transient, |r: &Resolver<'_>| Ok(A(r.resolve()?)));
        container.register_factory(Scope::Transient, |r: &Resolver<'_>| Ok(B(r.resolve()?)));

        let err = container.get::<A>().unwrap_err();
        match err {
            DependencyError::Circular { path } => {
                assert!(path.contains("A"));
                assert!(path.contains("B"));
                assert!(path.contains("->"));
            }
            other => panic!("expected Circular, got {:?}", other),
        }
    }
}
