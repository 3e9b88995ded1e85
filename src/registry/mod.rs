//! Service Registry
//!
//! A process-lifetime container of singleton services addressed by typed
//! keys. Modules publish services while registering and resolve them while
//! booting and handling requests.
//!
//! # Policy
//!
//! - A key can be set once. A second `set` under the same key fails with
//!   [`RegistryError::Duplicate`] instead of replacing the first value.
//! - Once the orchestrator has finished the registration phase it calls
//!   [`ServiceRegistry::seal`]; every later `set` fails with
//!   [`RegistryError::Sealed`].
//! - Lookups with a key whose type differs from the stored value report the
//!   service as absent, so a wrong-type value never leaves the registry.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trellis::config::Config;
//! use trellis::registry::{ServiceKey, ServiceRegistry};
//!
//! struct Greeter(&'static str);
//! const GREETER: ServiceKey<Greeter> = ServiceKey::new("demo.greeter");
//!
//! let registry = ServiceRegistry::new(Arc::new(Config::default()));
//! registry.set(&GREETER, Greeter("hello")).unwrap();
//! assert_eq!(registry.get(&GREETER).unwrap().0, "hello");
//! ```

mod error;
mod key;

pub use error::{RegistryError, RegistryResult};
pub use key::ServiceKey;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;

/// A stored service: the `Arc<T>` behind a type-erased handle
struct ServiceEntry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Concurrency-safe typed key/value container for services
pub struct ServiceRegistry {
    services: DashMap<&'static str, ServiceEntry>,
    config: Arc<Config>,
    sealed: AtomicBool,
}

impl ServiceRegistry {
    /// Create an empty registry carrying the process configuration
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            services: DashMap::new(),
            config,
            sealed: AtomicBool::new(false),
        }
    }

    /// Store `value` under `key`
    ///
    /// Accepts either a value or an `Arc` of it; trait objects must be passed
    /// as an already-coerced `Arc<dyn Trait>`.
    pub fn set<T>(&self, key: &ServiceKey<T>, value: impl Into<Arc<T>>) -> RegistryResult<()>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.is_sealed() {
            return Err(RegistryError::Sealed {
                key: key.name().to_string(),
            });
        }

        match self.services.entry(key.name()) {
            Entry::Occupied(existing) => Err(RegistryError::Duplicate {
                key: key.name().to_string(),
                existing_type: existing.get().type_name,
            }),
            Entry::Vacant(slot) => {
                let value: Arc<T> = value.into();
                slot.insert(ServiceEntry {
                    value: Box::new(value),
                    type_name: key.type_name(),
                });
                tracing::debug!(key = key.name(), service_type = key.type_name(), "Service registered");
                Ok(())
            }
        }
    }

    /// Resolve the service stored under `key`
    ///
    /// Returns `None` when the key is absent or holds a value of another type.
    pub fn get<T>(&self, key: &ServiceKey<T>) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = self.services.get(key.name())?;
        match entry.value.downcast_ref::<Arc<T>>() {
            Some(value) => Some(Arc::clone(value)),
            None => {
                tracing::warn!(
                    key = key.name(),
                    requested = key.type_name(),
                    stored = entry.type_name,
                    "Service type mismatch, treating as not registered"
                );
                None
            }
        }
    }

    /// Like [`get`](Self::get) but returns an error naming the key
    pub fn require<T>(&self, key: &ServiceKey<T>) -> RegistryResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get(key).ok_or_else(|| RegistryError::Missing {
            key: key.name().to_string(),
        })
    }

    /// Resolve a service that must exist
    ///
    /// # Panics
    ///
    /// Panics when the service is missing: that is a wiring bug in the
    /// module list, not a runtime condition.
    pub fn must_get<T>(&self, key: &ServiceKey<T>) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(value) => value,
            None => panic!(
                "required service '{}' ({}) is not registered",
                key.name(),
                key.type_name()
            ),
        }
    }

    /// Whether any value is stored under the key's name
    pub fn contains<T: ?Sized>(&self, key: &ServiceKey<T>) -> bool {
        self.services.contains_key(key.name())
    }

    /// The configuration the registry was constructed with
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Close the registration phase
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::SeqCst) {
            tracing::debug!(services = self.services.len(), "Service registry sealed");
        }
    }

    /// Whether [`seal`](Self::seal) has been called
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Sorted list of registered key names
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.services.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.keys())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
