//! Typed service keys

use std::fmt;
use std::marker::PhantomData;

/// A registry key carrying the type of the service stored under it
///
/// Keys are usually declared as constants next to the service they name:
///
/// ```rust
/// use trellis::registry::ServiceKey;
///
/// pub struct Mailer;
/// pub const MAILER: ServiceKey<Mailer> = ServiceKey::new("email.mailer");
/// ```
///
/// `T` may be unsized, so trait objects work as well
/// (`ServiceKey<dyn Publisher>`).
pub struct ServiceKey<T: ?Sized> {
    name: &'static str,
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized> ServiceKey<T> {
    /// Create a key with a stable string identifier
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The key's string identifier
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Name of the value type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl<T: ?Sized> Clone for ServiceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ServiceKey<T> {}

impl<T: ?Sized> fmt::Debug for ServiceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceKey")
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: ?Sized> fmt::Display for ServiceKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
