//! Service resolution boundary.
//!
//! The host does not own dependency registration. Callers hand it a
//! [`ServiceResolver`]; handler factories pull their constructor dependencies
//! out of it through the typed [`Services`] view.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::FactoryError;

/// Externally supplied service lookup (`resolve(type) -> instance | absent`).
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl<R> ServiceResolver for Arc<R>
where
    R: ServiceResolver + ?Sized,
{
    fn resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        (**self).resolve(type_id)
    }
}

/// Simple map-backed resolver.
///
/// Built during initialization (mutable), shared read-only afterwards.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service instance. A later registration of the same type wins.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: Arc<T>) -> &mut Self {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    pub fn with<T: Send + Sync + 'static>(mut self, service: Arc<T>) -> Self {
        self.insert(service);
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl core::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}

impl ServiceResolver for ServiceRegistry {
    fn resolve(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&type_id).cloned()
    }
}

/// Typed view over a resolver, handed to handler factories.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    resolver: &'a dyn ServiceResolver,
}

impl<'a> Services<'a> {
    pub fn new(resolver: &'a dyn ServiceResolver) -> Self {
        Self { resolver }
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolver
            .resolve(TypeId::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// Resolve a dependency the handler cannot be built without.
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, FactoryError> {
        self.resolve::<T>()
            .ok_or(FactoryError::MissingService(type_name::<T>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct SmsGateway {
        sender: &'static str,
    }

    #[test]
    fn resolves_registered_service() {
        let registry = ServiceRegistry::new().with(Arc::new(SmsGateway { sender: "ops" }));
        let services = Services::new(&registry);

        let gateway = services.require::<SmsGateway>().unwrap();
        assert_eq!(gateway.sender, "ops");
    }

    #[test]
    fn missing_service_names_the_type() {
        let registry = ServiceRegistry::new();
        let services = Services::new(&registry);

        assert!(services.resolve::<SmsGateway>().is_none());
        let err = services.require::<SmsGateway>().unwrap_err();
        assert!(matches!(err, FactoryError::MissingService(name) if name.ends_with("SmsGateway")));
    }
}
