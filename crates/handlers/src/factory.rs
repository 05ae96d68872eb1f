//! Job handler factory.
//!
//! Each handler type is registered with an explicit constructor closure instead
//! of being discovered at runtime. The closure receives the typed service view
//! and the decoded work item, so a constructor parameter "of the work item's
//! type" is simply the second argument.

use std::sync::Arc;

use crate::error::FactoryError;
use crate::handler::JobHandler;
use crate::services::Services;

type Constructor<H> =
    dyn Fn(&Services<'_>, &<H as JobHandler>::WorkItem) -> Result<H, FactoryError> + Send + Sync;

/// Builds one handler instance per work item.
pub struct HandlerFactory<H: JobHandler> {
    constructor: Arc<Constructor<H>>,
}

impl<H: JobHandler> HandlerFactory<H> {
    /// Factory from an explicit constructor.
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(&Services<'_>, &H::WorkItem) -> Result<H, FactoryError> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
        }
    }

    /// Factory for handlers that only need their services.
    pub fn from_services<F>(constructor: F) -> Self
    where
        F: Fn(&Services<'_>) -> Result<H, FactoryError> + Send + Sync + 'static,
    {
        Self::new(move |services, _item| constructor(services))
    }

    /// Fails fast when a dependency cannot be resolved.
    pub fn create(&self, services: &Services<'_>, item: &H::WorkItem) -> Result<H, FactoryError> {
        (self.constructor)(services, item)
    }
}

impl<H: JobHandler + Clone> HandlerFactory<H> {
    /// Factory that hands out clones of a prototype instance.
    pub fn shared(prototype: H) -> Self {
        Self::new(move |_services, _item| Ok(prototype.clone()))
    }
}

impl<H: JobHandler> Clone for HandlerFactory<H> {
    fn clone(&self) -> Self {
        Self {
            constructor: self.constructor.clone(),
        }
    }
}
