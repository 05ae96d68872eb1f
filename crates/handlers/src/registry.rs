//! Dispatch table from queue names / task ids to type-erased handlers.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::codec::JsonCodec;
use crate::context::JobContext;
use crate::error::{JobError, RegistryError};
use crate::factory::HandlerFactory;
use crate::handler::JobHandler;
use crate::services::{ServiceResolver, Services};

/// A handler with its work item type erased.
///
/// One invocation = decode payload → build handler via its factory → process.
#[async_trait]
pub trait ErasedJob: Send + Sync {
    async fn invoke(
        &self,
        payload: Option<&Value>,
        services: &dyn ServiceResolver,
        ctx: &JobContext,
    ) -> Result<(), JobError>;

    /// Rust type name of the handler, for logs.
    fn handler_type(&self) -> &'static str;
}

struct TypedJob<H: JobHandler> {
    factory: HandlerFactory<H>,
    _handler: PhantomData<fn() -> H>,
}

#[async_trait]
impl<H: JobHandler> ErasedJob for TypedJob<H> {
    async fn invoke(
        &self,
        payload: Option<&Value>,
        services: &dyn ServiceResolver,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let item: H::WorkItem = JsonCodec::decode(payload)?;
        let handler = self.factory.create(&Services::new(services), &item)?;
        handler.process(item, ctx).await.map_err(JobError::Handler)
    }

    fn handler_type(&self) -> &'static str {
        std::any::type_name::<H>()
    }
}

/// Registry of handlers (dispatch key -> handler).
///
/// Built during initialization (mutable), used read-only by the host.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedJob>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a dispatch key (queue name or task id).
    pub fn register<H: JobHandler>(
        &mut self,
        key: impl Into<String>,
        factory: HandlerFactory<H>,
    ) -> Result<(), RegistryError> {
        let key = key.into();
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        self.handlers.insert(
            key,
            Arc::new(TypedJob {
                factory,
                _handler: PhantomData,
            }),
        );
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ErasedJob>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Look up and invoke in one step.
    pub async fn invoke(
        &self,
        key: &str,
        payload: Option<&Value>,
        services: &dyn ServiceResolver,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let job = self
            .get(key)
            .ok_or_else(|| JobError::NoHandler(key.to_string()))?;
        debug!(key, handler = job.handler_type(), "invoking handler");
        job.invoke(payload, services, ctx).await
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("keys", &keys).finish()
    }
}
