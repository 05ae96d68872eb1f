//! `jobhost-handlers`: the handler side of the job host.
//!
//! Handlers are plain, constructor-injected types that implement [`JobHandler`].
//! The host never inspects them at runtime: each handler is registered together
//! with an explicit [`HandlerFactory`] that builds an instance per work item from
//! externally supplied services, and the [`HandlerRegistry`] maps queue names and
//! task ids to those type-erased entries.

pub mod codec;
pub mod context;
pub mod error;
pub mod factory;
pub mod handler;
pub mod registry;
pub mod services;

pub use codec::JsonCodec;
pub use context::{JobContext, WorkKind};
pub use error::{FactoryError, JobError, RegistryError};
pub use factory::HandlerFactory;
pub use handler::JobHandler;
pub use registry::{ErasedJob, HandlerRegistry};
pub use services::{ServiceRegistry, ServiceResolver, Services};
