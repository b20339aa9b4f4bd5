//! capllama host: context registry, request dispatcher and native delegate bridge.

pub mod config;
pub mod delegate;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod gguf;
pub mod logging;
pub mod models;
pub mod native;
pub mod registry;

pub use config::PluginConfig;
pub use delegate::{Delegate, Session, TokenSink};
pub use dispatch::Dispatcher;
pub use errors::{ErrorPayload, PluginError, Result};
pub use events::{EventBus, PluginEvent, EVENT_ON_NATIVE_LOG, EVENT_ON_TOKEN};
pub use registry::{Context, ContextId, ContextRegistry, DEFAULT_CONTEXT_LIMIT};
