//! Layer dispatch runtime.
//!
//! Every call to a layer goes through a [`LayerHandle`], which runs a fixed
//! pipeline in front of the implementation: cancellation check, access
//! decision, session stack frame, permission tags, argument adaptation,
//! proxy hooks, and rolling statistics. Calls to layers with no local
//! implementation fall back to the [`DistributedBridge`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use serde_json::{Value, json};
//! use stratum_core::{BoxFuture, CallContext, Layer, LayerError, LayerHandle, LayerTarget, Runtime};
//!
//! struct Invoices;
//!
//! impl LayerTarget for Invoices {
//!     fn call<'a>(
//!         &'a self,
//!         _cx: &'a CallContext,
//!         operation: &'a str,
//!         _args: &'a [Value],
//!     ) -> BoxFuture<'a, Result<Value, LayerError>> {
//!         Box::pin(async move { Ok(json!({ "operation": operation })) })
//!     }
//! }
//!
//! impl Layer for Invoices {
//!     fn type_name(&self) -> &str {
//!         "billing::Invoices"
//!     }
//! }
//!
//! # async fn run() -> Result<(), LayerError> {
//! let runtime = Runtime::builder().build();
//! runtime
//!     .register(LayerHandle::builder(Invoices).implementation("billing"))
//!     .await?;
//!
//! let cx = runtime.spawn_context().await;
//! let total = cx.invoke("billing::Invoices", "billing", "total", vec![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod config;
pub mod dispatcher;
pub mod distributed;
pub mod error;
pub mod layer;
pub mod permission;
pub mod plugin;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod statistic;
pub mod worker;

pub use access::AccessDecision;
pub use config::RuntimeConfig;
pub use dispatcher::{LayerDescriptor, LayerHandle, LayerHandleBuilder};
pub use distributed::{DistributedBridge, LoopbackTransport, RemoteEndpoint, Transport};
pub use error::{BridgeError, ConfigError, ContextError, LayerError};
pub use layer::{ArgumentAdapter, BoxFuture, Layer, LayerTarget, OperationDescriptor};
pub use permission::{PermissionAuthority, SessionPermissions};
pub use plugin::PluginLayer;
pub use proxy::{CachingProxy, Interception, LayerProxy};
pub use registry::LayerRegistry;
pub use runtime::{CallContext, Runtime, RuntimeBuilder};
pub use session::{Session, StackFrame};
pub use statistic::{RollingStatistic, StatisticsSnapshot};
pub use worker::{ResourceProbe, ResourceUsage, WorkerContext, WorkerId};
