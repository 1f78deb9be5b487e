#![warn(missing_docs)]

//! # hookline-sandbox
//!
//! V8 isolation boundary for hookline render scripts.
//!
//! Runs one user script per fresh deno_core isolate with no filesystem,
//! network or environment access. A script sees a copy of the render request
//! and response, a captured `console`, `setTimeout`, a `Buffer` type, and a
//! `require` that only resolves allow-listed modules plus the
//! `hookline-proxy` module. Every host capability goes through that proxy,
//! which serializes calls into [`ProxyCallEnvelope`]s for a
//! [`ProxyDispatcher`].
//!
//! ## Security model
//!
//! - **Fresh isolate per execution**: no state leaks between scripts
//! - **No ambient capabilities**: `Deno`, `eval` and the function constructors are removed
//! - **Pre-execution validation**: banned escape patterns rejected before reaching V8
//! - **Wall-clock watchdog and heap limit**: runaway scripts are terminated
//! - **Redacted proxy errors**: host details never reach script code
//! - **Optional child-process isolation** via `hookline-worker`

pub mod audit;
pub mod binary;
mod bootstrap;
pub mod boundary;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
pub mod modules;
pub mod ops;
pub mod redact;
pub mod types;
pub mod validator;

pub use error::SandboxError;
pub use executor::{
    ExecutionMode, ExecutionTransport, InProcessTransport, PreparedExecution, SandboxConfig,
    SandboxExecutor,
};
pub use modules::{ModulePolicy, PreparedModules, PROXY_MODULE};
pub use types::{
    CancelRequest, ContextMeta, ExecutionResult, ExecutionSpec, FailureKind, Hook, LogEntry,
    LogLevel, ProxyCallEnvelope, ResponseSnapshot, ScriptFailure, StateSnapshot,
};

/// Names of the built-in proxy actions every catalog provides.
pub mod actions {
    /// Render another template inside the current request.
    pub const RENDER: &str = "render";
    /// Query a document-store collection.
    pub const FIND: &str = "documentStore.collection.find";
    /// Query a document-store collection for a single document.
    pub const FIND_ONE: &str = "documentStore.collection.findOne";
}

/// Host side of the proxy bridge.
///
/// The sandbox never touches host objects directly: every proxy call is
/// serialized into a [`ProxyCallEnvelope`] and routed here. Implementations
/// decide what an action name means and which request it runs against.
#[async_trait::async_trait]
pub trait ProxyDispatcher: Send + Sync {
    /// Dispatch one proxy call and return its JSON result.
    async fn dispatch(
        &self,
        envelope: ProxyCallEnvelope,
    ) -> Result<serde_json::Value, hookline_error::DispatchError>;
}
