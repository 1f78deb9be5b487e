//! Data crossing the isolation boundary.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::modules::ModulePolicy;

/// One of the two extension points of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Runs before the document is rendered.
    Before,
    /// Runs after the document is rendered.
    After,
}

impl Hook {
    /// The function name a script defines to participate in this hook.
    pub fn function_name(self) -> &'static str {
        match self {
            Self::Before => "beforeRender",
            Self::After => "afterRender",
        }
    }

    /// The bootstrap entry point appended to the script to trigger this hook.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Before => "__runBeforeHook",
            Self::After => "__runAfterHook",
        }
    }

    /// Short lowercase name, used in logs and audit entries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The response as the sandbox sees it: bytes plus free-form metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// Document bytes.
    #[serde(with = "crate::binary::bytes", default)]
    pub content: Vec<u8>,
    /// Response metadata (headers, content type, ...).
    #[serde(default)]
    pub meta: Map<String, Value>,
}

/// Which request-context fields are hidden from or frozen inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMeta {
    /// Removed from `req.context` before the script sees it.
    #[serde(default)]
    pub hidden: Vec<String>,
    /// Visible but not assignable from inside the sandbox.
    #[serde(default)]
    pub read_only: Vec<String>,
}

/// Everything needed to run one script for one hook.
///
/// Built fresh by the lifecycle controller for every script execution and
/// discarded after its result has been merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    /// Human-readable script identifier, used in logs and error messages.
    pub script_name: String,
    /// Script source text.
    pub script: String,
    /// Which hook to run.
    pub hook: Hook,
    /// Sandbox-visible copy of the request (`template`, `data`, `options`, `context`).
    pub request: Value,
    /// Copy of the response.
    pub response: ResponseSnapshot,
    /// Module allow-list.
    pub modules: ModulePolicy,
    /// Directories searched when resolving `require` names, in order.
    #[serde(default)]
    pub module_roots: Vec<PathBuf>,
    /// Wall-clock budget for the whole execution, including async continuations.
    pub timeout_ms: u64,
    /// Context field visibility.
    #[serde(default)]
    pub context_meta: ContextMeta,
    /// Action names exposed through the proxy module.
    #[serde(default)]
    pub proxy_actions: Vec<String>,
}

/// Severity of a captured console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.log`, `console.debug`, `console.trace`.
    Debug,
    /// `console.info`.
    Info,
    /// `console.warn`.
    Warn,
    /// `console.error`.
    Error,
}

impl LogLevel {
    /// Map a console method name to a level. Unknown names log at debug.
    pub fn from_console(method: &str) -> Self {
        match method {
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Debug,
        }
    }

    /// Lowercase level name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A console call captured inside the sandbox, timestamped when it was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Formatted message.
    pub message: String,
    /// Time of the console call.
    pub timestamp: DateTime<Utc>,
}

/// How a script failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The script threw or rejected with an `Error`.
    Thrown,
    /// The script threw, rejected, or called `done` with something that is not an `Error`.
    NonError,
    /// A `require` call was refused or could not be resolved.
    Module,
    /// The hook returned without ever signalling completion.
    Unsettled,
}

/// A failure raised by the script itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    /// Error message.
    pub message: String,
    /// Sanitized stack, if the thrown value carried one.
    #[serde(default)]
    pub stack: Option<String>,
    /// Failure classification.
    pub kind: FailureKind,
}

/// A cooperative cancellation requested through `req.cancel(..)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Optional reason.
    #[serde(default)]
    pub message: Option<String>,
    /// Optional suggested status code.
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Plain-data copy of the request and response as seen inside the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// The request view.
    pub request: Value,
    /// The response view.
    pub response: ResponseSnapshot,
}

/// Outcome of one [`ExecutionSpec`].
///
/// Exactly one result is produced per spec. The request and response are
/// always copies and never alias host objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The request as the script left it.
    pub request: Value,
    /// The response as the script left it.
    pub response: ResponseSnapshot,
    /// Console output, in call order.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Set when the script failed.
    #[serde(default)]
    pub error: Option<ScriptFailure>,
    /// Set when the script asked to cancel the external request.
    #[serde(default)]
    pub cancel: Option<CancelRequest>,
    /// Whether the script defines an `afterRender` function, as observed by the host.
    #[serde(default)]
    pub after_hook_defined: bool,
}

/// The only unit crossing the boundary in the script-to-host direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCallEnvelope {
    /// Catalog action name.
    pub action: String,
    /// JSON payload.
    #[serde(default)]
    pub payload: Value,
}
