//! Error taxonomy for the render lifecycle.
//!
//! Every failure surfaced to the caller of a render falls in one of three
//! [`ErrorKind`]s. Weak errors are expected conditions (a missing script, a
//! cancellation, the nested render ceiling) and are never logged as internal
//! bugs. Script faults carry the offending script's own message and stack.
//! Engine faults describe the boundary, transport or configuration failing.

use hookline_sandbox::SandboxError;
use thiserror::Error;

use crate::store::StoreError;

/// Coarse classification of a [`ScriptsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected, caller-facing condition.
    Weak,
    /// The script threw or rejected.
    ScriptFault,
    /// The boundary, transport or configuration failed.
    EngineFault,
}

/// Errors raised while running render hooks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScriptsError {
    /// A script reference did not resolve, or the user may not read it.
    #[error("Script not found or user not authorized to read it ({reference})")]
    ScriptNotFound {
        /// The shortid or name that was referenced.
        reference: String,
    },

    /// A script asked to cancel the request.
    #[error("Rendering request canceled from the script{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Canceled {
        /// Reason given by the script.
        message: Option<String>,
        /// Suggested status code.
        status_code: Option<u16>,
    },

    /// Too many nested renders for one external request.
    #[error("Reached maximum number of nested render requests ({max}). Verify proxy render calls are not causing a cycle")]
    CycleLimit {
        /// The ceiling.
        max: u32,
    },

    /// A render request named no template content.
    #[error("Template must contain content, name or shortid")]
    TemplateMissingContent,

    /// A template reference did not resolve.
    #[error("Template not found or user not authorized to read it ({reference})")]
    TemplateNotFound {
        /// The shortid or name that was referenced.
        reference: String,
    },

    /// The script threw, rejected, or never settled its hook.
    #[error("Error when evaluating script '{script}': {message}")]
    ScriptFault {
        /// Script display name.
        script: String,
        /// The script's error message.
        message: String,
        /// The script's stack, with engine frames removed.
        stack: Option<String>,
    },

    /// A `require` was refused by the module policy or could not be resolved.
    #[error("Error when loading modules for script '{script}': {message}")]
    ModuleDenied {
        /// Script display name.
        script: String,
        /// Message naming the configuration knob to change.
        message: String,
    },

    /// The script ran past its wall-clock budget and was stopped.
    #[error("Timeout when executing script '{script}' ({timeout_ms}ms). Increase `scripts.timeout_ms` in hookline.toml if the script legitimately needs more time")]
    Timeout {
        /// Script display name.
        script: String,
        /// Budget in milliseconds.
        timeout_ms: u64,
    },

    /// The sandbox refused or failed to run the script.
    #[error("Sandbox failed to run script '{script}': {source}")]
    Sandbox {
        /// Script display name.
        script: String,
        /// What went wrong.
        #[source]
        source: SandboxError,
    },

    /// The document store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The template engine failed.
    #[error("template engine failed: {0}")]
    Engine(String),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ScriptsError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ScriptNotFound { .. }
            | Self::Canceled { .. }
            | Self::CycleLimit { .. }
            | Self::TemplateMissingContent
            | Self::TemplateNotFound { .. } => ErrorKind::Weak,
            Self::ScriptFault { .. } => ErrorKind::ScriptFault,
            Self::ModuleDenied { .. }
            | Self::Timeout { .. }
            | Self::Sandbox { .. }
            | Self::Store(_)
            | Self::Engine(_)
            | Self::Internal(_) => ErrorKind::EngineFault,
        }
    }

    /// Whether this is an expected, caller-facing condition.
    pub fn is_weak(&self) -> bool {
        self.kind() == ErrorKind::Weak
    }

    /// Whether this error is a script timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Status code suggested for the transport layer.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Canceled { status_code, .. } => *status_code,
            Self::CycleLimit { .. } | Self::TemplateMissingContent => Some(400),
            Self::ScriptNotFound { .. } | Self::TemplateNotFound { .. } => Some(404),
            _ => None,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScriptNotFound { .. } => "SCRIPT_NOT_FOUND",
            Self::Canceled { .. } => "CANCELED",
            Self::CycleLimit { .. } => "CYCLE_LIMIT",
            Self::TemplateMissingContent => "TEMPLATE_INVALID",
            Self::TemplateNotFound { .. } => "TEMPLATE_NOT_FOUND",
            Self::ScriptFault { .. } => "SCRIPT_ERROR",
            Self::ModuleDenied { .. } => "MODULE_DENIED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Sandbox { .. } => "SANDBOX_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Stack of the failing script, if this is a script fault.
    pub fn script_stack(&self) -> Option<&str> {
        match self {
            Self::ScriptFault { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Startup-time problems assembling the action catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Two handler modules registered the same action name.
    #[error("proxy action '{action}' is registered by both '{first}' and '{second}'")]
    DuplicateAction {
        /// The contested action name.
        action: String,
        /// Module that registered it first.
        first: String,
        /// Module that tried to register it again.
        second: String,
    },

    /// An action name cannot be exposed in the sandbox.
    #[error("proxy action name '{action}' is invalid: {reason}")]
    InvalidName {
        /// The rejected name.
        action: String,
        /// Why.
        reason: &'static str,
    },
}
