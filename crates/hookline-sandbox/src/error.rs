//! Error types for the hookline sandbox.

use thiserror::Error;

/// Errors that can occur while preparing or running a script in the sandbox.
///
/// A script that throws is *not* a `SandboxError`: script failures travel
/// inside [`ExecutionResult::error`](crate::ExecutionResult) so that the logs
/// and state captured up to the failure survive. These variants describe the
/// boundary itself misbehaving or refusing to run.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Script failed pre-execution validation.
    #[error("script validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Script text exceeds the configured maximum size.
    #[error("script exceeds maximum size of {max} bytes (got {actual})")]
    ScriptTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned runtime-escape pattern was found in the script text.
    #[error("banned pattern detected: `{pattern}`. Scripts only reach the host through require('hookline-proxy') and the request/response objects")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The serialized script state exceeds the configured maximum size.
    #[error("script state exceeds maximum size of {max} bytes")]
    OutputTooLarge {
        /// Maximum allowed size.
        max: usize,
    },

    /// Execution ran past its wall-clock budget and was terminated.
    #[error("script execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// Engine-side JavaScript failure outside of user code (bootstrap, snapshot).
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// The worker process or transport failed.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// State serialization failed.
    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether this error is a wall-clock timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
