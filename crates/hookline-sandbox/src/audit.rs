//! Audit logging for script executions.
//!
//! Every execution produces one [`AuditEntry`]. Script text is never stored
//! raw: the entry carries a SHA-256 hash and a short redacted preview. Proxy
//! call payloads are hashed the same way.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::types::{ExecutionResult, Hook, ProxyCallEnvelope};
use crate::ProxyDispatcher;

const SCRIPT_PREVIEW_MAX: usize = 200;

/// A complete audit record for one script execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique id for this execution.
    pub execution_id: String,
    /// When the execution started.
    pub timestamp: DateTime<Utc>,
    /// Script name as known to the host.
    pub script_name: String,
    /// SHA-256 of the script text.
    pub script_hash: String,
    /// First bytes of the script, redacted.
    pub script_preview: String,
    /// Hook that was run.
    pub hook: Hook,
    /// Proxy calls made during the execution.
    pub proxy_calls: Vec<ProxyCallAudit>,
    /// Number of captured console entries.
    pub log_count: usize,
    /// Total wall-clock time in milliseconds.
    pub duration_ms: u64,
    /// How the execution ended.
    pub outcome: AuditOutcome,
}

/// Audit record for one proxy call.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyCallAudit {
    /// Catalog action name.
    pub action: String,
    /// SHA-256 of the serialized payload.
    pub payload_hash: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the action succeeded.
    pub success: bool,
}

/// The outcome of a script execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The hook completed.
    Success,
    /// The script requested cancellation.
    Canceled,
    /// The script failed.
    ScriptError {
        /// Failure message.
        message: String,
    },
    /// The execution was terminated on timeout.
    Timeout,
    /// The boundary itself failed.
    Error {
        /// Error message.
        message: String,
    },
}

impl AuditOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Canceled => "canceled",
            Self::ScriptError { .. } => "script_error",
            Self::Timeout => "timeout",
            Self::Error { .. } => "error",
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// A no-op audit logger.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as `tracing` events at INFO with `audit = true`.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            script = %entry.script_name,
            hook = %entry.hook,
            script_hash = %entry.script_hash,
            duration_ms = entry.duration_ms,
            proxy_calls = entry.proxy_calls.len(),
            logs = entry.log_count,
            outcome = entry.outcome.label(),
            "audit"
        );
    }
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a logger writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the sink.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// SHA-256 of a string as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First bytes of `script`, cut at a char boundary, with an ellipsis if truncated.
pub fn script_preview(script: &str) -> String {
    if script.len() <= SCRIPT_PREVIEW_MAX {
        return script.to_string();
    }
    let mut end = SCRIPT_PREVIEW_MAX;
    while !script.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &script[..end])
}

/// Builds an [`AuditEntry`] while an execution is in flight.
pub struct AuditEntryBuilder {
    execution_id: String,
    timestamp: DateTime<Utc>,
    script_name: String,
    script_hash: String,
    script_preview: String,
    hook: Hook,
    proxy_calls: Vec<ProxyCallAudit>,
    start: Instant,
}

impl AuditEntryBuilder {
    /// Start an entry for `script`.
    pub fn new(script_name: &str, script: &str, hook: Hook) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            script_name: script_name.to_string(),
            script_hash: sha256_hex(script),
            script_preview: crate::redact::redact_error_message(&script_preview(script)),
            hook,
            proxy_calls: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Execution id, for correlating log lines.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Record a proxy call.
    pub fn record_proxy_call(&mut self, audit: ProxyCallAudit) {
        self.proxy_calls.push(audit);
    }

    /// Finalize with the execution result.
    pub fn finish(self, result: &Result<ExecutionResult, SandboxError>) -> AuditEntry {
        let (log_count, outcome) = match result {
            Ok(r) => {
                let outcome = if let Some(err) = &r.error {
                    AuditOutcome::ScriptError {
                        message: crate::redact::redact_error_message(&err.message),
                    }
                } else if r.cancel.is_some() {
                    AuditOutcome::Canceled
                } else {
                    AuditOutcome::Success
                };
                (r.logs.len(), outcome)
            }
            Err(SandboxError::Timeout { .. }) => (0, AuditOutcome::Timeout),
            Err(e) => (
                0,
                AuditOutcome::Error {
                    message: crate::redact::redact_error_message(&e.to_string()),
                },
            ),
        };

        AuditEntry {
            execution_id: self.execution_id,
            timestamp: self.timestamp,
            script_name: self.script_name,
            script_hash: self.script_hash,
            script_preview: self.script_preview,
            hook: self.hook,
            proxy_calls: self.proxy_calls,
            log_count,
            duration_ms: self.start.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// Wraps a [`ProxyDispatcher`] and reports every call on a channel.
pub struct AuditingDispatcher {
    inner: Arc<dyn ProxyDispatcher>,
    audit_tx: tokio::sync::mpsc::UnboundedSender<ProxyCallAudit>,
}

impl AuditingDispatcher {
    /// Wrap a dispatcher with audit recording.
    pub fn new(
        inner: Arc<dyn ProxyDispatcher>,
        audit_tx: tokio::sync::mpsc::UnboundedSender<ProxyCallAudit>,
    ) -> Self {
        Self { inner, audit_tx }
    }
}

#[async_trait::async_trait]
impl ProxyDispatcher for AuditingDispatcher {
    async fn dispatch(
        &self,
        envelope: ProxyCallEnvelope,
    ) -> Result<serde_json::Value, hookline_error::DispatchError> {
        let action = envelope.action.clone();
        let payload_hash = sha256_hex(&envelope.payload.to_string());
        let start = Instant::now();

        let result = self.inner.dispatch(envelope).await;

        let _ = self.audit_tx.send(ProxyCallAudit {
            action,
            payload_hash,
            duration_ms: start.elapsed().as_millis() as u64,
            success: result.is_ok(),
        });

        result
    }
}
