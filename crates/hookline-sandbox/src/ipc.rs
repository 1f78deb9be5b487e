//! IPC protocol between the host and a `hookline-worker` child.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! All messages are typed via [`ParentMessage`] and [`ChildMessage`] enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SandboxError;
use crate::executor::{ExecutionMode, PreparedExecution, SandboxConfig};
use crate::types::{ExecutionResult, ProxyCallEnvelope};

/// Messages sent from the host to the worker child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Initial message: run this execution.
    Execute {
        /// Script, hook, state and resolved modules.
        execution: Box<PreparedExecution>,
        /// Worker limits.
        config: WorkerConfig,
    },
    /// Response to a proxy call request from the child.
    ProxyCallResult {
        /// Matches the request_id from [`ChildMessage::ProxyCallRequest`].
        request_id: u64,
        /// The action result, or an error message.
        result: Result<Value, String>,
    },
}

/// Messages sent from the worker child to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// Ask the host to dispatch a proxy call.
    ProxyCallRequest {
        /// Unique ID for correlating request and response.
        request_id: u64,
        /// The call.
        envelope: ProxyCallEnvelope,
    },
    /// The execution has finished.
    ExecutionComplete {
        /// The execution result, or why the boundary failed.
        result: Result<Box<ExecutionResult>, WorkerFailure>,
    },
    /// A log line from the worker.
    Log {
        /// The log message text.
        message: String,
    },
}

/// Boundary failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFailure {
    /// The watchdog terminated the script.
    Timeout {
        /// Budget in milliseconds.
        timeout_ms: u64,
    },
    /// V8 heap limit hit.
    HeapLimitExceeded,
    /// Script state too large.
    OutputTooLarge {
        /// Limit in bytes.
        max: usize,
    },
    /// Anything else.
    Failed {
        /// Error message.
        message: String,
    },
}

impl From<SandboxError> for WorkerFailure {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            SandboxError::HeapLimitExceeded => Self::HeapLimitExceeded,
            SandboxError::OutputTooLarge { max } => Self::OutputTooLarge { max },
            SandboxError::JsError { message } => Self::Failed { message },
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }
}

impl From<WorkerFailure> for SandboxError {
    fn from(f: WorkerFailure) -> Self {
        match f {
            WorkerFailure::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            WorkerFailure::HeapLimitExceeded => Self::HeapLimitExceeded,
            WorkerFailure::OutputTooLarge { max } => Self::OutputTooLarge { max },
            WorkerFailure::Failed { message } => Self::JsError { message },
        }
    }
}

/// Configuration passed to the worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum proxy calls per execution.
    pub max_proxy_calls: usize,
    /// Maximum size of a serialized proxy payload in bytes.
    pub max_proxy_payload_size: usize,
    /// Maximum size of the serialized script state in bytes.
    pub max_output_size: usize,
    /// Maximum size of script text in bytes.
    pub max_script_size: usize,
    /// Maximum IPC message size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

impl From<&SandboxConfig> for WorkerConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_heap_size: config.max_heap_size,
            max_proxy_calls: config.max_proxy_calls,
            max_proxy_payload_size: config.max_proxy_payload_size,
            max_output_size: config.max_output_size,
            max_script_size: config.max_script_size,
            max_ipc_message_size: config.max_ipc_message_size,
        }
    }
}

impl WorkerConfig {
    /// Convert back to a [`SandboxConfig`] for use in the worker.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            max_script_size: self.max_script_size,
            max_output_size: self.max_output_size,
            max_heap_size: self.max_heap_size,
            max_concurrent: 1, // worker handles one execution
            max_proxy_calls: self.max_proxy_calls,
            max_proxy_payload_size: self.max_proxy_payload_size,
            execution_mode: ExecutionMode::InProcess, // worker always runs in-process
            max_ipc_message_size: self.max_ipc_message_size,
        }
    }
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
