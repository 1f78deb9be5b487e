//! Child-process transport: runs each execution in a `hookline-worker` process.
//!
//! Spawns the worker with a clean environment, talks length-delimited JSON
//! over stdin/stdout, and routes proxy calls through the host's
//! [`ProxyDispatcher`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::Command;

use crate::error::SandboxError;
use crate::executor::{ExecutionTransport, PreparedExecution, SandboxConfig};
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::types::ExecutionResult;
use crate::ProxyDispatcher;

const WORKER_BIN_NAME: &str = "hookline-worker";
const WORKER_BIN_ENV: &str = "HOOKLINE_WORKER_BIN";
const DEBUG_ENV: &str = "HOOKLINE_DEBUG";

/// Runs executions in isolated worker child processes.
pub struct ChildProcessTransport;

#[async_trait::async_trait]
impl ExecutionTransport for ChildProcessTransport {
    async fn execute(
        &self,
        config: &SandboxConfig,
        execution: PreparedExecution,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError> {
        let worker_bin = find_worker_binary()?;
        let timeout_ms = execution.spec.timeout_ms;

        let mut child = Command::new(&worker_bin)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if std::env::var(DEBUG_ENV).is_ok() {
                std::process::Stdio::inherit()
            } else {
                std::process::Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!(
                    "failed to spawn worker at {}: {}",
                    worker_bin.display(),
                    e
                ))
            })?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;
        let mut child_stdout = BufReader::new(child_stdout);

        let execute_msg = ParentMessage::Execute {
            execution: Box::new(execution),
            config: WorkerConfig::from(config),
        };
        write_message(&mut child_stdin, &execute_msg)
            .await
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("failed to send Execute: {e}")))?;

        // The child enforces its own budget; the extra slack lets it report
        // that timeout cleanly before we kill it.
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms) + Duration::from_secs(2),
            ipc_event_loop(
                &mut child_stdin,
                &mut child_stdout,
                dispatcher,
                config.max_ipc_message_size,
            ),
        )
        .await;

        match result {
            Ok(inner) => inner,
            Err(_elapsed) => {
                let _ = child.kill().await;
                Err(SandboxError::Timeout { timeout_ms })
            }
        }
    }
}

/// Read messages from the child, dispatch proxy calls, return the final result.
async fn ipc_event_loop(
    child_stdin: &mut tokio::process::ChildStdin,
    child_stdout: &mut BufReader<tokio::process::ChildStdout>,
    dispatcher: Arc<dyn ProxyDispatcher>,
    max_message_size: usize,
) -> Result<ExecutionResult, SandboxError> {
    loop {
        let msg: Option<ChildMessage> = read_message_with_limit(child_stdout, max_message_size)
            .await
            .map_err(|e| SandboxError::Execution(anyhow::anyhow!("IPC read error: {e}")))?;

        match msg {
            Some(ChildMessage::ExecutionComplete { result }) => {
                return result.map(|r| *r).map_err(SandboxError::from);
            }
            Some(ChildMessage::ProxyCallRequest {
                request_id,
                envelope,
            }) => {
                let result = dispatcher
                    .dispatch(envelope)
                    .await
                    .map_err(|e| e.to_string());
                let response = ParentMessage::ProxyCallResult { request_id, result };
                write_message(child_stdin, &response).await.map_err(|e| {
                    SandboxError::Execution(anyhow::anyhow!("failed to send proxy result: {e}"))
                })?;
            }
            Some(ChildMessage::Log { message }) => {
                tracing::info!(target: "hookline::sandbox::worker", "{}", message);
            }
            None => {
                return Err(SandboxError::Execution(anyhow::anyhow!(
                    "worker exited without sending result"
                )));
            }
        }
    }
}

/// Find the `hookline-worker` binary.
///
/// Search order:
/// 1. `HOOKLINE_WORKER_BIN` (must be an absolute path)
/// 2. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries.
fn find_worker_binary() -> Result<PathBuf, SandboxError> {
    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            // Test binaries live in target/<profile>/deps, the worker one level up.
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside hookline"
    )))
}

fn validate_binary_permissions(_path: &std::path::Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn relative_env_path_is_rejected() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/path");
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    #[serial]
    fn missing_binary_error_names_the_env_var() {
        std::env::remove_var(WORKER_BIN_ENV);
        if let Err(e) = find_worker_binary() {
            let msg = e.to_string();
            assert!(msg.contains(WORKER_BIN_ENV), "error should guide user: {msg}");
            assert!(!msg.contains("PATH"), "error should not mention PATH: {msg}");
        }
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn world_writable_binary_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn secure_binary_is_accepted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary();
        std::env::remove_var(WORKER_BIN_ENV);

        assert_eq!(result.unwrap(), bin);
    }
}
