//! hookline worker: isolated child process for one script execution.
//!
//! Spawned by [`hookline_sandbox::host::ChildProcessTransport`]. Reads a
//! prepared execution from stdin, runs it in a V8 isolate, and writes the
//! result to stdout. Proxy calls are forwarded to the host over the same pipe.
//!
//! The process runs with a clean environment and has no access to the
//! document store, the template catalog or any host object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use hookline_error::DispatchError;
use hookline_sandbox::ipc::{
    read_message, read_message_with_limit, write_message, ChildMessage, ParentMessage,
    WorkerFailure,
};
use hookline_sandbox::{ProxyCallEnvelope, ProxyDispatcher};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

type Waiter = oneshot::Sender<Result<serde_json::Value, String>>;

/// Proxy dispatcher that forwards calls to the host over IPC.
struct IpcProxyBridge {
    /// Outgoing child messages.
    tx: mpsc::UnboundedSender<ChildMessage>,
    /// Response waiters, keyed by request id.
    waiter_tx: mpsc::UnboundedSender<(u64, Waiter)>,
    next_id: AtomicU64,
}

#[async_trait::async_trait]
impl ProxyDispatcher for IpcProxyBridge {
    async fn dispatch(
        &self,
        envelope: ProxyCallEnvelope,
    ) -> Result<serde_json::Value, DispatchError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (resp_tx, resp_rx) = oneshot::channel();
        self.waiter_tx
            .send((request_id, resp_tx))
            .map_err(|_| anyhow::anyhow!("IPC waiter channel closed"))?;

        self.tx
            .send(ChildMessage::ProxyCallRequest {
                request_id,
                envelope,
            })
            .map_err(|_| anyhow::anyhow!("IPC send channel closed"))?;

        let result = resp_rx
            .await
            .map_err(|_| anyhow::anyhow!("IPC response channel closed"))?;

        result.map_err(|e| DispatchError::Internal(anyhow::anyhow!("{e}")))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let msg: ParentMessage = read_message(&mut stdin)
        .await
        .context("failed to read initial message from parent")?
        .context("parent closed stdin before sending Execute")?;

    let (execution, config) = match msg {
        ParentMessage::Execute { execution, config } => (*execution, config),
        other => anyhow::bail!("expected Execute message, got: {:?}", other),
    };

    let sandbox_config = config.to_sandbox_config();
    let max_ipc_size = config.max_ipc_message_size;

    let (tx, mut rx) = mpsc::unbounded_channel::<ChildMessage>();
    let (waiter_tx, mut waiter_rx) = mpsc::unbounded_channel::<(u64, Waiter)>();

    let dispatcher: Arc<dyn ProxyDispatcher> = Arc::new(IpcProxyBridge {
        tx: tx.clone(),
        waiter_tx,
        next_id: AtomicU64::new(1),
    });

    // Partial reads must not be dropped by select!, so stdin gets its own task.
    let (parent_tx, mut parent_rx) = mpsc::unbounded_channel::<ParentMessage>();
    tokio::spawn(async move {
        loop {
            match read_message_with_limit::<ParentMessage, _>(&mut stdin, max_ipc_size).await {
                Ok(Some(msg)) => {
                    if parent_tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read from parent");
                    break;
                }
            }
        }
    });

    // V8 isolates are !Send: run on a dedicated thread.
    let exec_tx = tx;
    let exec_handle = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = exec_tx.send(ChildMessage::ExecutionComplete {
                    result: Err(WorkerFailure::Failed {
                        message: format!("failed to create tokio runtime: {e}"),
                    }),
                });
                return;
            }
        };

        let result = rt.block_on(hookline_sandbox::executor::run_execute(
            &sandbox_config,
            execution,
            dispatcher,
        ));

        let _ = exec_tx.send(ChildMessage::ExecutionComplete {
            result: result.map(Box::new).map_err(WorkerFailure::from),
        });
    });

    let mut pending_waiters: HashMap<u64, Waiter> = HashMap::new();
    let mut execution_done = false;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(child_msg) => {
                        let is_complete = matches!(child_msg, ChildMessage::ExecutionComplete { .. });
                        write_message(&mut stdout, &child_msg).await
                            .context("failed to write message to parent")?;
                        stdout.flush().await?;
                        if is_complete {
                            execution_done = true;
                            if pending_waiters.is_empty() {
                                break;
                            }
                        }
                    }
                    None => {
                        if !execution_done {
                            let msg = ChildMessage::ExecutionComplete {
                                result: Err(WorkerFailure::Failed {
                                    message: "worker thread exited unexpectedly".into(),
                                }),
                            };
                            write_message(&mut stdout, &msg).await.ok();
                        }
                        break;
                    }
                }
            }

            incoming = parent_rx.recv() => {
                match incoming {
                    Some(ParentMessage::ProxyCallResult { request_id, result }) => {
                        if let Some(waiter) = pending_waiters.remove(&request_id) {
                            let _ = waiter.send(result);
                        }
                        if execution_done && pending_waiters.is_empty() {
                            break;
                        }
                    }
                    Some(_) => tracing::warn!("unexpected message type from parent"),
                    None => break,
                }
            }

            waiter = waiter_rx.recv() => {
                if let Some((id, sender)) = waiter {
                    pending_waiters.insert(id, sender);
                }
            }
        }
    }

    // Parent gone or done: the isolate thread exits once its work resolves.
    drop(pending_waiters);
    let _ = exec_handle.join();

    Ok(())
}
