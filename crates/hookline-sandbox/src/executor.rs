//! Sandbox executor: validates a script, picks a transport, and audits the run.
//!
//! V8 isolates are `!Send`, so in-process executions run on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is
//! fully async and `Send`-safe.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::audit::{
    AuditEntryBuilder, AuditLogger, AuditingDispatcher, NoopAuditLogger, ProxyCallAudit,
};
use crate::boundary::{Bindings, Boundary, BoundaryOptions};
use crate::error::SandboxError;
use crate::modules::PreparedModules;
use crate::ops::ProxyCallLimits;
use crate::types::{ExecutionResult, ExecutionSpec};
use crate::validator::{validate_script, DEFAULT_MAX_SCRIPT_SIZE};
use crate::ProxyDispatcher;

/// How the sandbox executes scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run V8 in-process on a dedicated thread (default, suitable for tests).
    #[default]
    InProcess,
    /// Spawn an isolated `hookline-worker` process per execution.
    ChildProcess,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_process" => Ok(Self::InProcess),
            "child_process" => Ok(Self::ChildProcess),
            other => Err(format!(
                "unknown execution mode '{other}' (expected in_process or child_process)"
            )),
        }
    }
}

/// Resource limits for the sandbox executor.
///
/// The wall-clock budget is per execution and travels in
/// [`ExecutionSpec::timeout_ms`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum size of script text in bytes.
    pub max_script_size: usize,
    /// Maximum size of the serialized script state in bytes.
    pub max_output_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Maximum proxy calls per execution.
    pub max_proxy_calls: usize,
    /// Maximum size of a serialized proxy payload in bytes.
    pub max_proxy_payload_size: usize,
    /// Execution mode: in-process or child-process isolation.
    pub execution_mode: ExecutionMode,
    /// Maximum IPC message size in bytes.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            max_output_size: 64 * 1024 * 1024, // 64 MB
            max_heap_size: 256 * 1024 * 1024,  // 256 MB
            max_concurrent: 16,
            max_proxy_calls: 1000,
            max_proxy_payload_size: 16 * 1024 * 1024, // 16 MB
            execution_mode: ExecutionMode::default(),
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// A validated execution with its module graph already resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedExecution {
    /// What to run.
    pub spec: ExecutionSpec,
    /// Preloaded modules reachable from the script.
    pub modules: PreparedModules,
}

/// Carries a prepared execution to a V8 isolate and back.
#[async_trait::async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// Run `execution` and return its result.
    async fn execute(
        &self,
        config: &SandboxConfig,
        execution: PreparedExecution,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Runs the isolate on a dedicated thread in the current process.
pub struct InProcessTransport;

#[async_trait::async_trait]
impl ExecutionTransport for InProcessTransport {
    async fn execute(
        &self,
        config: &SandboxConfig,
        execution: PreparedExecution,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError> {
        let config = config.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    if tx.send(Err(SandboxError::Execution(e.into()))).is_err() {
                        tracing::warn!("sandbox result receiver dropped");
                    }
                    return;
                }
            };
            let result = rt.block_on(run_execute(&config, execution, dispatcher));
            if tx.send(result).is_err() {
                tracing::warn!("sandbox result receiver dropped before result was sent");
            }
        });

        rx.await
            .map_err(|_| SandboxError::Execution(anyhow::anyhow!("sandbox thread panicked")))?
    }
}

/// The sandbox executor. Creates a fresh V8 isolate for each execution.
///
/// This is `Send + Sync` safe. A concurrency semaphore limits the number of
/// simultaneous isolates.
pub struct SandboxExecutor {
    config: SandboxConfig,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    transport: Arc<dyn ExecutionTransport>,
}

impl SandboxExecutor {
    /// Create a new sandbox executor with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_audit_logger(config, Arc::new(NoopAuditLogger))
    }

    /// Create a new sandbox executor with an audit logger.
    pub fn with_audit_logger(config: SandboxConfig, logger: Arc<dyn AuditLogger>) -> Self {
        let transport: Arc<dyn ExecutionTransport> = match config.execution_mode {
            ExecutionMode::InProcess => Arc::new(InProcessTransport),
            ExecutionMode::ChildProcess => Arc::new(crate::host::ChildProcessTransport),
        };
        Self::with_transport(config, logger, transport)
    }

    /// Create a new sandbox executor with an explicit transport.
    pub fn with_transport(
        config: SandboxConfig,
        logger: Arc<dyn AuditLogger>,
        transport: Arc<dyn ExecutionTransport>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config,
            semaphore,
            audit_logger: logger,
            transport,
        }
    }

    /// The executor's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run one script for one hook.
    ///
    /// A script that throws still yields `Ok`: the failure travels in
    /// [`ExecutionResult::error`] together with the logs and state captured up
    /// to that point. `Err` means the boundary refused or could not finish.
    pub async fn execute(
        &self,
        spec: ExecutionSpec,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError> {
        validate_script(&spec.script, Some(self.config.max_script_size))?;

        let _permit = self.semaphore.clone().try_acquire_owned().map_err(|_| {
            SandboxError::ConcurrencyLimit {
                max: self.config.max_concurrent,
            }
        })?;

        self.run(spec, dispatcher).await
    }

    /// Run a script on behalf of an execution that is already in flight.
    ///
    /// Nested renders started from a proxy call land here. They run under the
    /// enclosing execution's permit, so a chain of nested renders never waits
    /// on or is refused by the concurrency limit it is already counted in.
    pub async fn execute_nested(
        &self,
        spec: ExecutionSpec,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError> {
        validate_script(&spec.script, Some(self.config.max_script_size))?;
        self.run(spec, dispatcher).await
    }

    async fn run(
        &self,
        spec: ExecutionSpec,
        dispatcher: Arc<dyn ProxyDispatcher>,
    ) -> Result<ExecutionResult, SandboxError> {
        tracing::info!(
            script = %spec.script_name,
            hook = %spec.hook,
            script_len = spec.script.len(),
            mode = ?self.config.execution_mode,
            "execute: starting"
        );

        let mut audit_builder = AuditEntryBuilder::new(&spec.script_name, &spec.script, spec.hook);

        let modules = PreparedModules::prepare(&spec.script, &spec.modules, &spec.module_roots);
        tracing::debug!(
            execution_id = audit_builder.execution_id(),
            modules = modules.len(),
            "modules prepared"
        );

        let (audit_tx, mut audit_rx) = tokio::sync::mpsc::unbounded_channel::<ProxyCallAudit>();
        let auditing_dispatcher: Arc<dyn ProxyDispatcher> =
            Arc::new(AuditingDispatcher::new(dispatcher, audit_tx));

        let result = self
            .transport
            .execute(
                &self.config,
                PreparedExecution { spec, modules },
                auditing_dispatcher,
            )
            .await;

        while let Ok(call) = audit_rx.try_recv() {
            audit_builder.record_proxy_call(call);
        }

        let entry = audit_builder.finish(&result);
        self.audit_logger.log(&entry).await;

        match &result {
            Ok(r) => tracing::info!(
                failed = r.error.is_some(),
                canceled = r.cancel.is_some(),
                logs = r.logs.len(),
                "execute: complete"
            ),
            Err(e) => tracing::warn!(error = %e, "execute: failed"),
        }

        result
    }
}

/// Run a prepared execution inside a fresh isolate.
///
/// Used directly by the worker process and by [`InProcessTransport`].
/// Must be called on a thread that may own a V8 isolate.
pub async fn run_execute(
    config: &SandboxConfig,
    execution: PreparedExecution,
    dispatcher: Arc<dyn ProxyDispatcher>,
) -> Result<ExecutionResult, SandboxError> {
    let PreparedExecution { spec, modules } = execution;

    let bindings = Bindings {
        request: spec.request,
        response: spec.response,
        proxy_actions: spec.proxy_actions,
        modules,
        context_meta: spec.context_meta,
        dispatcher,
    };
    let options = BoundaryOptions {
        timeout: Duration::from_millis(spec.timeout_ms.max(1)),
        max_heap_size: config.max_heap_size,
        max_output_size: config.max_output_size,
        limits: ProxyCallLimits {
            max_calls: config.max_proxy_calls,
            max_payload_size: config.max_proxy_payload_size,
            calls_made: 0,
        },
    };

    let mut boundary = Boundary::prepare(bindings, options)?;
    match boundary.run(&spec.script, spec.hook) {
        Ok(()) => boundary.finish().await,
        Err(SandboxError::JsError { message }) => boundary.into_failed(&message),
        Err(e) => Err(e),
    }
}
