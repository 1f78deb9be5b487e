//! Lifecycle controller.
//!
//! For one render request: resolve the applicable scripts, run each one's
//! before hook strictly in sequence merging as we go, hand the request to the
//! template engine, then run the after hooks of the scripts that asked for
//! one. The first failure or cancellation aborts the remaining scripts.

use std::path::PathBuf;
use std::sync::Arc;

use hookline_config::{AllowedModules, ScriptsConfig, DEFAULT_SCRIPT_TIMEOUT_MS};
use hookline_sandbox::{
    ContextMeta, ExecutionResult, ExecutionSpec, FailureKind, Hook, LogEntry, LogLevel,
    ModulePolicy, ProxyDispatcher, ResponseSnapshot, SandboxError, SandboxExecutor,
    ScriptFailure,
};
use serde_json::{json, Value};
use tracing::Instrument;

use crate::context::{CHILD_REQUEST_KEY, USER_KEY};
use crate::cycle::MAX_NESTED_RENDERS;
use crate::error::ScriptsError;
use crate::merge::{merge_after, merge_before, MergePolicy};
use crate::pipeline::Renderer;
use crate::proxy::{ActionCatalog, ActionContext, BoundCatalog};
use crate::request::{RenderRequest, RenderResponse, ScriptDescriptor};
use crate::resolve::resolve_scripts;
use crate::store::{AuthContext, DocumentStore};

/// Receives script console output once the script has finished.
pub trait LogSink: Send + Sync {
    /// Record one line. `metadata` carries the script name, hook and call time.
    fn log(&self, level: LogLevel, message: &str, metadata: &Value);
}

/// Forwards script logs to `tracing`.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, level: LogLevel, message: &str, metadata: &Value) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "hookline::script", %metadata, "{message}"),
            LogLevel::Info => tracing::info!(target: "hookline::script", %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "hookline::script", %metadata, "{message}"),
            LogLevel::Error => tracing::error!(target: "hookline::script", %metadata, "{message}"),
        }
    }
}

/// Script settings, usually built from the `[scripts]` config section.
#[derive(Debug, Clone)]
pub struct ScriptsSettings {
    /// Wall-clock budget per script execution.
    pub timeout_ms: u64,
    /// Which modules scripts may `require`.
    pub modules: ModulePolicy,
    /// Module resolution roots, in order.
    pub module_roots: Vec<PathBuf>,
    /// Context visibility and write-back rules.
    pub policy: MergePolicy,
}

impl Default for ScriptsSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            modules: ModulePolicy::default(),
            module_roots: Vec::new(),
            policy: MergePolicy::default(),
        }
    }
}

impl ScriptsSettings {
    /// Settings from the `[scripts]` config section.
    pub fn from_config(config: &ScriptsConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            modules: module_policy(&config.allowed_modules),
            module_roots: config.module_roots(),
            policy: MergePolicy {
                hidden: config.context.hidden.clone(),
                read_only: config.context.read_only.clone(),
            },
        }
    }

    fn context_meta(&self) -> ContextMeta {
        let mut hidden = self.policy.hidden.clone();
        hidden.push(USER_KEY.to_string());
        let mut read_only = self.policy.read_only.clone();
        read_only.push(CHILD_REQUEST_KEY.to_string());
        ContextMeta { hidden, read_only }
    }
}

fn module_policy(allowed: &AllowedModules) -> ModulePolicy {
    match allowed {
        AllowedModules::Wildcard(_) => ModulePolicy::All,
        AllowedModules::List(names) => ModulePolicy::listed(names.iter().cloned()),
        AllowedModules::Map(map) => ModulePolicy::Listed {
            modules: map
                .iter()
                .map(|(name, path)| (name.clone(), Some(path.clone())))
                .collect(),
        },
    }
}

/// Scripts whose after hook still has to run, in before-stage order.
#[derive(Debug, Default)]
pub struct AfterQueue(Vec<ScriptDescriptor>);

impl AfterQueue {
    /// Number of queued scripts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no after hooks are queued.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Runs render hooks through the sandbox.
#[derive(Clone)]
pub struct ScriptsEngine {
    executor: Arc<SandboxExecutor>,
    catalog: Arc<ActionCatalog>,
    store: Arc<dyn DocumentStore>,
    settings: Arc<ScriptsSettings>,
    log_sink: Arc<dyn LogSink>,
}

impl ScriptsEngine {
    /// Engine logging script output through [`TracingLogSink`].
    pub fn new(
        executor: Arc<SandboxExecutor>,
        catalog: Arc<ActionCatalog>,
        store: Arc<dyn DocumentStore>,
        settings: ScriptsSettings,
    ) -> Self {
        Self {
            executor,
            catalog,
            store,
            settings: Arc::new(settings),
            log_sink: Arc::new(TracingLogSink),
        }
    }

    /// Replace the log sink.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// The document store scripts and templates are read from.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The proxy action catalog.
    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Resolve the template's scripts and run their before hooks.
    ///
    /// Returns the scripts whose after hook must run once the document exists.
    pub async fn before_render(
        &self,
        request: &mut RenderRequest,
        response: &mut RenderResponse,
        renderer: Arc<dyn Renderer>,
    ) -> Result<AfterQueue, ScriptsError> {
        let auth = AuthContext {
            user: request.context.user.clone(),
        };
        let scripts = resolve_scripts(&mut request.template, self.store.as_ref(), &auth).await?;

        let mut queue = Vec::new();
        for script in scripts {
            let mut result = self
                .run_script(&script, Hook::Before, request, response, &renderer)
                .await?;
            merge_before(request, &mut result, &self.settings.policy);
            if result.after_hook_defined {
                queue.push(script);
            }
        }
        Ok(AfterQueue(queue))
    }

    /// Run the queued after hooks against the rendered response.
    pub async fn after_render(
        &self,
        request: &mut RenderRequest,
        response: &mut RenderResponse,
        queue: AfterQueue,
        renderer: Arc<dyn Renderer>,
    ) -> Result<(), ScriptsError> {
        for script in queue.0 {
            let mut result = self
                .run_script(&script, Hook::After, request, response, &renderer)
                .await?;
            merge_after(request, response, &mut result, &self.settings.policy);
        }
        Ok(())
    }

    async fn run_script(
        &self,
        script: &ScriptDescriptor,
        hook: Hook,
        request: &RenderRequest,
        response: &RenderResponse,
        renderer: &Arc<dyn Renderer>,
    ) -> Result<ExecutionResult, ScriptsError> {
        let name = script.display_name().to_string();
        let span = tracing::info_span!("script", script = %name, %hook);

        let spec = ExecutionSpec {
            script_name: name.clone(),
            script: script.content.clone(),
            hook,
            request: request.sandbox_view(&self.settings.policy.hidden),
            response: ResponseSnapshot {
                content: response.content.clone(),
                meta: response.meta.clone(),
            },
            modules: self.settings.modules.clone(),
            module_roots: self.settings.module_roots.clone(),
            timeout_ms: self.settings.timeout_ms,
            context_meta: self.settings.context_meta(),
            proxy_actions: self.catalog.names(),
        };
        let bound = Arc::new(BoundCatalog::new(
            self.catalog.clone(),
            ActionContext {
                request: request.context.clone(),
                store: self.store.clone(),
                renderer: renderer.clone(),
            },
        ));
        let dispatcher: Arc<dyn ProxyDispatcher> = bound.clone();

        // Nested renders already hold a permit through the outermost execution.
        let outcome = if request.context.is_child_request() {
            self.executor
                .execute_nested(spec, dispatcher)
                .instrument(span)
                .await
        } else {
            self.executor.execute(spec, dispatcher).instrument(span).await
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(SandboxError::Timeout { timeout_ms }) => {
                return Err(ScriptsError::Timeout {
                    script: name,
                    timeout_ms,
                })
            }
            Err(source) => {
                return Err(ScriptsError::Sandbox {
                    script: name,
                    source,
                })
            }
        };

        self.flush_logs(&name, hook, &result.logs, request);

        if let Some(cancel) = result.cancel.take() {
            tracing::debug!(script = %name, "request canceled by script");
            return Err(ScriptsError::Canceled {
                message: cancel.message,
                status_code: cancel.status_code,
            });
        }
        if let Some(failure) = result.error.take() {
            return Err(script_error(name, failure, bound.render_refused()));
        }
        Ok(result)
    }

    fn flush_logs(&self, script: &str, hook: Hook, logs: &[LogEntry], request: &RenderRequest) {
        for entry in logs {
            let metadata = json!({
                "script": script,
                "hook": hook,
                "timestamp": entry.timestamp,
            });
            self.log_sink.log(entry.level, &entry.message, &metadata);
        }
        request.context.logs().extend(script, hook, logs);
    }
}

fn cycle_limit() -> ScriptsError {
    ScriptsError::CycleLimit {
        max: MAX_NESTED_RENDERS,
    }
}

/// `render_refused` is set when a render started by this very execution was
/// refused by the cycle guard, at any depth below it.
fn script_error(script: String, failure: ScriptFailure, render_refused: bool) -> ScriptsError {
    if render_refused {
        return cycle_limit();
    }
    match failure.kind {
        FailureKind::Module => ScriptsError::ModuleDenied {
            script,
            message: failure.message,
        },
        FailureKind::Thrown | FailureKind::NonError | FailureKind::Unsettled => {
            ScriptsError::ScriptFault {
                script,
                message: failure.message,
                stack: failure.stack,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn module_policy_follows_config() {
        assert_eq!(
            module_policy(&AllowedModules::Wildcard("*".into())),
            ModulePolicy::All
        );
        assert_eq!(
            module_policy(&AllowedModules::List(vec!["helperA".into()])),
            ModulePolicy::listed(["helperA"])
        );

        let mut map = BTreeMap::new();
        map.insert("helperA".to_string(), PathBuf::from("/lib/a.js"));
        match module_policy(&AllowedModules::Map(map)) {
            ModulePolicy::Listed { modules } => {
                assert_eq!(modules["helperA"], Some(PathBuf::from("/lib/a.js")));
            }
            other => panic!("expected listed policy, got {other:?}"),
        }
    }

    #[test]
    fn context_meta_protects_host_fields() {
        let settings = ScriptsSettings {
            policy: MergePolicy {
                hidden: vec!["secrets".into()],
                read_only: vec!["tenant".into()],
            },
            ..ScriptsSettings::default()
        };
        let meta = settings.context_meta();
        assert_eq!(meta.hidden, vec!["secrets", "user"]);
        assert_eq!(meta.read_only, vec!["tenant", "isChildRequest"]);
    }

    fn thrown(message: &str) -> ScriptFailure {
        ScriptFailure {
            message: message.into(),
            stack: None,
            kind: FailureKind::Thrown,
        }
    }

    #[test]
    fn module_failures_are_engine_faults() {
        let err = script_error(
            "s".into(),
            ScriptFailure {
                message: "Unsupported module in scripts: 'fs'".into(),
                stack: None,
                kind: FailureKind::Module,
            },
            false,
        );
        assert!(matches!(err, ScriptsError::ModuleDenied { .. }));
        assert!(!err.is_weak());
    }

    #[test]
    fn failures_after_a_refused_render_report_the_cycle() {
        let err = script_error("s".into(), thrown("nested render failed"), true);
        assert!(matches!(err, ScriptsError::CycleLimit { max: 3 }));
        assert_eq!(err.status_code(), Some(400));
    }

    #[test]
    fn failures_without_a_refusal_keep_their_message() {
        let err = script_error("s".into(), thrown("real bug"), false);
        match err {
            ScriptsError::ScriptFault { script, message, .. } => {
                assert_eq!(script, "s");
                assert_eq!(message, "real bug");
            }
            other => panic!("expected script fault, got {other:?}"),
        }
    }
}
