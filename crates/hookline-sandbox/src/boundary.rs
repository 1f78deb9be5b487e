//! The isolation boundary: one fresh V8 isolate per script execution.
//!
//! Lifecycle: [`Boundary::prepare`] builds the isolate, installs the bindings
//! and preloads modules; [`Boundary::run`] evaluates the script with the hook
//! trigger appended; [`Boundary::finish`] drives the event loop until the hook
//! settles and collects the [`ExecutionResult`]. [`Boundary::snapshot`] can be
//! taken at any point in between.
//!
//! A CPU watchdog armed in `prepare` terminates the isolate when the wall-clock
//! budget runs out, so the budget covers bootstrap, module evaluation, the
//! synchronous script body and every async continuation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::bootstrap::{
    build_bootstrap, module_registration, with_trigger, BOOTSTRAP_NAME, INTERNAL_NAME,
    MODULE_SCRIPT_NAME, SEAL_JS, SNAPSHOT_JS, USER_SCRIPT_NAME,
};
use crate::error::SandboxError;
use crate::modules::PreparedModules;
use crate::ops::{
    hookline_ext, CancelSignal, CompletionSignal, HookOutcome, HookPresence, LogBuffer,
    ModuleFailures, ProxyCallLimits, SnapshotSlot,
};
use crate::redact::{sanitize_stack, strip_uncaught};
use crate::types::{
    ContextMeta, ExecutionResult, FailureKind, Hook, ResponseSnapshot, ScriptFailure,
    StateSnapshot,
};
use crate::ProxyDispatcher;

static ERROR_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Za-z_$][\w$]*)?Error(?::\s?(.*))?$").unwrap());

/// The names a script can see besides the language built-ins.
pub struct Bindings {
    /// Sandbox-visible request.
    pub request: Value,
    /// Response copy.
    pub response: ResponseSnapshot,
    /// Actions exposed through the proxy module.
    pub proxy_actions: Vec<String>,
    /// Preloaded module graph.
    pub modules: PreparedModules,
    /// Context field visibility.
    pub context_meta: ContextMeta,
    /// Host side of the proxy bridge.
    pub dispatcher: Arc<dyn ProxyDispatcher>,
}

/// Resource limits for one boundary.
pub struct BoundaryOptions {
    /// Wall-clock budget for the whole execution.
    pub timeout: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum size of the serialized script state.
    pub max_output_size: usize,
    /// Proxy call limits.
    pub limits: ProxyCallLimits,
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback. Terminates execution and grants 1MB grace
/// for the termination to propagate cleanly.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed `HeapLimitState` owned by the
    // `Boundary`. The runtime field is declared before `heap_state`, so the
    // isolate is dropped first and V8 can no longer call back into a freed box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

struct Watchdog {
    cancel_tx: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
    timed_out: Arc<AtomicBool>,
}

impl Watchdog {
    fn spawn(isolate: v8::IsolateHandle, timeout: Duration) -> Self {
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout)
            {
                flag.store(true, Ordering::SeqCst);
                isolate.terminate_execution();
            }
        });
        Self {
            cancel_tx,
            handle,
            timed_out,
        }
    }

    fn fired(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Cancel and join. Returns whether the watchdog fired.
    fn stop(self) -> bool {
        let _ = self.cancel_tx.send(());
        let _ = self.handle.join();
        self.timed_out.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct RawOutcome {
    #[serde(default)]
    request: Option<Value>,
    #[serde(default)]
    response: Option<ResponseSnapshot>,
    #[serde(default)]
    error: Option<RawFailure>,
}

#[derive(Deserialize)]
struct RawFailure {
    message: String,
    #[serde(default)]
    stack: Option<String>,
    kind: FailureKind,
}

#[derive(Deserialize)]
struct RawSnapshot {
    request: Value,
    response: ResponseSnapshot,
}

/// A prepared isolate bound to one script execution.
pub struct Boundary {
    // Field order matters: the runtime must drop before `heap_state`.
    runtime: JsRuntime,
    heap_state: Box<HeapLimitState>,
    watchdog: Option<Watchdog>,
    timed_out: bool,
    completion: Arc<Notify>,
    initial: StateSnapshot,
    timeout: Duration,
    max_output_size: usize,
}

impl Boundary {
    /// Create the isolate, install `bindings`, and preload modules.
    pub fn prepare(bindings: Bindings, options: BoundaryOptions) -> Result<Self, SandboxError> {
        let create_params = v8::CreateParams::default().heap_limits(0, options.max_heap_size);
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![hookline_ext::init()],
            create_params: Some(create_params),
            ..Default::default()
        });

        let completion = Arc::new(Notify::new());
        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(bindings.dispatcher);
            state.put(options.limits);
            state.put(LogBuffer::default());
            state.put(ModuleFailures::default());
            state.put(CompletionSignal(completion.clone()));
        }

        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );
        let watchdog = Watchdog::spawn(runtime.v8_isolate().thread_safe_handle(), options.timeout);

        let bootstrap = build_bootstrap(
            &bindings.request,
            &bindings.response,
            &bindings.proxy_actions,
            &bindings.modules,
            &bindings.context_meta,
        )?;

        let mut boundary = Self {
            runtime,
            heap_state,
            watchdog: Some(watchdog),
            timed_out: false,
            completion,
            initial: StateSnapshot {
                request: bindings.request,
                response: bindings.response,
            },
            timeout: options.timeout,
            max_output_size: options.max_output_size,
        };

        boundary.evaluate(BOOTSTRAP_NAME, bootstrap)?;
        for module in &bindings.modules.sources {
            let registration = module_registration(&module.key, &module.source)?;
            boundary
                .evaluate(MODULE_SCRIPT_NAME, registration)
                .map_err(|e| match e {
                    SandboxError::JsError { message } => SandboxError::JsError {
                        message: format!("failed to load module '{}': {message}", module.key),
                    },
                    other => other,
                })?;
        }
        boundary.evaluate(INTERNAL_NAME, SEAL_JS.to_string())?;

        Ok(boundary)
    }

    /// Evaluate the script with the trigger for `hook` appended.
    ///
    /// Fails with [`SandboxError::JsError`] only if the script threw
    /// synchronously during evaluation. Asynchronous failures surface from
    /// [`finish`](Self::finish).
    pub fn run(&mut self, script: &str, hook: Hook) -> Result<(), SandboxError> {
        self.evaluate(USER_SCRIPT_NAME, with_trigger(script, hook.entry_point()))
    }

    /// Plain-data copy of the request and response as seen inside the boundary.
    pub fn snapshot(&mut self) -> Result<StateSnapshot, SandboxError> {
        self.evaluate(INTERNAL_NAME, SNAPSHOT_JS.to_string())?;
        let json = self
            .runtime
            .op_state()
            .borrow_mut()
            .try_take::<SnapshotSlot>()
            .map(|s| s.0)
            .ok_or_else(|| SandboxError::JsError {
                message: "snapshot produced no state".into(),
            })?;
        let raw: RawSnapshot = serde_json::from_str(&json)?;
        Ok(StateSnapshot {
            request: raw.request,
            response: raw.response,
        })
    }

    /// Drive the event loop until the hook settles, then collect the result.
    pub async fn finish(mut self) -> Result<ExecutionResult, SandboxError> {
        let completion = self.completion.clone();
        let runtime = &mut self.runtime;
        let driven = tokio::time::timeout(self.timeout, async {
            tokio::select! {
                biased;
                _ = completion.notified() => Ok(()),
                r = runtime.run_event_loop(PollEventLoopOptions::default()) => {
                    r.map_err(|e| e.to_string())
                }
            }
        })
        .await;

        let loop_error = match driven {
            Ok(Ok(())) => None,
            Ok(Err(message)) => Some(message),
            Err(_elapsed) => {
                self.stop_watchdog();
                return Err(self.timeout_error());
            }
        };

        let settled = self.runtime.op_state().borrow().has::<HookOutcome>();
        if settled {
            self.check_limits()?;
            return self.collect(None, None);
        }

        if let Some(message) = &loop_error {
            self.check_limits()?;
            tracing::debug!(error = %message, "event loop failed before the hook settled");
        }
        let fallback = self.snapshot().ok();
        self.check_limits()?;
        let failure = match loop_error {
            Some(message) => failure_from_exception(&message),
            None => ScriptFailure {
                message: "Script hook finished without calling done() or settling its promise"
                    .to_string(),
                stack: None,
                kind: FailureKind::Unsettled,
            },
        };
        self.collect(Some(failure), fallback)
    }

    /// Collect a result for a script that threw synchronously during [`run`](Self::run).
    pub fn into_failed(mut self, exception: &str) -> Result<ExecutionResult, SandboxError> {
        let fallback = self.snapshot().ok();
        self.check_limits()?;
        self.collect(Some(failure_from_exception(exception)), fallback)
    }

    fn evaluate(&mut self, name: &'static str, source: String) -> Result<(), SandboxError> {
        match self.runtime.execute_script(name, source) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fault(e.to_string())),
        }
    }

    /// Classify an exception: limits take priority over whatever V8 reported.
    fn fault(&self, message: String) -> SandboxError {
        if self.heap_state.triggered.load(Ordering::SeqCst) {
            SandboxError::HeapLimitExceeded
        } else if self.timed_out || self.watchdog.as_ref().is_some_and(Watchdog::fired) {
            self.timeout_error()
        } else {
            SandboxError::JsError { message }
        }
    }

    fn timeout_error(&self) -> SandboxError {
        SandboxError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn stop_watchdog(&mut self) -> bool {
        if let Some(watchdog) = self.watchdog.take() {
            self.timed_out |= watchdog.stop();
        }
        self.timed_out
    }

    fn check_limits(&mut self) -> Result<(), SandboxError> {
        let timed_out = self.stop_watchdog();
        if self.heap_state.triggered.load(Ordering::SeqCst) {
            return Err(SandboxError::HeapLimitExceeded);
        }
        if timed_out {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    fn collect(
        &mut self,
        failure: Option<ScriptFailure>,
        fallback: Option<StateSnapshot>,
    ) -> Result<ExecutionResult, SandboxError> {
        let state = self.runtime.op_state();
        let mut state = state.borrow_mut();

        let outcome = match state.try_take::<HookOutcome>() {
            Some(HookOutcome(json)) => {
                if json.len() > self.max_output_size {
                    return Err(SandboxError::OutputTooLarge {
                        max: self.max_output_size,
                    });
                }
                Some(serde_json::from_str::<RawOutcome>(&json)?)
            }
            None => None,
        };
        let logs = state
            .try_take::<LogBuffer>()
            .map(|b| b.0)
            .unwrap_or_default();
        let cancel = state.try_take::<CancelSignal>().map(|c| c.0);
        let presence = state.try_take::<HookPresence>().unwrap_or_default();
        let module_failures = state
            .try_take::<ModuleFailures>()
            .map(|m| m.0)
            .unwrap_or_default();
        drop(state);

        for name in &module_failures {
            tracing::warn!(module = %name, "script require refused or unresolved");
        }

        let fallback = fallback.unwrap_or_else(|| self.initial.clone());
        let (request, response, error) = match outcome {
            Some(raw) => (
                raw.request.unwrap_or(fallback.request),
                raw.response.unwrap_or(fallback.response),
                raw.error.map(|f| ScriptFailure {
                    message: f.message,
                    stack: f.stack.as_deref().and_then(sanitize_stack),
                    kind: f.kind,
                }),
            ),
            // Exceptions escaping evaluation lose the in-sandbox module marker.
            None => {
                let failure = failure.map(|mut f| {
                    if f.kind == FailureKind::Thrown && !module_failures.is_empty() {
                        f.kind = FailureKind::Module;
                    }
                    f
                });
                (fallback.request, fallback.response, failure)
            }
        };

        Ok(ExecutionResult {
            request,
            response,
            logs,
            error,
            cancel,
            after_hook_defined: presence.after,
        })
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        // The watchdog holds an isolate handle; join it before the runtime goes away.
        self.stop_watchdog();
    }
}

/// Turn an exception escaping the script (sync throw or event-loop error)
/// into a [`ScriptFailure`].
pub(crate) fn failure_from_exception(text: &str) -> ScriptFailure {
    let text = strip_uncaught(text.trim());
    let first_line = text.lines().next().unwrap_or_default();
    match ERROR_LINE_RE.captures(first_line) {
        Some(caps) => ScriptFailure {
            message: caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            stack: sanitize_stack(text),
            kind: FailureKind::Thrown,
        },
        None => ScriptFailure {
            message: format!("Script threw with non-Error value: {first_line}"),
            stack: None,
            kind: FailureKind::NonError,
        },
    }
}
