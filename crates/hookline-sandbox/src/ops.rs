//! deno_core op definitions for the hookline sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use hookline_error::DispatchError;
use tokio::sync::Notify;

use crate::types::{CancelRequest, LogEntry, LogLevel, ProxyCallEnvelope};
use crate::ProxyDispatcher;

/// Per-execution limits on proxy calls.
pub struct ProxyCallLimits {
    /// Maximum number of proxy calls allowed.
    pub max_calls: usize,
    /// Maximum size of a serialized payload.
    pub max_payload_size: usize,
    /// Number of proxy calls made so far.
    pub calls_made: usize,
}

/// Console output captured so far, in call order.
#[derive(Default)]
pub struct LogBuffer(pub Vec<LogEntry>);

/// Serialized hook outcome, written once by the bootstrap when the hook settles.
pub struct HookOutcome(pub String);

/// Serialized state written by an explicit snapshot request.
pub struct SnapshotSlot(pub String);

/// Cancellation requested by the script.
pub struct CancelSignal(pub CancelRequest);

/// Hook functions the script defines, as observed when the trigger ran.
#[derive(Default, Clone, Copy)]
pub struct HookPresence {
    pub before: bool,
    pub after: bool,
}

/// Names whose `require` was refused or could not be resolved.
#[derive(Default)]
pub struct ModuleFailures(pub Vec<String>);

/// Woken when the hook outcome is stored, so the host stops driving the loop.
pub struct CompletionSignal(pub Arc<Notify>);

/// Capture a console call.
#[op2(fast)]
pub fn op_hookline_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    let level = LogLevel::from_console(level);
    tracing::trace!(target: "hookline::sandbox::js", level = level.as_str(), "{}", msg);
    if let Some(buffer) = state.try_borrow_mut::<LogBuffer>() {
        buffer.0.push(LogEntry {
            level,
            message: msg.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Store the hook outcome and wake the host.
#[op2(fast)]
pub fn op_hookline_set_result(state: &mut OpState, #[string] json: &str) {
    if state.has::<HookOutcome>() {
        return;
    }
    state.put(HookOutcome(json.to_string()));
    if let Some(signal) = state.try_borrow::<CompletionSignal>() {
        signal.0.notify_one();
    }
}

/// Store an explicit state snapshot.
#[op2(fast)]
pub fn op_hookline_set_snapshot(state: &mut OpState, #[string] json: &str) {
    state.put(SnapshotSlot(json.to_string()));
}

/// Record a cancellation request.
#[op2(fast)]
pub fn op_hookline_cancel(state: &mut OpState, #[string] json: &str) {
    state.put(CancelSignal(parse_cancel(json)));
}

/// Read a cancel payload field by field, so an unusable status code never
/// costs the message.
fn parse_cancel(json: &str) -> CancelRequest {
    let value: serde_json::Value = serde_json::from_str(json).unwrap_or_default();
    CancelRequest {
        message: value["message"].as_str().map(str::to_string),
        status_code: value["status_code"]
            .as_u64()
            .and_then(|code| u16::try_from(code).ok()),
    }
}

/// Record which hook functions the script defines.
#[op2(fast)]
pub fn op_hookline_hooks(state: &mut OpState, before: bool, after: bool) {
    state.put(HookPresence { before, after });
}

/// Record a refused or unresolvable `require`.
#[op2(fast)]
pub fn op_hookline_module_failed(state: &mut OpState, #[string] name: &str) {
    if let Some(failures) = state.try_borrow_mut::<ModuleFailures>() {
        failures.0.push(name.to_string());
    }
}

/// Timer primitive backing `setTimeout`.
#[op2(async)]
pub async fn op_hookline_sleep(#[smi] ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(ms))).await;
}

/// Dispatch a proxy action to the host.
///
/// Enforces the per-execution call count and payload size from
/// [`ProxyCallLimits`]. Errors are redacted before the script sees them.
#[op2(async)]
#[string]
pub async fn op_hookline_proxy_call(
    op_state: Rc<RefCell<OpState>>,
    #[string] action: String,
    #[string] payload_json: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(
        action = %action,
        payload_len = payload_json.len(),
        "proxy call dispatched"
    );

    {
        let mut st = op_state.borrow_mut();
        if let Some(limits) = st.try_borrow_mut::<ProxyCallLimits>() {
            if limits.calls_made >= limits.max_calls {
                let err = DispatchError::RateLimit(format!(
                    "max {} proxy calls per execution",
                    limits.max_calls
                ));
                return Err(JsErrorBox::generic(err.to_string()));
            }
            if payload_json.len() > limits.max_payload_size {
                let err = DispatchError::InvalidPayload {
                    action: action.clone(),
                    reason: format!(
                        "{} bytes exceeds the {} byte limit",
                        payload_json.len(),
                        limits.max_payload_size
                    ),
                };
                return Err(JsErrorBox::generic(err.to_string()));
            }
            limits.calls_made += 1;
        }
    }

    let dispatcher = {
        let st = op_state.borrow();
        st.try_borrow::<Arc<dyn ProxyDispatcher>>()
            .cloned()
            .ok_or_else(|| JsErrorBox::generic("no proxy dispatcher is attached to this sandbox"))?
    };

    let payload: serde_json::Value = serde_json::from_str(&payload_json)
        .map_err(|e| JsErrorBox::generic(format!("invalid JSON payload: {e}")))?;

    let result = dispatcher
        .dispatch(ProxyCallEnvelope {
            action: action.clone(),
            payload,
        })
        .await
        .map_err(|e| {
            JsErrorBox::generic(crate::redact::redact_error_for_script(
                &action,
                &e.to_string(),
            ))
        })?;

    serde_json::to_string(&result)
        .map_err(|e| JsErrorBox::generic(format!("result serialization failed: {e}")))
}

deno_core::extension!(
    hookline_ext,
    ops = [
        op_hookline_log,
        op_hookline_set_result,
        op_hookline_set_snapshot,
        op_hookline_cancel,
        op_hookline_hooks,
        op_hookline_module_failed,
        op_hookline_sleep,
        op_hookline_proxy_call
    ],
);
