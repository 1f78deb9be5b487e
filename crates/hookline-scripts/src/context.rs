//! Per-request context shared by every hook of one external request.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use hookline_sandbox::{Hook, LogEntry, LogLevel};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cycle::CycleCounter;

/// Context key under which the shared object is visible to scripts.
pub const SHARED_KEY: &str = "shared";
/// Context key carrying the child-request marker.
pub const CHILD_REQUEST_KEY: &str = "isChildRequest";
/// Context key of the authenticated identity. Never visible to scripts.
pub const USER_KEY: &str = "user";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The opt-in object shared by reference across one request's call tree.
#[derive(Debug, Clone)]
pub struct SharedContext(Arc<Mutex<Value>>);

impl Default for SharedContext {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Value::Object(Map::new()))))
    }
}

impl SharedContext {
    /// Current value.
    pub fn get(&self) -> Value {
        lock(&self.0).clone()
    }

    /// Replace the value.
    pub fn set(&self, value: Value) {
        *lock(&self.0) = value;
    }
}

/// A console line from some script in the call tree.
#[derive(Debug, Clone, Serialize)]
pub struct CollectedLog {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Time of the console call inside the sandbox.
    pub timestamp: DateTime<Utc>,
    /// Script that logged it.
    pub script: String,
    /// Hook that was running.
    pub hook: Hook,
}

/// Collects script logs across one external request, nested renders included.
#[derive(Debug, Clone, Default)]
pub struct LogCollector(Arc<Mutex<Vec<CollectedLog>>>);

impl LogCollector {
    /// Append the logs of one script execution.
    pub fn extend(&self, script: &str, hook: Hook, entries: &[LogEntry]) {
        lock(&self.0).extend(entries.iter().map(|e| CollectedLog {
            level: e.level,
            message: e.message.clone(),
            timestamp: e.timestamp,
            script: script.to_string(),
            hook,
        }));
    }

    /// Everything collected so far, in call order.
    ///
    /// Scripts flush when they finish, so a nested render's logs land before
    /// those of the script that awaited it. Ordering by the in-sandbox
    /// timestamp restores call order; ties keep flush order.
    pub fn snapshot(&self) -> Vec<CollectedLog> {
        let mut logs = lock(&self.0).clone();
        logs.sort_by_key(|log| log.timestamp);
        logs
    }
}

/// Mutable context of one render request.
///
/// `fields` is the free-form part scripts may read and write. The remaining
/// state is host-owned: scripts see the shared object and the child-request
/// marker but cannot replace them, and never see the user identity.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated identity of the external caller.
    pub user: Option<Value>,
    /// Free-form fields visible to scripts.
    pub fields: Map<String, Value>,
    is_child_request: bool,
    cycle: CycleCounter,
    shared: SharedContext,
    logs: LogCollector,
}

impl RequestContext {
    /// Context for a new external request.
    pub fn new(user: Option<Value>) -> Self {
        Self {
            user,
            ..Self::default()
        }
    }

    /// Fresh context for a nested render.
    ///
    /// None of this context's free-form fields carry over. The identity, the
    /// cycle counter, the shared object and the log collector do, so nesting
    /// is tracked across the whole tree and nobody can switch identities.
    pub fn child(&self) -> Self {
        Self {
            user: self.user.clone(),
            fields: Map::new(),
            is_child_request: true,
            cycle: self.cycle.clone(),
            shared: self.shared.clone(),
            logs: self.logs.clone(),
        }
    }

    /// Whether this context belongs to a nested render.
    pub fn is_child_request(&self) -> bool {
        self.is_child_request
    }

    /// Nested render counter of this request tree.
    pub fn cycle(&self) -> &CycleCounter {
        &self.cycle
    }

    /// Shared object of this request tree.
    pub fn shared(&self) -> &SharedContext {
        &self.shared
    }

    /// Log collector of this request tree.
    pub fn logs(&self) -> &LogCollector {
        &self.logs
    }

    /// The context as a script sees it, minus `hidden` fields.
    pub fn sandbox_view(&self, hidden: &[String]) -> Value {
        let mut view = self.fields.clone();
        view.insert(SHARED_KEY.into(), self.shared.get());
        view.insert(CHILD_REQUEST_KEY.into(), Value::Bool(self.is_child_request));
        view.remove(USER_KEY);
        for field in hidden {
            view.remove(field);
        }
        Value::Object(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn child_keeps_host_state_and_drops_fields() {
        let mut top = RequestContext::new(Some(json!({"name": "alice"})));
        top.fields.insert("tenant".into(), json!("acme"));
        top.shared().set(json!({"x": 1}));

        let child = top.child();
        assert!(child.is_child_request());
        assert!(child.fields.is_empty());
        assert_eq!(child.user, Some(json!({"name": "alice"})));
        assert!(child.cycle().same_tree(top.cycle()));

        child.shared().set(json!({"x": 2}));
        assert_eq!(top.shared().get(), json!({"x": 2}));
    }

    #[test]
    fn view_hides_user_and_hidden_fields() {
        let mut ctx = RequestContext::new(Some(json!("alice")));
        ctx.fields.insert("user".into(), json!("forged"));
        ctx.fields.insert("secret".into(), json!("s3"));
        ctx.fields.insert("tenant".into(), json!("acme"));

        let view = ctx.sandbox_view(&["secret".to_string()]);
        assert!(view.get("user").is_none());
        assert!(view.get("secret").is_none());
        assert_eq!(view["tenant"], "acme");
        assert_eq!(view["isChildRequest"], false);
        assert_eq!(view["shared"], json!({}));
    }

    #[test]
    fn logs_are_shared_with_children() {
        let top = RequestContext::new(None);
        let child = top.child();
        child.logs().extend(
            "nested",
            Hook::Before,
            &[LogEntry {
                level: LogLevel::Info,
                message: "hi".into(),
                timestamp: Utc::now(),
            }],
        );
        let logs = top.logs().snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].script, "nested");
    }

    #[test]
    fn snapshot_is_in_call_order() {
        let collector = LogCollector::default();
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(5);
        let entry = |message: &str, timestamp| LogEntry {
            level: LogLevel::Info,
            message: message.into(),
            timestamp,
        };
        collector.extend("nested", Hook::Before, &[entry("inner", later)]);
        collector.extend(
            "outer",
            Hook::Before,
            &[entry("before", earlier), entry("same instant", later)],
        );

        let messages: Vec<String> = collector
            .snapshot()
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(messages, vec!["before", "inner", "same instant"]);
    }
}
