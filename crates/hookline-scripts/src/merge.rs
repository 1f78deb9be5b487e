//! Merging script results back into the live request and response.
//!
//! The before stage merges request `template`, `data`, `options` and context
//! deltas. The after stage replaces the response content, merges response
//! meta and context deltas. Host-owned context state (identity, cycle counter,
//! child marker) lives outside the mergeable fields and is never taken from a
//! script; read-only and hidden fields are dropped from the script's copy.

use hookline_sandbox::ExecutionResult;
use serde_json::{Map, Value};

use crate::context::{CHILD_REQUEST_KEY, SHARED_KEY, USER_KEY};
use crate::request::{RenderRequest, RenderResponse};

/// Deep-merge `source` into `target`.
///
/// Objects merge key by key. Scalars and arrays replace. Keys absent from
/// `source` (including ones a script set to `undefined`) leave `target` alone.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => merge_maps(target, source),
        (target, source) => *target = source,
    }
}

fn merge_maps(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

/// Which context fields a script may write back.
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    /// Fields never shown to scripts.
    pub hidden: Vec<String>,
    /// Fields shown but never written back.
    pub read_only: Vec<String>,
}

impl MergePolicy {
    fn writable(&self, key: &str) -> bool {
        key != USER_KEY
            && key != CHILD_REQUEST_KEY
            && !self.hidden.iter().any(|f| f == key)
            && !self.read_only.iter().any(|f| f == key)
    }
}

/// Apply a script's context changes to the live request.
fn merge_context(request: &mut RenderRequest, mutated: Option<&mut Value>, policy: &MergePolicy) {
    let Some(Value::Object(mut context)) = mutated.map(Value::take) else {
        return;
    };
    if let Some(shared) = context.remove(SHARED_KEY) {
        if policy.writable(SHARED_KEY) {
            request.context.shared().set(shared);
        }
    }
    context.retain(|key, _| policy.writable(key));
    merge_maps(&mut request.context.fields, context);
}

/// Merge a before-stage result.
pub fn merge_before(request: &mut RenderRequest, result: &mut ExecutionResult, policy: &MergePolicy) {
    merge_request(request, &mut result.request, policy);
}

/// Merge an after-stage result.
pub fn merge_after(
    request: &mut RenderRequest,
    response: &mut RenderResponse,
    result: &mut ExecutionResult,
    policy: &MergePolicy,
) {
    response.content = std::mem::take(&mut result.response.content);
    merge_maps(&mut response.meta, std::mem::take(&mut result.response.meta));
    merge_context(request, result.request.get_mut("context"), policy);
}

fn merge_request(request: &mut RenderRequest, mutated: &mut Value, policy: &MergePolicy) {
    for (field, target) in [
        ("template", &mut request.template),
        ("data", &mut request.data),
        ("options", &mut request.options),
    ] {
        if let Some(value) = mutated.get_mut(field).map(Value::take) {
            deep_merge(target, value);
        }
    }
    merge_context(request, mutated.get_mut("context"), policy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookline_sandbox::ResponseSnapshot;
    use serde_json::json;

    fn result(request: Value, content: &[u8]) -> ExecutionResult {
        ExecutionResult {
            request,
            response: ResponseSnapshot {
                content: content.to_vec(),
                meta: Map::new(),
            },
            logs: Vec::new(),
            error: None,
            cancel: None,
            after_hook_defined: false,
        }
    }

    #[test]
    fn scalar_replaces_object() {
        let mut target = json!({"a": {"b": 1}});
        deep_merge(&mut target, json!({"a": 5}));
        assert_eq!(target, json!({"a": 5}));
    }

    #[test]
    fn objects_merge_and_absent_keys_survive() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "keep": true});
        deep_merge(&mut target, json!({"a": {"b": 10, "d": 4}}));
        assert_eq!(target, json!({"a": {"b": 10, "c": 2, "d": 4}, "keep": true}));
    }

    #[test]
    fn arrays_replace() {
        let mut target = json!({"list": [1, 2, 3]});
        deep_merge(&mut target, json!({"list": [9]}));
        assert_eq!(target, json!({"list": [9]}));
    }

    #[test]
    fn data_scalar_fully_replaces() {
        let mut request = RenderRequest::new(json!({})).with_data(json!({"x": {"y": 1}}));
        let mut r = result(json!({"data": 42}), b"");
        merge_before(&mut request, &mut r, &MergePolicy::default());
        assert_eq!(request.data, json!(42));
    }

    #[test]
    fn host_owned_fields_are_reasserted() {
        let mut request = RenderRequest::new(json!({})).with_user(json!({"name": "alice"}));
        request.context.fields.insert("tenant".into(), json!("acme"));
        let policy = MergePolicy {
            hidden: vec!["secret".into()],
            read_only: vec!["tenant".into()],
        };
        let mut r = result(
            json!({"context": {
                "user": {"name": "mallory"},
                "isChildRequest": true,
                "tenant": "evil",
                "secret": "x",
                "note": "hello",
            }}),
            b"",
        );
        merge_before(&mut request, &mut r, &policy);
        assert_eq!(request.context.user, Some(json!({"name": "alice"})));
        assert!(!request.context.is_child_request());
        assert_eq!(request.context.fields["tenant"], "acme");
        assert!(!request.context.fields.contains_key("secret"));
        assert!(!request.context.fields.contains_key("user"));
        assert_eq!(request.context.fields["note"], "hello");
    }

    #[test]
    fn shared_goes_to_the_shared_cell() {
        let mut request = RenderRequest::new(json!({}));
        let mut r = result(json!({"context": {"shared": {"a": 1}}}), b"");
        merge_before(&mut request, &mut r, &MergePolicy::default());
        assert_eq!(request.context.shared().get(), json!({"a": 1}));
        assert!(!request.context.fields.contains_key("shared"));
    }

    #[test]
    fn after_stage_replaces_content_and_merges_meta() {
        let mut request = RenderRequest::new(json!({}));
        let mut response = RenderResponse {
            content: b"old".to_vec(),
            meta: json!({"contentType": "text/plain", "n": 1})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let mut r = result(json!({"template": {"content": "ignored"}}), &[0, 159, 146, 150]);
        r.response.meta.insert("n".into(), json!(2));
        merge_after(&mut request, &mut response, &mut r, &MergePolicy::default());
        assert_eq!(response.content, vec![0, 159, 146, 150]);
        assert_eq!(response.meta["contentType"], "text/plain");
        assert_eq!(response.meta["n"], 2);
        assert_eq!(request.template, json!({}));
    }
}
