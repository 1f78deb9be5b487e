//! Which scripts run for a template, and in what order.

use serde_json::{json, Value};

use crate::error::ScriptsError;
use crate::request::{ScriptDescriptor, ScriptRef};
use crate::store::{AuthContext, DocumentStore, SCRIPTS_COLLECTION};

/// Rewrite legacy script references into `template.scripts`.
///
/// `scriptId: "x"` becomes `scripts: [{shortid: "x"}]`; a single
/// `script: {..}` becomes a one-element list. An explicit `scripts` list
/// wins over both.
pub fn normalize_refs(template: &mut Value) {
    let Some(obj) = template.as_object_mut() else {
        return;
    };
    if obj.get("scripts").is_some_and(|s| !s.is_null()) {
        return;
    }

    let legacy_script = obj.get("script").filter(|s| {
        ["content", "shortid", "name"]
            .iter()
            .any(|k| s.get(k).is_some_and(|v| !v.is_null()))
    });
    let scripts = if let Some(script) = legacy_script {
        json!([script])
    } else if let Some(id) = obj
        .get("scriptId")
        .filter(|_| obj.get("script").is_none_or(Value::is_null))
        .and_then(Value::as_str)
    {
        json!([{ "shortid": id }])
    } else {
        json!([])
    };
    obj.insert("scripts".into(), scripts);
}

/// Build the ordered execution list for `template`.
///
/// Global scripts come first in storage order, then the template's own
/// references in declaration order. A referenced script that is also global
/// runs once, in its global position.
pub async fn resolve_scripts(
    template: &mut Value,
    store: &dyn DocumentStore,
    auth: &AuthContext,
) -> Result<Vec<ScriptDescriptor>, ScriptsError> {
    normalize_refs(template);

    let refs: Vec<ScriptRef> = match template.get("scripts") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).unwrap_or_default())
            .collect(),
        _ => Vec::new(),
    };

    let mut ordered: Vec<ScriptDescriptor> = store
        .find(SCRIPTS_COLLECTION, &json!({ "isGlobal": true }), auth)
        .await?
        .into_iter()
        .filter_map(|doc| serde_json::from_value(doc).ok())
        .collect();

    for script_ref in refs {
        let descriptor = resolve_one(&script_ref, store, auth).await?;
        if ordered.iter().any(|s| s.same_document(&descriptor)) {
            continue;
        }
        ordered.push(descriptor);
    }

    tracing::debug!(scripts = ordered.len(), "scripts resolved");
    Ok(ordered)
}

async fn resolve_one(
    script_ref: &ScriptRef,
    store: &dyn DocumentStore,
    auth: &AuthContext,
) -> Result<ScriptDescriptor, ScriptsError> {
    if let Some(content) = script_ref.content.as_deref().filter(|c| !c.is_empty()) {
        return Ok(ScriptDescriptor {
            id: script_ref.shortid.clone(),
            name: script_ref.name.clone(),
            content: content.to_string(),
            is_global: false,
        });
    }

    let not_found = || ScriptsError::ScriptNotFound {
        reference: script_ref.reference(),
    };
    if !script_ref.is_usable() {
        return Err(not_found());
    }

    let mut filter = serde_json::Map::new();
    if let Some(id) = &script_ref.shortid {
        filter.insert("shortid".into(), Value::String(id.clone()));
    }
    if let Some(name) = &script_ref.name {
        filter.insert("name".into(), Value::String(name.clone()));
    }

    let doc = store
        .find(SCRIPTS_COLLECTION, &Value::Object(filter), auth)
        .await?
        .into_iter()
        .next()
        .ok_or_else(not_found)?;
    serde_json::from_value(doc).map_err(|_| not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn names(scripts: &[ScriptDescriptor]) -> Vec<&str> {
        scripts.iter().map(ScriptDescriptor::display_name).collect()
    }

    #[test]
    fn legacy_script_id() {
        let mut t = json!({"scriptId": "abc"});
        normalize_refs(&mut t);
        assert_eq!(t["scripts"], json!([{"shortid": "abc"}]));
    }

    #[test]
    fn legacy_single_script() {
        let mut t = json!({"script": {"content": "x"}, "scriptId": "ignored"});
        normalize_refs(&mut t);
        assert_eq!(t["scripts"], json!([{"content": "x"}]));
    }

    #[test]
    fn explicit_list_wins() {
        let mut t = json!({"scripts": [{"name": "a"}], "scriptId": "b"});
        normalize_refs(&mut t);
        assert_eq!(t["scripts"], json!([{"name": "a"}]));
    }

    #[test]
    fn no_refs_means_empty_list() {
        let mut t = json!({"content": "hello"});
        normalize_refs(&mut t);
        assert_eq!(t["scripts"], json!([]));
    }

    #[tokio::test]
    async fn globals_first_then_declared_order() {
        let store = InMemoryStore::new()
            .with("scripts", json!({"shortid": "2", "name": "second", "content": "b"}))
            .with("scripts", json!({"shortid": "g", "name": "global", "content": "g", "isGlobal": true}))
            .with("scripts", json!({"shortid": "1", "name": "first", "content": "a"}));
        let mut template = json!({"scripts": [
            {"name": "first"},
            {"content": "inline"},
            {"shortid": "2"},
            {"shortid": "g"},
        ]});
        let scripts = resolve_scripts(&mut template, &store, &AuthContext::default())
            .await
            .unwrap();
        assert_eq!(names(&scripts), vec!["global", "first", "anonymous", "second"]);
    }

    #[tokio::test]
    async fn missing_reference_is_weak_not_found() {
        let store = InMemoryStore::new();
        let mut template = json!({"scripts": [{"name": "ghost"}]});
        let err = resolve_scripts(&mut template, &store, &AuthContext::default())
            .await
            .unwrap_err();
        assert!(err.is_weak());
        assert!(err.to_string().contains("(ghost)"));
    }

    #[tokio::test]
    async fn unreadable_script_is_not_found() {
        let store = InMemoryStore::new().with(
            "scripts",
            json!({"name": "private", "content": "x", "readPermissions": ["alice"]}),
        );
        let mut template = json!({"scripts": [{"name": "private"}]});
        let err = resolve_scripts(&mut template, &store, &AuthContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptsError::ScriptNotFound { .. }));
    }
}
