//! Render request and response, and the script documents hooks run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::RequestContext;

/// One render request flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Template document: `content`, `name`, `shortid`, `scripts`, ...
    pub template: Value,
    /// Input data.
    pub data: Value,
    /// Render options.
    pub options: Value,
    /// Request context.
    pub context: RequestContext,
}

impl RenderRequest {
    /// A new external request for `template`, with no user.
    pub fn new(template: Value) -> Self {
        Self {
            template,
            data: Value::Object(Map::new()),
            options: Value::Object(Map::new()),
            context: RequestContext::new(None),
        }
    }

    /// Set the input data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the authenticated identity.
    pub fn with_user(mut self, user: Value) -> Self {
        self.context.user = Some(user);
        self
    }

    /// Build a nested request from what a script passed to `render`.
    ///
    /// Any `context` the script supplied is discarded: the nested request
    /// gets a fresh child of `parent`.
    pub fn nested(spec: &Value, parent: &RequestContext) -> Self {
        let field = |name: &str| match spec.get(name) {
            Some(v) if !v.is_null() => v.clone(),
            _ => Value::Object(Map::new()),
        };
        Self {
            template: field("template"),
            data: field("data"),
            options: field("options"),
            context: parent.child(),
        }
    }

    /// The request as a script sees it.
    pub fn sandbox_view(&self, hidden: &[String]) -> Value {
        serde_json::json!({
            "template": self.template,
            "data": self.data,
            "options": self.options,
            "context": self.context.sandbox_view(hidden),
        })
    }
}

/// Output of a render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderResponse {
    /// Document bytes.
    pub content: Vec<u8>,
    /// Metadata.
    pub meta: Map<String, Value>,
}

/// A stored script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDescriptor {
    /// Short identifier.
    #[serde(default, rename = "shortid", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Script text.
    #[serde(default)]
    pub content: String,
    /// Runs for every template.
    #[serde(default)]
    pub is_global: bool,
}

impl ScriptDescriptor {
    /// An inline script with no identity.
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            content: content.into(),
            is_global: false,
        }
    }

    /// Name used in logs and errors.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("anonymous")
    }

    /// Same stored document, compared by shortid, then by name.
    pub fn same_document(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.name.is_some() && self.name == other.name,
            _ => false,
        }
    }
}

/// An entry of `template.scripts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    /// Inline script text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reference by shortid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortid: Option<String>,
    /// Reference by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ScriptRef {
    /// Whether the reference names anything at all.
    pub fn is_usable(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty())
            || self.shortid.is_some()
            || self.name.is_some()
    }

    /// Reference text used in "not found" errors.
    pub fn reference(&self) -> String {
        self.shortid
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_default()
    }
}
