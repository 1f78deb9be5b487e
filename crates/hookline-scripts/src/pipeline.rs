//! Render pipeline: template resolution, hooks, and the template engine.
//!
//! The pipeline is both what external callers invoke and what the proxy
//! `render` action re-enters for nested renders.

use std::sync::{Arc, LazyLock, Weak};

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::ScriptsError;
use crate::lifecycle::ScriptsEngine;
use crate::merge::deep_merge;
use crate::request::{RenderRequest, RenderResponse};
use crate::store::{AuthContext, TEMPLATES_COLLECTION};

/// Something that turns a render request into a document.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    /// Render `request`, running its hooks.
    async fn render(&self, request: RenderRequest) -> Result<RenderResponse, ScriptsError>;
}

/// Produces document bytes from a request whose before hooks already ran.
pub trait TemplateEngine: Send + Sync {
    /// Render the template content against the request data.
    fn execute(&self, request: &RenderRequest) -> Result<Vec<u8>, ScriptsError>;
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)\s*\}\}")
        .expect("placeholder pattern is valid")
});

/// Substitutes `{{path.to.value}}` placeholders from the request data.
///
/// Strings are inserted as-is, other values as JSON, missing values as
/// nothing. Content that is not a string renders empty.
#[derive(Debug, Default)]
pub struct PlaceholderEngine;

impl TemplateEngine for PlaceholderEngine {
    fn execute(&self, request: &RenderRequest) -> Result<Vec<u8>, ScriptsError> {
        let content = request
            .template
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let rendered = PLACEHOLDER_RE.replace_all(content, |caps: &Captures<'_>| {
            match caps[1]
                .split('.')
                .try_fold(&request.data, |value, key| value.get(key))
            {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        });
        Ok(rendered.into_owned().into_bytes())
    }
}

/// The full render: template lookup, before hooks, engine, after hooks.
pub struct RenderPipeline {
    scripts: ScriptsEngine,
    engine: Arc<dyn TemplateEngine>,
    this: Weak<RenderPipeline>,
}

impl RenderPipeline {
    /// Pipeline running `scripts` around `engine`.
    pub fn new(scripts: ScriptsEngine, engine: Arc<dyn TemplateEngine>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            scripts,
            engine,
            this: this.clone(),
        })
    }

    fn as_renderer(&self) -> Result<Arc<dyn Renderer>, ScriptsError> {
        let this: Arc<dyn Renderer> = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("render pipeline was dropped mid-render"))?;
        Ok(this)
    }

    /// Fill in a template referenced only by name or shortid.
    async fn resolve_template(&self, request: &mut RenderRequest) -> Result<(), ScriptsError> {
        if request
            .template
            .get("content")
            .is_some_and(|c| !c.is_null())
        {
            return Ok(());
        }

        let mut filter = Map::new();
        for key in ["shortid", "name"] {
            if let Some(value) = request.template.get(key).filter(|v| !v.is_null()) {
                filter.insert(key.to_string(), value.clone());
                break;
            }
        }
        let Some((_, reference)) = filter.iter().next() else {
            return Err(ScriptsError::TemplateMissingContent);
        };
        let reference = reference
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| reference.to_string());

        let auth = AuthContext {
            user: request.context.user.clone(),
        };
        let mut stored = self
            .scripts
            .store()
            .find_one(TEMPLATES_COLLECTION, &Value::Object(filter), &auth)
            .await?
            .ok_or(ScriptsError::TemplateNotFound { reference })?;
        deep_merge(&mut stored, request.template.take());
        request.template = stored;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Renderer for RenderPipeline {
    async fn render(&self, mut request: RenderRequest) -> Result<RenderResponse, ScriptsError> {
        let renderer = self.as_renderer()?;
        self.resolve_template(&mut request).await?;

        let mut response = RenderResponse::default();
        let queue = self
            .scripts
            .before_render(&mut request, &mut response, renderer.clone())
            .await?;

        response.content = self.engine.execute(&request)?;

        self.scripts
            .after_render(&mut request, &mut response, queue, renderer)
            .await?;

        if !request.context.is_child_request() {
            let logs = serde_json::to_value(request.context.logs().snapshot())
                .map_err(anyhow::Error::from)?;
            response.meta.insert("logs".into(), logs);
        }
        tracing::debug!(
            child = request.context.is_child_request(),
            bytes = response.content.len(),
            "render complete"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(content: &str, data: Value) -> String {
        let request = RenderRequest::new(json!({ "content": content })).with_data(data);
        String::from_utf8(PlaceholderEngine.execute(&request).unwrap()).unwrap()
    }

    #[test]
    fn substitutes_nested_paths() {
        assert_eq!(
            render("Hello {{ user.name }}!", json!({"user": {"name": "Ada"}})),
            "Hello Ada!"
        );
    }

    #[test]
    fn non_strings_render_as_json() {
        assert_eq!(render("{{n}} {{list}}", json!({"n": 3, "list": [1, 2]})), "3 [1,2]");
    }

    #[test]
    fn missing_values_render_empty() {
        assert_eq!(render("[{{nope.deeper}}]", json!({})), "[]");
    }

    #[test]
    fn missing_content_renders_empty() {
        let request = RenderRequest::new(json!({"name": "x"}));
        assert!(PlaceholderEngine.execute(&request).unwrap().is_empty());
    }
}
