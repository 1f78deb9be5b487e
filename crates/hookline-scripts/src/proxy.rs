//! Host side of the proxy bridge: the action catalog and its built-in actions.
//!
//! Handler modules contribute named [`ProxyAction`]s. The catalog is built
//! once at startup and refuses two modules claiming the same name. For each
//! script execution it is bound to the calling request ([`BoundCatalog`]),
//! which is what the sandbox dispatches into.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hookline_error::DispatchError;
use hookline_sandbox::binary::encode_bytes;
use hookline_sandbox::{actions, ProxyCallEnvelope, ProxyDispatcher};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::context::RequestContext;
use crate::error::{CatalogError, ScriptsError};
use crate::pipeline::Renderer;
use crate::request::RenderRequest;
use crate::store::{AuthContext, DocumentStore};

/// Everything an action may use, bound to the request whose script called it.
#[derive(Clone)]
pub struct ActionContext {
    /// Context of the calling request.
    pub request: RequestContext,
    /// Document store.
    pub store: Arc<dyn DocumentStore>,
    /// Renderer for nested renders.
    pub renderer: Arc<dyn Renderer>,
}

impl ActionContext {
    /// Authorization data of the calling request.
    pub fn auth(&self) -> AuthContext {
        AuthContext {
            user: self.request.user.clone(),
        }
    }
}

/// One host-side action callable from scripts.
#[async_trait::async_trait]
pub trait ProxyAction: Send + Sync {
    /// Run the action.
    async fn call(&self, ctx: &ActionContext, payload: Value) -> Result<Value, DispatchError>;
}

/// A named group of actions installed together.
pub trait ProxyHandlerModule: Send + Sync {
    /// Module name, used in collision errors.
    fn name(&self) -> &str;

    /// The actions this module provides.
    fn actions(&self) -> Vec<(String, Arc<dyn ProxyAction>)>;
}

const UNSAFE_SEGMENTS: &[&str] = &["__proto__", "prototype", "constructor"];

fn validate_name(action: &str) -> Result<(), CatalogError> {
    let invalid = |reason| CatalogError::InvalidName {
        action: action.to_string(),
        reason,
    };
    if action.is_empty() || action.split('.').any(str::is_empty) {
        return Err(invalid("empty path segment"));
    }
    if action.split('.').any(|s| UNSAFE_SEGMENTS.contains(&s)) {
        return Err(invalid("reserved path segment"));
    }
    Ok(())
}

struct Registered {
    module: String,
    action: Arc<dyn ProxyAction>,
}

/// Action name to handler, assembled from handler modules.
pub struct ActionCatalog {
    actions: BTreeMap<String, Registered>,
}

impl ActionCatalog {
    /// Merge `modules` in order. A name claimed twice is an error.
    pub fn build(modules: &[Arc<dyn ProxyHandlerModule>]) -> Result<Self, CatalogError> {
        let mut actions: BTreeMap<String, Registered> = BTreeMap::new();
        for module in modules {
            for (name, action) in module.actions() {
                validate_name(&name)?;
                if let Some(existing) = actions.get(&name) {
                    return Err(CatalogError::DuplicateAction {
                        action: name,
                        first: existing.module.clone(),
                        second: module.name().to_string(),
                    });
                }
                actions.insert(
                    name,
                    Registered {
                        module: module.name().to_string(),
                        action,
                    },
                );
            }
        }
        tracing::debug!(actions = actions.len(), "proxy action catalog built");
        Ok(Self { actions })
    }

    /// The built-in actions followed by `extra` modules.
    pub fn with_builtins(
        extra: impl IntoIterator<Item = Arc<dyn ProxyHandlerModule>>,
    ) -> Result<Self, CatalogError> {
        let mut modules: Vec<Arc<dyn ProxyHandlerModule>> = vec![Arc::new(BuiltinActions)];
        modules.extend(extra);
        Self::build(&modules)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    /// Whether `action` is registered.
    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Run one call against `ctx`.
    pub async fn dispatch(
        &self,
        ctx: &ActionContext,
        envelope: ProxyCallEnvelope,
    ) -> Result<Value, DispatchError> {
        let registered = self
            .actions
            .get(&envelope.action)
            .ok_or_else(|| DispatchError::action_not_found(&envelope.action, &self.names()))?;
        registered.action.call(ctx, envelope.payload).await
    }
}

/// A catalog bound to the request whose script is running.
///
/// One is created per script execution, so it also records whether that
/// execution had a nested render refused by the cycle guard.
pub struct BoundCatalog {
    catalog: Arc<ActionCatalog>,
    ctx: ActionContext,
    render_refused: AtomicBool,
}

impl BoundCatalog {
    /// Bind `catalog` to `ctx`.
    pub fn new(catalog: Arc<ActionCatalog>, ctx: ActionContext) -> Self {
        Self {
            catalog,
            ctx,
            render_refused: AtomicBool::new(false),
        }
    }

    /// Whether a render called through this binding hit the nesting ceiling,
    /// directly or somewhere below it.
    pub fn render_refused(&self) -> bool {
        self.render_refused.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProxyDispatcher for BoundCatalog {
    async fn dispatch(&self, envelope: ProxyCallEnvelope) -> Result<Value, DispatchError> {
        let span = tracing::debug_span!("proxy_action", action = %envelope.action);
        let action = envelope.action.clone();
        let result = self
            .catalog
            .dispatch(&self.ctx, envelope)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            if matches!(e, DispatchError::CycleLimit { .. }) {
                self.render_refused.store(true, Ordering::SeqCst);
            }
            tracing::debug!(action = %action, code = e.code(), error = %e, "proxy action failed");
        }
        result
    }
}

/// `render`, `documentStore.collection.find` and `documentStore.collection.findOne`.
pub struct BuiltinActions;

impl ProxyHandlerModule for BuiltinActions {
    fn name(&self) -> &str {
        "builtin"
    }

    fn actions(&self) -> Vec<(String, Arc<dyn ProxyAction>)> {
        vec![
            (actions::RENDER.to_string(), Arc::new(RenderAction)),
            (actions::FIND.to_string(), Arc::new(FindAction { one: false })),
            (actions::FIND_ONE.to_string(), Arc::new(FindAction { one: true })),
        ]
    }
}

#[derive(Deserialize)]
struct RenderPayload {
    #[serde(default)]
    request: Value,
    #[serde(default)]
    shared: Option<Value>,
}

/// Nested render in a fresh child context.
struct RenderAction;

#[async_trait::async_trait]
impl ProxyAction for RenderAction {
    async fn call(&self, ctx: &ActionContext, payload: Value) -> Result<Value, DispatchError> {
        let payload: RenderPayload =
            serde_json::from_value(payload).map_err(|e| DispatchError::InvalidPayload {
                action: actions::RENDER.into(),
                reason: e.to_string(),
            })?;

        let depth = ctx
            .request
            .cycle()
            .enter()
            .map_err(|e| DispatchError::CycleLimit { max: e.max })?;

        if let Some(shared) = payload.shared {
            ctx.request.shared().set(shared);
        }

        let nested = RenderRequest::nested(&payload.request, &ctx.request);
        tracing::debug!(depth, "nested render");
        let response = ctx
            .renderer
            .render(nested)
            .await
            .map_err(|e| match e {
                ScriptsError::CycleLimit { max } => DispatchError::CycleLimit { max },
                other => DispatchError::Render {
                    message: other.to_string(),
                },
            })?;

        Ok(json!({
            "content": encode_bytes(&response.content),
            "meta": response.meta,
            "shared": ctx.request.shared().get(),
        }))
    }
}

#[derive(Deserialize)]
struct FindPayload {
    collection: String,
    #[serde(default)]
    filter: Value,
}

/// Read-only document store query.
struct FindAction {
    one: bool,
}

#[async_trait::async_trait]
impl ProxyAction for FindAction {
    async fn call(&self, ctx: &ActionContext, payload: Value) -> Result<Value, DispatchError> {
        let action = if self.one { actions::FIND_ONE } else { actions::FIND };
        let payload: FindPayload =
            serde_json::from_value(payload).map_err(|e| DispatchError::InvalidPayload {
                action: action.into(),
                reason: e.to_string(),
            })?;
        let auth = ctx.auth();
        let store_error = |e: crate::store::StoreError| DispatchError::Store {
            collection: payload.collection.clone(),
            message: e.to_string(),
        };
        if self.one {
            let found = ctx
                .store
                .find_one(&payload.collection, &payload.filter, &auth)
                .await
                .map_err(store_error)?;
            Ok(found.unwrap_or(Value::Null))
        } else {
            let found = ctx
                .store
                .find(&payload.collection, &payload.filter, &auth)
                .await
                .map_err(store_error)?;
            Ok(Value::Array(found))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RenderResponse;
    use crate::store::InMemoryStore;

    struct Echo;

    #[async_trait::async_trait]
    impl ProxyAction for Echo {
        async fn call(&self, _ctx: &ActionContext, payload: Value) -> Result<Value, DispatchError> {
            Ok(payload)
        }
    }

    struct Module(&'static str, Vec<&'static str>);

    impl ProxyHandlerModule for Module {
        fn name(&self) -> &str {
            self.0
        }

        fn actions(&self) -> Vec<(String, Arc<dyn ProxyAction>)> {
            self.1
                .iter()
                .map(|n| (n.to_string(), Arc::new(Echo) as Arc<dyn ProxyAction>))
                .collect()
        }
    }

    /// Returns the user it observed as content.
    struct WhoAmI;

    #[async_trait::async_trait]
    impl Renderer for WhoAmI {
        async fn render(&self, request: RenderRequest) -> Result<RenderResponse, ScriptsError> {
            Ok(RenderResponse {
                content: serde_json::to_vec(&request.context.user).unwrap(),
                meta: Default::default(),
            })
        }
    }

    fn ctx(user: Option<Value>) -> ActionContext {
        ActionContext {
            request: RequestContext::new(user),
            store: Arc::new(
                InMemoryStore::new()
                    .with("items", json!({"k": 1}))
                    .with("items", json!({"k": 2})),
            ),
            renderer: Arc::new(WhoAmI),
        }
    }

    #[test]
    fn collisions_across_modules_fail() {
        let modules: Vec<Arc<dyn ProxyHandlerModule>> = vec![
            Arc::new(Module("a", vec!["custom.x"])),
            Arc::new(Module("b", vec!["custom.y", "custom.x"])),
        ];
        let err = ActionCatalog::build(&modules).err().unwrap();
        assert!(matches!(err, CatalogError::DuplicateAction { ref action, .. } if action == "custom.x"));
    }

    #[test]
    fn builtins_cannot_be_shadowed() {
        let err = ActionCatalog::with_builtins([
            Arc::new(Module("mine", vec!["render"])) as Arc<dyn ProxyHandlerModule>
        ])
        .err()
        .unwrap();
        assert!(err.to_string().contains("'builtin'"));
    }

    #[test]
    fn unsafe_names_are_rejected() {
        for name in ["", "a..b", "x.__proto__", "constructor"] {
            let modules: Vec<Arc<dyn ProxyHandlerModule>> =
                vec![Arc::new(Module("m", vec![name]))];
            assert!(ActionCatalog::build(&modules).is_err(), "{name:?} accepted");
        }
    }

    #[tokio::test]
    async fn unknown_action_names_the_action() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let err = catalog
            .dispatch(
                &ctx(None),
                ProxyCallEnvelope {
                    action: "custom.nope".into(),
                    payload: Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "No proxy method handler found for action 'custom.nope'"
        );
    }

    #[tokio::test]
    async fn unknown_action_suggests_a_registered_one() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let err = catalog
            .dispatch(
                &ctx(None),
                ProxyCallEnvelope {
                    action: "rendr".into(),
                    payload: Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert!(
            err.to_string().ends_with("Did you mean 'render'?"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn find_and_find_one_query_the_store() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let c = ctx(None);
        let all = catalog
            .dispatch(
                &c,
                ProxyCallEnvelope {
                    action: actions::FIND.into(),
                    payload: json!({"collection": "items", "filter": {}}),
                },
            )
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        let one = catalog
            .dispatch(
                &c,
                ProxyCallEnvelope {
                    action: actions::FIND_ONE.into(),
                    payload: json!({"collection": "items", "filter": {"k": 2}}),
                },
            )
            .await
            .unwrap();
        assert_eq!(one, json!({"k": 2}));
    }

    #[tokio::test]
    async fn find_without_collection_is_invalid_payload() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let err = catalog
            .dispatch(
                &ctx(None),
                ProxyCallEnvelope {
                    action: actions::FIND.into(),
                    payload: json!({"filter": {}}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn render_uses_original_identity_and_counts() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let c = ctx(Some(json!({"name": "alice"})));
        let result = catalog
            .dispatch(
                &c,
                ProxyCallEnvelope {
                    action: actions::RENDER.into(),
                    payload: json!({"request": {
                        "template": {"content": "x"},
                        "context": {"user": {"name": "mallory"}},
                    }}),
                },
            )
            .await
            .unwrap();
        let bytes = hookline_sandbox::binary::decode_bytes(&result["content"]).unwrap();
        assert_eq!(bytes, br#"{"name":"alice"}"#);
        assert_eq!(c.request.cycle().count(), 1);
    }

    #[tokio::test]
    async fn render_past_ceiling_is_refused() {
        let catalog = ActionCatalog::with_builtins([]).unwrap();
        let c = ctx(None);
        for _ in 0..crate::cycle::MAX_NESTED_RENDERS {
            c.request.cycle().enter().unwrap();
        }
        let err = catalog
            .dispatch(
                &c,
                ProxyCallEnvelope {
                    action: actions::RENDER.into(),
                    payload: json!({"request": {}}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CycleLimit { max: 3 }));
        assert_eq!(c.request.cycle().count(), 4);
    }

    /// Fails every nested render the way a refused grandchild does.
    struct RefusedBelow;

    #[async_trait::async_trait]
    impl Renderer for RefusedBelow {
        async fn render(&self, _request: RenderRequest) -> Result<RenderResponse, ScriptsError> {
            Err(ScriptsError::CycleLimit { max: 3 })
        }
    }

    /// Fails every nested render with an ordinary script fault.
    struct BrokenBelow;

    #[async_trait::async_trait]
    impl Renderer for BrokenBelow {
        async fn render(&self, _request: RenderRequest) -> Result<RenderResponse, ScriptsError> {
            Err(ScriptsError::ScriptFault {
                script: "nested".into(),
                message: "boom".into(),
                stack: None,
            })
        }
    }

    fn render_call() -> ProxyCallEnvelope {
        ProxyCallEnvelope {
            action: actions::RENDER.into(),
            payload: json!({"request": {"template": {"content": "x"}}}),
        }
    }

    #[tokio::test]
    async fn bound_catalog_records_refusals_from_below() {
        let catalog = Arc::new(ActionCatalog::with_builtins([]).unwrap());
        let refused = BoundCatalog::new(
            catalog.clone(),
            ActionContext {
                renderer: Arc::new(RefusedBelow),
                ..ctx(None)
            },
        );
        assert!(!refused.render_refused());
        let err = refused.dispatch(render_call()).await.unwrap_err();
        assert!(matches!(err, DispatchError::CycleLimit { max: 3 }));
        assert!(refused.render_refused());

        let broken = BoundCatalog::new(
            catalog,
            ActionContext {
                renderer: Arc::new(BrokenBelow),
                ..ctx(None)
            },
        );
        let err = broken.dispatch(render_call()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Render { .. }));
        assert!(!broken.render_refused());
    }

    #[tokio::test]
    async fn bound_catalog_dispatches_custom_actions() {
        let catalog = Arc::new(
            ActionCatalog::with_builtins([
                Arc::new(Module("custom", vec!["custom.sayHello"])) as Arc<dyn ProxyHandlerModule>
            ])
            .unwrap(),
        );
        assert!(catalog.contains("custom.sayHello"));
        let bound = BoundCatalog::new(catalog, ctx(None));
        let out = bound
            .dispatch(ProxyCallEnvelope {
                action: "custom.sayHello".into(),
                payload: json!({"to": "world"}),
            })
            .await
            .unwrap();
        assert_eq!(out, json!({"to": "world"}));
    }
}
