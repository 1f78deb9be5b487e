//! End-to-end render lifecycle tests.
//!
//! Every test renders through a real [`RenderPipeline`] with an in-process
//! sandbox, so scripts run in actual V8 isolates and nested renders re-enter
//! the pipeline through the proxy bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hookline_error::DispatchError;
use hookline_sandbox::{LogLevel, ModulePolicy, SandboxConfig, SandboxExecutor};
use hookline_scripts::{
    ActionCatalog, ActionContext, ErrorKind, InMemoryStore, LogSink, PlaceholderEngine,
    ProxyAction, ProxyHandlerModule, RenderPipeline, RenderRequest, Renderer, ScriptsEngine,
    ScriptsError, ScriptsSettings, TemplateEngine,
};
use serde_json::{json, Value};

fn settings() -> ScriptsSettings {
    ScriptsSettings {
        timeout_ms: 10_000,
        ..ScriptsSettings::default()
    }
}

fn engine(store: InMemoryStore, settings: ScriptsSettings) -> ScriptsEngine {
    ScriptsEngine::new(
        Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        Arc::new(ActionCatalog::with_builtins([]).unwrap()),
        Arc::new(store),
        settings,
    )
}

fn pipeline(store: InMemoryStore) -> Arc<RenderPipeline> {
    RenderPipeline::new(engine(store, settings()), Arc::new(PlaceholderEngine))
}

fn inline(scripts: &[&str]) -> Value {
    Value::Array(scripts.iter().map(|s| json!({ "content": s })).collect())
}

async fn render_text(pipeline: &RenderPipeline, request: RenderRequest) -> String {
    let response = pipeline.render(request).await.unwrap();
    String::from_utf8(response.content).unwrap()
}

/// Counts documents produced by the template engine.
#[derive(Default)]
struct CountingEngine(AtomicUsize);

impl TemplateEngine for CountingEngine {
    fn execute(&self, request: &RenderRequest) -> Result<Vec<u8>, ScriptsError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        PlaceholderEngine.execute(request)
    }
}

/// Prefixes every document with the name of the user it was rendered for.
struct IdentityEngine;

impl TemplateEngine for IdentityEngine {
    fn execute(&self, request: &RenderRequest) -> Result<Vec<u8>, ScriptsError> {
        let user = request
            .context
            .user
            .as_ref()
            .and_then(|u| u.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("anonymous");
        let body = PlaceholderEngine.execute(request)?;
        Ok([format!("{user}|").into_bytes(), body].concat())
    }
}

#[tokio::test]
async fn before_hooks_run_in_declared_order() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[
            "function beforeRender(req, res) { req.template.content += 'a' }",
            "function beforeRender(req, res, done) { req.template.content += 'b'; done() }",
            "async function beforeRender(req, res) { req.template.content += 'c' }",
            "function beforeRender(req, res) { return new Promise((resolve) => setTimeout(() => { req.template.content += 'd'; resolve() }, 10)) }",
        ]),
    }));
    assert_eq!(render_text(&p, request).await, "abcd");
}

#[tokio::test]
async fn global_scripts_run_first_and_once() {
    let store = InMemoryStore::new()
        .with(
            "scripts",
            json!({"shortid": "a", "name": "appendA", "content": "function beforeRender(req) { req.template.content += 'a' }"}),
        )
        .with(
            "scripts",
            json!({"shortid": "g", "name": "global", "isGlobal": true, "content": "function beforeRender(req) { req.template.content += 'g' }"}),
        )
        .with(
            "scripts",
            json!({"shortid": "b", "name": "appendB", "content": "function beforeRender(req) { req.template.content += 'b' }"}),
        );
    let p = pipeline(store);
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": [{"name": "appendB"}, {"shortid": "g"}, {"shortid": "a"}],
    }));
    assert_eq!(render_text(&p, request).await, "gba");
}

#[tokio::test]
async fn legacy_script_id_is_honoured() {
    let store = InMemoryStore::new().with(
        "scripts",
        json!({"shortid": "x1", "content": "function beforeRender(req) { req.data.who = 'legacy' }"}),
    );
    let p = pipeline(store);
    let request = RenderRequest::new(json!({"content": "hi {{who}}", "scriptId": "x1"}));
    assert_eq!(render_text(&p, request).await, "hi legacy");
}

#[tokio::test]
async fn missing_script_reference_is_weak() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({"content": "", "scripts": [{"name": "ghost"}]}));
    let err = p.render(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Weak);
    assert_eq!(err.status_code(), Some(404));
    assert!(err.to_string().contains("ghost"));
}

const RECURSE: &str = r#"
const proxy = require('hookline-proxy');
async function beforeRender(req, res) {
    if (req.data.depth < req.data.limit) {
        const nested = await proxy.render({
            template: { name: 'recursive' },
            data: { depth: req.data.depth + 1, limit: req.data.limit },
        });
        req.data.depth = nested.content.toString() + '<' + req.data.depth;
    }
}
"#;

fn recursive_store() -> InMemoryStore {
    InMemoryStore::new()
        .with(
            "templates",
            json!({"name": "recursive", "content": "{{depth}}", "scripts": [{"name": "recurse"}]}),
        )
        .with("scripts", json!({"name": "recurse", "content": RECURSE}))
}

#[tokio::test]
async fn three_nested_renders_succeed() {
    let counter = Arc::new(CountingEngine::default());
    let p = RenderPipeline::new(engine(recursive_store(), settings()), counter.clone());
    let request =
        RenderRequest::new(json!({"name": "recursive"})).with_data(json!({"depth": 0, "limit": 3}));
    assert_eq!(render_text(&p, request).await, "3<2<1<0");
    assert_eq!(counter.0.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn fourth_nested_render_hits_the_cycle_limit() {
    let counter = Arc::new(CountingEngine::default());
    let p = RenderPipeline::new(engine(recursive_store(), settings()), counter.clone());
    let request =
        RenderRequest::new(json!({"name": "recursive"})).with_data(json!({"depth": 0, "limit": 4}));
    let err = p.render(request).await.unwrap_err();
    assert!(matches!(err, ScriptsError::CycleLimit { max: 3 }), "{err}");
    assert!(err.is_weak());
    assert_eq!(err.status_code(), Some(400));
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn nested_renders_fit_in_a_single_sandbox_slot() {
    let engine = ScriptsEngine::new(
        Arc::new(SandboxExecutor::new(SandboxConfig {
            max_concurrent: 1,
            ..SandboxConfig::default()
        })),
        Arc::new(ActionCatalog::with_builtins([]).unwrap()),
        Arc::new(recursive_store()),
        settings(),
    );
    let p = RenderPipeline::new(engine, Arc::new(PlaceholderEngine));
    let request =
        RenderRequest::new(json!({"name": "recursive"})).with_data(json!({"depth": 0, "limit": 3}));
    assert_eq!(render_text(&p, request).await, "3<2<1<0");
}

#[tokio::test]
async fn caught_cycle_refusal_does_not_relabel_later_failures() {
    let swallow = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            try {
                await proxy.render({
                    template: { name: 'recursive' },
                    data: { depth: 0, limit: 4 },
                });
            } catch (e) {}
        }
    "#;
    let p = pipeline(recursive_store());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[swallow, "function beforeRender() { throw new Error('real bug') }"]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptFault, "{err}");
    assert!(err.to_string().contains("real bug"), "{err}");
}

#[tokio::test]
async fn timeout_after_a_caught_cycle_refusal_is_a_timeout() {
    let swallow_then_spin = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            try {
                await proxy.render({
                    template: { name: 'recursive' },
                    data: { depth: 0, limit: 4 },
                });
            } catch (e) {}
            while (true) {}
        }
    "#;
    let p = RenderPipeline::new(
        engine(
            recursive_store(),
            ScriptsSettings {
                timeout_ms: 2_000,
                ..ScriptsSettings::default()
            },
        ),
        Arc::new(PlaceholderEngine),
    );
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[swallow_then_spin]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
}

#[tokio::test]
async fn caught_cycle_refusal_lets_the_render_finish() {
    let swallow = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            try {
                await proxy.render({
                    template: { name: 'recursive' },
                    data: { depth: 0, limit: 4 },
                });
            } catch (e) {
                req.template.content = 'fallback';
            }
        }
    "#;
    let p = pipeline(recursive_store());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[swallow]),
    }));
    assert_eq!(render_text(&p, request).await, "fallback");
}

#[tokio::test]
async fn nested_render_keeps_the_original_identity() {
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req, res) {
            const nested = await proxy.render({
                template: { content: 'inner' },
                context: { user: { name: 'mallory' } },
            });
            req.data.nested = nested.content.toString();
        }
    "#;
    let p = RenderPipeline::new(
        engine(InMemoryStore::new(), settings()),
        Arc::new(IdentityEngine),
    );
    let request = RenderRequest::new(json!({"content": "{{nested}}", "scripts": inline(&[script])}))
        .with_user(json!({"name": "alice"}));
    let text = render_text(&p, request).await;
    assert_eq!(text, "alice|alice|inner");
}

#[tokio::test]
async fn scripts_cannot_replace_the_user() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[
            "function beforeRender(req) { req.context.user = { name: 'mallory' }; req.context.note = 'hi' }",
            "function beforeRender(req) { req.template.content = req.context.note + ':' + (req.context.user === undefined) }",
        ]),
    }))
    .with_user(json!({"name": "alice"}));
    assert_eq!(render_text(&p, request).await, "hi:true");
}

#[tokio::test]
async fn after_hook_sees_binary_content() {
    let script = r#"
        function afterRender(req, res) {
            if (!Buffer.isBuffer(res.content)) throw new Error('content is not binary');
            res.content = Buffer.concat([res.content, Buffer.from([0, 255])]);
        }
    "#;
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({"content": "hello", "scripts": inline(&[script])}));
    let response = p.render(request).await.unwrap();
    assert_eq!(response.content, b"hello\x00\xff".to_vec());
}

#[tokio::test]
async fn after_hook_only_runs_for_scripts_that_define_it() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "x",
        "scripts": inline(&[
            "function beforeRender(req) { req.template.content += 'y' }",
            "function afterRender(req, res) { res.content = Buffer.from(res.content.toString() + '!') }",
        ]),
    }));
    assert_eq!(render_text(&p, request).await, "xy!");
}

#[tokio::test]
async fn non_error_throw_is_a_script_fault() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&["function beforeRender(req, res) { throw 2 }"]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptFault);
    assert!(err.to_string().contains("non-Error"), "{err}");
}

#[tokio::test]
async fn thrown_error_carries_the_script_stack() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&["async function beforeRender(req, res) { throw new Error('boom') }"]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    let stack = err.script_stack().unwrap_or_default();
    assert!(!stack.contains("hookline:bootstrap"), "{stack}");
}

#[tokio::test]
async fn failure_aborts_remaining_scripts() {
    let counter = Arc::new(CountingEngine::default());
    let p = RenderPipeline::new(engine(InMemoryStore::new(), settings()), counter.clone());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[
            "function beforeRender(req) { throw new Error('first') }",
            "function beforeRender(req) { req.template.content = 'never' }",
        ]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert!(err.to_string().contains("first"));
    assert_eq!(counter.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_with_status_code_is_weak() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&[
            "function beforeRender(req, res) { req.cancel({ message: 'not today', statusCode: 406 }) }",
            "function beforeRender(req) { throw new Error('should not run') }",
        ]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert!(err.is_weak());
    assert_eq!(err.status_code(), Some(406));
    assert!(err.to_string().contains("not today"));
}

#[tokio::test]
async fn shared_context_flows_through_nested_renders() {
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req, res) {
            req.context.shared.value = '1';
            await proxy.render({
                template: {
                    content: 'child',
                    scripts: [{ content: "function beforeRender(req) { req.context.shared.value += '2' }" }],
                },
            });
            req.context.shared.value += '3';
            req.template.content = req.context.shared.value;
        }
    "#;
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "123");
}

#[tokio::test]
async fn nested_template_is_loaded_by_name() {
    let store = InMemoryStore::new().with("templates", json!({"name": "footer", "content": "-- {{page}} --"}));
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            const footer = await proxy.render({ template: { name: 'footer' }, data: { page: 7 } });
            req.data.footer = footer.content.toString();
        }
    "#;
    let p = pipeline(store);
    let request = RenderRequest::new(json!({"content": "body {{footer}}", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "body -- 7 --");
}

#[tokio::test]
async fn template_without_content_or_reference_is_rejected() {
    let p = pipeline(InMemoryStore::new());
    let err = p.render(RenderRequest::new(json!({}))).await.unwrap_err();
    assert!(matches!(err, ScriptsError::TemplateMissingContent));
}

#[tokio::test]
async fn store_queries_through_the_proxy() {
    let store = InMemoryStore::new()
        .with("customers", json!({"name": "Ada", "tier": "gold"}))
        .with("customers", json!({"name": "Bob", "tier": "silver"}));
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            const customers = proxy.documentStore.collection('customers');
            const gold = await customers.find({ tier: 'gold' });
            const bob = await customers.findOne({ name: 'Bob' });
            req.template.content = gold.map((c) => c.name).join(',') + '/' + bob.tier;
        }
    "#;
    let p = pipeline(store);
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "Ada/silver");
}

struct SayHello;

#[async_trait::async_trait]
impl ProxyAction for SayHello {
    async fn call(&self, _ctx: &ActionContext, payload: Value) -> Result<Value, DispatchError> {
        let name = payload["name"].as_str().unwrap_or("nobody");
        Ok(json!({ "greeting": format!("hello {name}") }))
    }
}

struct Greetings;

impl ProxyHandlerModule for Greetings {
    fn name(&self) -> &str {
        "greetings"
    }

    fn actions(&self) -> Vec<(String, Arc<dyn ProxyAction>)> {
        vec![("custom.sayHello".to_string(), Arc::new(SayHello))]
    }
}

#[tokio::test]
async fn custom_actions_are_exposed_at_their_path() {
    let catalog =
        ActionCatalog::with_builtins([Arc::new(Greetings) as Arc<dyn ProxyHandlerModule>]).unwrap();
    let scripts = ScriptsEngine::new(
        Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        Arc::new(catalog),
        Arc::new(InMemoryStore::new()),
        settings(),
    );
    let p = RenderPipeline::new(scripts, Arc::new(PlaceholderEngine));
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            const r = await proxy.custom.sayHello({ name: 'world' });
            req.template.content = r.greeting;
        }
    "#;
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "hello world");
}

#[tokio::test]
async fn proxy_surface_mirrors_the_catalog() {
    let p = pipeline(InMemoryStore::new());
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            req.template.content = typeof proxy.custom;
        }
    "#;
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "undefined");
}

#[tokio::test]
async fn allowed_module_loads_from_the_roots() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("helperA.js"),
        "module.exports = { greet: (name) => 'hi ' + name };",
    )
    .unwrap();
    let settings = ScriptsSettings {
        modules: ModulePolicy::listed(["helperA"]),
        module_roots: vec![dir.path().to_path_buf()],
        ..settings()
    };
    let p = RenderPipeline::new(engine(InMemoryStore::new(), settings), Arc::new(PlaceholderEngine));
    let script = r#"
        const helper = require('helperA');
        function beforeRender(req) { req.template.content = helper.greet('there') }
    "#;
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    assert_eq!(render_text(&p, request).await, "hi there");
}

#[tokio::test]
async fn unlisted_module_is_refused_with_a_hint() {
    let p = pipeline(InMemoryStore::new());
    let script = r#"
        const fs = require('fs');
        function beforeRender(req) {}
    "#;
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    let err = p.render(request).await.unwrap_err();
    assert!(matches!(err, ScriptsError::ModuleDenied { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::EngineFault);
    assert!(err.to_string().contains("scripts.allowed_modules"), "{err}");
}

#[tokio::test]
async fn runaway_script_times_out() {
    let settings = ScriptsSettings {
        timeout_ms: 200,
        ..settings()
    };
    let p = RenderPipeline::new(engine(InMemoryStore::new(), settings), Arc::new(PlaceholderEngine));
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&["function beforeRender(req) { while (true) {} }"]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(err.to_string().contains("scripts.timeout_ms"));
}

#[tokio::test]
async fn hook_that_never_settles_is_a_script_fault() {
    let p = pipeline(InMemoryStore::new());
    let request = RenderRequest::new(json!({
        "content": "",
        "scripts": inline(&["function beforeRender(req, res, done) {}"]),
    }));
    let err = p.render(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScriptFault);
    assert!(err.to_string().contains("done()"), "{err}");
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<(LogLevel, String)>>);

impl LogSink for RecordingSink {
    fn log(&self, level: LogLevel, message: &str, metadata: &Value) {
        assert!(metadata.get("script").is_some());
        self.0.lock().unwrap().push((level, message.to_string()));
    }
}

#[tokio::test]
async fn console_output_reaches_the_sink_and_response_meta() {
    let sink = Arc::new(RecordingSink::default());
    let scripts = engine(InMemoryStore::new(), settings()).with_log_sink(sink.clone());
    let p = RenderPipeline::new(scripts, Arc::new(PlaceholderEngine));
    let script = r#"
        const proxy = require('hookline-proxy');
        async function beforeRender(req) {
            console.log('outer', { n: 1 });
            await proxy.render({
                template: { content: '', scripts: [{ content: "function beforeRender() { console.warn('inner') }" }] },
            });
        }
    "#;
    let request = RenderRequest::new(json!({"content": "", "scripts": inline(&[script])}));
    let response = p.render(request).await.unwrap();

    let recorded = sink.0.lock().unwrap().clone();
    assert!(recorded.contains(&(LogLevel::Warn, "inner".to_string())));
    assert!(recorded.contains(&(LogLevel::Debug, r#"outer {"n":1}"#.to_string())));

    let logs = response.meta["logs"].as_array().unwrap();
    let messages: Vec<&str> = logs.iter().filter_map(|l| l["message"].as_str()).collect();
    assert_eq!(messages, vec![r#"outer {"n":1}"#, "inner"]);
}
