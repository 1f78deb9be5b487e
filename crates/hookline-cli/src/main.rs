#![warn(missing_docs)]

//! hookline: render a template with its before/after scripts from the
//! command line.
//!
//! ```text
//! hookline render <template> [--dir PATH] [--data JSON|@FILE] [--user JSON] [--out FILE]
//! ```
//!
//! Documents come from a directory holding `templates/*.json` and
//! `scripts/*.json` or `scripts/*.js`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hookline_config::HooklineConfig;
use hookline_sandbox::audit::TracingAuditLogger;
use hookline_sandbox::{SandboxConfig, SandboxExecutor};
use hookline_scripts::{
    ActionCatalog, InMemoryStore, PlaceholderEngine, RenderPipeline, RenderRequest, Renderer,
    ScriptsEngine, ScriptsSettings,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "usage: hookline render <template> [--dir PATH] [--data JSON|@FILE] [--user JSON] [--out FILE]";

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &hookline_config::SandboxOverrides) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(calls) = overrides.max_proxy_calls {
        config.max_proxy_calls = calls;
    }
    if let Some(kb) = overrides.max_script_kb {
        config.max_script_size = kb * 1024;
    }
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = mode.parse().map_err(anyhow::Error::msg)?;
    }
    if let Some(size) = overrides.max_ipc_message_size_mb {
        config.max_ipc_message_size = size * 1024 * 1024;
    }
    Ok(config)
}

/// Locate the config file.
///
/// Search order:
/// 1. `HOOKLINE_CONFIG` environment variable
/// 2. `./hookline.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("HOOKLINE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("hookline.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

#[derive(Debug, Default, PartialEq)]
struct RenderArgs {
    template: String,
    dir: Option<PathBuf>,
    data: Option<String>,
    user: Option<String>,
    out: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<RenderArgs> {
    let mut iter = args.iter();
    match iter.next().map(String::as_str) {
        Some("render") => {}
        Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
        None => bail!(USAGE),
    }

    let mut parsed = RenderArgs::default();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--dir" => parsed.dir = Some(PathBuf::from(value("--dir")?)),
            "--data" => parsed.data = Some(value("--data")?),
            "--user" => parsed.user = Some(value("--user")?),
            "--out" => parsed.out = Some(PathBuf::from(value("--out")?)),
            flag if flag.starts_with("--") => bail!("unknown flag '{flag}'\n{USAGE}"),
            name if parsed.template.is_empty() => parsed.template = name.to_string(),
            extra => bail!("unexpected argument '{extra}'\n{USAGE}"),
        }
    }
    if parsed.template.is_empty() {
        bail!("missing template name\n{USAGE}");
    }
    Ok(parsed)
}

/// Parse inline JSON, or read it from a file when prefixed with `@`.
fn json_arg(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).with_context(|| format!("invalid JSON: {raw}"))
}

/// Load `templates/` and `scripts/` under `dir` into an in-memory store.
///
/// A `.js` script becomes `{ name: <file stem>, content }`. JSON files are
/// taken as complete documents.
fn load_documents(dir: &Path) -> Result<InMemoryStore> {
    let store = InMemoryStore::new();
    for collection in ["templates", "scripts"] {
        let path = dir.join(collection);
        if !path.is_dir() {
            continue;
        }
        let mut entries = std::fs::read_dir(&path)
            .with_context(|| format!("failed to list {}", path.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let file = entry.path();
            let document = match file.extension().and_then(|e| e.to_str()) {
                Some("json") => {
                    let text = std::fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("invalid JSON in {}", file.display()))?
                }
                Some("js") if collection == "scripts" => {
                    let content = std::fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    let name = file.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                    json!({ "name": name, "content": content })
                }
                _ => continue,
            };
            tracing::debug!(collection, file = %file.display(), "loaded document");
            store.insert(collection, document);
        }
    }
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("hookline {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let render_args = parse_args(&args)?;

    let config = match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            HooklineConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, using defaults");
            HooklineConfig::from_toml("")?
        }
    };

    let sandbox_config = build_sandbox_config(&config.sandbox)?;
    let executor = SandboxExecutor::with_audit_logger(sandbox_config, Arc::new(TracingAuditLogger));

    let dir = render_args.dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let store = load_documents(&dir)?;
    let catalog = ActionCatalog::with_builtins([])?;
    let scripts = ScriptsEngine::new(
        Arc::new(executor),
        Arc::new(catalog),
        Arc::new(store),
        ScriptsSettings::from_config(&config.scripts),
    );
    let pipeline = RenderPipeline::new(scripts, Arc::new(PlaceholderEngine));

    let mut request = RenderRequest::new(json!({ "name": render_args.template }));
    if let Some(ref data) = render_args.data {
        request = request.with_data(json_arg(data)?);
    }
    if let Some(ref user) = render_args.user {
        request = request.with_user(json_arg(user)?);
    }

    let response = match pipeline.render(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(kind = ?e.kind(), code = e.code(), status = ?e.status_code(), "render failed");
            if let Some(stack) = e.script_stack() {
                eprintln!("{stack}");
            }
            return Err(e.into());
        }
    };

    match render_args.out {
        Some(path) => tokio::fs::write(&path, &response.content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            use tokio::io::AsyncWriteExt;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&response.content).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookline_sandbox::ExecutionMode;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn build_sandbox_config_defaults() {
        let overrides = hookline_config::SandboxOverrides::default();
        let config = build_sandbox_config(&overrides).unwrap();
        let defaults = SandboxConfig::default();
        assert_eq!(config.max_heap_size, defaults.max_heap_size);
        assert_eq!(config.max_concurrent, defaults.max_concurrent);
        assert_eq!(config.execution_mode, ExecutionMode::InProcess);
    }

    #[test]
    fn build_sandbox_config_applies_overrides() {
        let config = HooklineConfig::from_toml(
            "[sandbox]\nmax_heap_mb = 64\nmax_proxy_calls = 5\nmax_script_kb = 8\nexecution_mode = \"child_process\"",
        )
        .unwrap();
        let sandbox = build_sandbox_config(&config.sandbox).unwrap();
        assert_eq!(sandbox.max_heap_size, 64 * 1024 * 1024);
        assert_eq!(sandbox.max_proxy_calls, 5);
        assert_eq!(sandbox.max_script_size, 8 * 1024);
        assert_eq!(sandbox.execution_mode, ExecutionMode::ChildProcess);
    }

    #[test]
    fn parse_render_command() {
        let parsed = parse_args(&args(&[
            "render", "invoice", "--dir", "docs", "--data", "{\"n\":1}",
        ]))
        .unwrap();
        assert_eq!(parsed.template, "invoice");
        assert_eq!(parsed.dir, Some(PathBuf::from("docs")));
        assert_eq!(parsed.data.as_deref(), Some("{\"n\":1}"));
        assert!(parsed.out.is_none());
    }

    #[test]
    fn parse_rejects_missing_template_and_unknown_flags() {
        assert!(parse_args(&args(&["render"])).is_err());
        assert!(parse_args(&args(&["render", "x", "--verbose"])).is_err());
        assert!(parse_args(&args(&["serve"])).is_err());
        assert!(parse_args(&args(&["render", "x", "--out"])).is_err());
    }

    #[test]
    fn json_arg_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"total": 12}"#).unwrap();
        let value = json_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(value["total"], 12);
        assert!(json_arg("{not json").is_err());
    }

    #[tokio::test]
    async fn load_documents_reads_templates_and_scripts() {
        use hookline_scripts::{AuthContext, DocumentStore};

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(
            dir.path().join("templates/invoice.json"),
            r#"{"name": "invoice", "content": "{{total}}", "scripts": [{"name": "tax"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("scripts/tax.js"),
            "function beforeRender(req) { req.data.total *= 2 }",
        )
        .unwrap();
        std::fs::write(dir.path().join("scripts/notes.txt"), "ignored").unwrap();

        let store = load_documents(dir.path()).unwrap();
        let auth = AuthContext::default();
        let script = store
            .find_one("scripts", &json!({"name": "tax"}), &auth)
            .await
            .unwrap()
            .unwrap();
        assert!(script["content"].as_str().unwrap().contains("beforeRender"));
        let templates = store.find("templates", &json!({}), &auth).await.unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(store.find("scripts", &json!({}), &auth).await.unwrap().len(), 1);
    }

    #[test]
    fn version_is_the_package_version() {
        assert!(!env!("CARGO_PKG_VERSION").is_empty());
    }
}
