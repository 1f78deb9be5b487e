//! Capability-scoped module loading.
//!
//! The sandbox has no filesystem access, so `require` cannot read modules at
//! run time. Instead the host scans the script (and every module it pulls in)
//! for string-literal `require('name')` calls before execution, checks each
//! name against the [`ModulePolicy`], resolves allowed names against the
//! module roots, and ships the sources into the isolate as pre-registered
//! factories. Refused and unresolvable names are recorded as edges carrying an
//! error message; the in-sandbox `require` throws that message immediately.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Module name that always resolves to the proxy bridge.
pub const PROXY_MODULE: &str = "hookline-proxy";

/// Key under which the edges of the script itself are stored.
pub const SCRIPT_KEY: &str = "";

const MAX_PRELOADED_MODULES: usize = 512;

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*(?:'([^'\n]+)'|"([^"\n]+)"|`([^`$\n]+)`)\s*\)"#)
        .expect("require pattern is valid")
});

/// Which module names a script may load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModulePolicy {
    /// Any name resolvable from the module roots.
    All,
    /// Only the listed names. A mapped path overrides normal resolution.
    Listed {
        /// Name to optional explicit location.
        modules: BTreeMap<String, Option<PathBuf>>,
    },
}

impl Default for ModulePolicy {
    fn default() -> Self {
        Self::Listed {
            modules: BTreeMap::new(),
        }
    }
}

impl ModulePolicy {
    /// Policy allowing only the given names, resolved normally.
    pub fn listed<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Listed {
            modules: names.into_iter().map(|n| (n.into(), None)).collect(),
        }
    }

    fn fallback_hint(&self) -> String {
        match self {
            Self::All => {
                "Only string-literal require() calls are resolved before execution".to_string()
            }
            Self::Listed { .. } => denial_hint(),
        }
    }
}

fn denial_hint() -> String {
    "To be able to require custom modules add the module name to the `scripts.allowed_modules` \
     list in hookline.toml, or set `scripts.allowed_modules = \"*\"` to allow every module"
        .to_string()
}

fn denial_message(name: &str) -> String {
    format!("Unsupported module in scripts: '{name}'. {}", denial_hint())
}

/// A module source ready to be registered inside the isolate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource {
    /// Unique key (the resolved path).
    pub key: String,
    /// Module text. JSON files are wrapped into `module.exports = ...`.
    pub source: String,
}

/// One `require(name)` edge from a script or module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEdge {
    /// Key of the resolved module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Why the name cannot be loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleEdge {
    fn resolved(key: String) -> Self {
        Self {
            key: Some(key),
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            key: None,
            error: Some(message),
        }
    }
}

/// The module graph reachable from one script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedModules {
    /// Sources to register, in discovery order.
    pub sources: Vec<ModuleSource>,
    /// Edges keyed by the requiring module ([`SCRIPT_KEY`] for the script).
    pub graph: BTreeMap<String, BTreeMap<String, ModuleEdge>>,
    /// Message suffix for names that were never scanned (dynamic requires).
    pub fallback: String,
}

impl PreparedModules {
    /// Scan `script` and resolve every statically required module.
    pub fn prepare(script: &str, policy: &ModulePolicy, roots: &[PathBuf]) -> Self {
        let mut prepared = Self {
            fallback: policy.fallback_hint(),
            ..Self::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, String, Option<PathBuf>)> = VecDeque::new();
        queue.push_back((SCRIPT_KEY.to_string(), script.to_string(), None));

        while let Some((from_key, source, dir)) = queue.pop_front() {
            let mut edges = BTreeMap::new();
            for name in required_names(&source) {
                if name == PROXY_MODULE || edges.contains_key(&name) {
                    continue;
                }
                let edge = match locate(&name, policy, roots, dir.as_deref()) {
                    Ok(path) => {
                        let key = path.to_string_lossy().into_owned();
                        if seen.contains(&key) {
                            ModuleEdge::resolved(key)
                        } else if seen.len() >= MAX_PRELOADED_MODULES {
                            ModuleEdge::failed(format!(
                                "Cannot load module '{name}': more than {MAX_PRELOADED_MODULES} modules required"
                            ))
                        } else {
                            match read_module(&path) {
                                Ok(text) => {
                                    seen.insert(key.clone());
                                    queue.push_back((
                                        key.clone(),
                                        text.clone(),
                                        path.parent().map(Path::to_path_buf),
                                    ));
                                    prepared.sources.push(ModuleSource {
                                        key: key.clone(),
                                        source: text,
                                    });
                                    ModuleEdge::resolved(key)
                                }
                                Err(e) => ModuleEdge::failed(format!(
                                    "Cannot load module '{name}': {e}"
                                )),
                            }
                        }
                    }
                    Err(message) => ModuleEdge::failed(message),
                };
                if let Some(error) = &edge.error {
                    tracing::debug!(module = %name, error = %error, "module not loadable");
                }
                edges.insert(name, edge);
            }
            if !edges.is_empty() {
                prepared.graph.insert(from_key, edges);
            }
        }

        prepared
    }

    /// Number of modules that will be preloaded.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no module will be preloaded.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// String-literal names passed to `require` in `source`, in order of appearance.
pub fn required_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for caps in REQUIRE_RE.captures_iter(source) {
        if let Some(m) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) {
            let name = m.as_str().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

fn is_relative(name: &str) -> bool {
    name.starts_with("./") || name.starts_with("../")
}

/// Apply the policy to `name` and find the file it refers to.
///
/// Relative names required from inside an already-admitted module are part
/// of that module and bypass the allow-list.
fn locate(
    name: &str,
    policy: &ModulePolicy,
    roots: &[PathBuf],
    from_dir: Option<&Path>,
) -> Result<PathBuf, String> {
    if let (true, Some(dir)) = (is_relative(name), from_dir) {
        return resolve_in(dir, name).ok_or_else(|| not_found(name, &[dir.to_path_buf()]));
    }

    match policy {
        ModulePolicy::All => resolve(name, roots),
        ModulePolicy::Listed { modules } => match modules.get(name) {
            None => Err(denial_message(name)),
            Some(Some(explicit)) => {
                if explicit.is_absolute() {
                    resolve_file(explicit).ok_or_else(|| not_found(name, &[explicit.clone()]))
                } else {
                    roots
                        .iter()
                        .find_map(|root| resolve_file(&root.join(explicit)))
                        .ok_or_else(|| not_found(name, roots))
                }
            }
            Some(None) => resolve(name, roots),
        },
    }
}

fn resolve(name: &str, roots: &[PathBuf]) -> Result<PathBuf, String> {
    roots
        .iter()
        .find_map(|root| resolve_in(root, name))
        .ok_or_else(|| not_found(name, roots))
}

fn not_found(name: &str, searched: &[PathBuf]) -> String {
    let dirs: Vec<String> = searched.iter().map(|p| p.display().to_string()).collect();
    format!(
        "Cannot find module '{name}' (searched: {})",
        if dirs.is_empty() {
            "no module roots configured".to_string()
        } else {
            dirs.join(", ")
        }
    )
}

/// Resolve `name` from one base directory: the base itself, then `node_modules`.
fn resolve_in(base: &Path, name: &str) -> Option<PathBuf> {
    if Path::new(name).is_absolute() {
        return None;
    }
    resolve_file(&base.join(name)).or_else(|| {
        if is_relative(name) {
            None
        } else {
            resolve_file(&base.join("node_modules").join(name))
        }
    })
}

/// Try `path`, `path.js`, `path.json`, then the directory entry point.
fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return canonical(path);
    }
    for ext in ["js", "json"] {
        let with_ext = append_extension(path, ext);
        if with_ext.is_file() {
            return canonical(&with_ext);
        }
    }
    if path.is_dir() {
        if let Some(main) = package_main(path) {
            if let Some(found) = resolve_file(&path.join(main)) {
                return Some(found);
            }
        }
        let index = path.join("index.js");
        if index.is_file() {
            return canonical(&index);
        }
    }
    None
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn canonical(path: &Path) -> Option<PathBuf> {
    std::fs::canonicalize(path).ok()
}

fn package_main(dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let pkg: serde_json::Value = serde_json::from_str(&text).ok()?;
    pkg.get("main")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

fn read_module(path: &Path) -> std::io::Result<String> {
    let text = std::fs::read_to_string(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        Ok(format!("module.exports = {text};"))
    } else {
        Ok(text)
    }
}
