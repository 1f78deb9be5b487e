#![warn(missing_docs)]

//! # hookline-config
//!
//! Configuration loading for the hookline script engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [scripts]
//! timeout_ms = 30000
//! allowed_modules = ["helperA", "underscore"]
//! root_directory = "."
//! app_directory = "${APP_DIR}"
//!
//! [scripts.context]
//! hidden = ["secrets"]
//! read_only = ["tenant"]
//!
//! [sandbox]
//! max_heap_mb = 64
//! max_concurrent = 16
//! execution_mode = "child_process"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default wall-clock budget for one script execution.
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level hookline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooklineConfig {
    /// Script execution settings.
    #[serde(default)]
    pub scripts: ScriptsConfig,

    /// Sandbox resource settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Settings for the scripts extension.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    /// Wall-clock budget per script execution, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Which modules scripts may `require`.
    #[serde(default)]
    pub allowed_modules: AllowedModules,

    /// Root directory searched first when resolving modules.
    #[serde(default)]
    pub root_directory: Option<PathBuf>,

    /// Application directory searched second.
    #[serde(default)]
    pub app_directory: Option<PathBuf>,

    /// Parent module directory searched last.
    #[serde(default)]
    pub parent_module_directory: Option<PathBuf>,

    /// Request context visibility rules.
    #[serde(default)]
    pub context: ContextVisibility,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SCRIPT_TIMEOUT_MS,
            allowed_modules: AllowedModules::default(),
            root_directory: None,
            app_directory: None,
            parent_module_directory: None,
            context: ContextVisibility::default(),
        }
    }
}

impl ScriptsConfig {
    /// Module search roots in resolution order.
    pub fn module_roots(&self) -> Vec<PathBuf> {
        [
            &self.root_directory,
            &self.app_directory,
            &self.parent_module_directory,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT_MS
}

/// The `allowed_modules` setting.
///
/// Accepts the wildcard string `"*"`, a list of module names, or a table
/// mapping module names to explicit file locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AllowedModules {
    /// `"*"`: every resolvable module may be required.
    Wildcard(String),
    /// Only the listed names resolve, using the configured roots.
    List(Vec<String>),
    /// Only the listed names resolve, each to the given location.
    Map(BTreeMap<String, PathBuf>),
}

impl Default for AllowedModules {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

/// Which request-context fields scripts can see or change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextVisibility {
    /// Fields removed from the sandbox view.
    #[serde(default)]
    pub hidden: Vec<String>,

    /// Fields visible to scripts but never merged back.
    #[serde(default)]
    pub read_only: Vec<String>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent sandbox executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum proxy calls per script execution.
    #[serde(default)]
    pub max_proxy_calls: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_script_kb: Option<usize>,

    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Maximum IPC message size in megabytes (child process mode).
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,
}

impl HooklineConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: HooklineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let AllowedModules::Wildcard(value) = &self.scripts.allowed_modules {
            if value != "*" {
                return Err(ConfigError::Invalid(format!(
                    "scripts.allowed_modules: unsupported value '{value}', expected \"*\" or a list of module names"
                )));
            }
        }
        if self.scripts.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scripts.timeout_ms must be greater than zero".into(),
            ));
        }
        if let Some(mode) = &self.sandbox.execution_mode {
            if mode != "in_process" && mode != "child_process" {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.execution_mode: unsupported mode '{mode}', supported: in_process, child_process"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = HooklineConfig::from_toml("").unwrap();
        assert_eq!(config.scripts.timeout_ms, DEFAULT_SCRIPT_TIMEOUT_MS);
        assert_eq!(config.scripts.allowed_modules, AllowedModules::List(vec![]));
        assert!(config.sandbox.execution_mode.is_none());
    }

    #[test]
    fn config_parses_module_list() {
        let toml = r#"
            [scripts]
            allowed_modules = ["helperA", "underscore"]
            timeout_ms = 4000
        "#;

        let config = HooklineConfig::from_toml(toml).unwrap();
        assert_eq!(config.scripts.timeout_ms, 4000);
        assert_eq!(
            config.scripts.allowed_modules,
            AllowedModules::List(vec!["helperA".into(), "underscore".into()])
        );
    }

    #[test]
    fn config_parses_wildcard_modules() {
        let toml = r#"
            [scripts]
            allowed_modules = "*"
        "#;

        let config = HooklineConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.scripts.allowed_modules,
            AllowedModules::Wildcard("*".into())
        );
    }

    #[test]
    fn config_parses_module_map() {
        let toml = r#"
            [scripts.allowed_modules]
            helperA = "lib/helperA.js"
        "#;

        let config = HooklineConfig::from_toml(toml).unwrap();
        match config.scripts.allowed_modules {
            AllowedModules::Map(map) => {
                assert_eq!(map["helperA"], PathBuf::from("lib/helperA.js"));
            }
            other => panic!("expected map, got {other:?}"),
        }
    }

    #[test]
    fn config_rejects_non_wildcard_string() {
        let toml = r#"
            [scripts]
            allowed_modules = "fs"
        "#;

        let err = HooklineConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("allowed_modules"), "should name the knob: {msg}");
    }

    #[test]
    fn config_rejects_unknown_execution_mode() {
        let toml = r#"
            [sandbox]
            execution_mode = "remote"
        "#;

        let err = HooklineConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("remote"));
        assert!(msg.contains("child_process"));
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let toml = r#"
            [scripts]
            timeout_ms = 0
        "#;
        assert!(HooklineConfig::from_toml(toml).is_err());
    }

    #[test]
    fn module_roots_follow_resolution_order() {
        let toml = r#"
            [scripts]
            root_directory = "/srv/root"
            parent_module_directory = "/srv/parent"
            app_directory = "/srv/app"
        "#;

        let config = HooklineConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.scripts.module_roots(),
            vec![
                PathBuf::from("/srv/root"),
                PathBuf::from("/srv/app"),
                PathBuf::from("/srv/parent"),
            ]
        );
    }

    #[test]
    fn config_parses_context_visibility() {
        let toml = r#"
            [scripts.context]
            hidden = ["secrets"]
            read_only = ["tenant"]
        "#;

        let config = HooklineConfig::from_toml(toml).unwrap();
        assert_eq!(config.scripts.context.hidden, vec!["secrets"]);
        assert_eq!(config.scripts.context.read_only, vec!["tenant"]);
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("HOOKLINE_TEST_APP_DIR", "/opt/app");
        let toml = r#"
            [scripts]
            app_directory = "${HOOKLINE_TEST_APP_DIR}"
        "#;

        let config = HooklineConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.scripts.app_directory,
            Some(PathBuf::from("/opt/app"))
        );
        std::env::remove_var("HOOKLINE_TEST_APP_DIR");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hookline.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            max_heap_mb = 128
            execution_mode = "child_process"
        "#,
        )
        .unwrap();

        let config = HooklineConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(
            config.sandbox.execution_mode.as_deref(),
            Some("child_process")
        );
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
