//! Pre-execution script validator.
//!
//! The V8 isolate is the security boundary. These checks reject obvious
//! runtime-escape attempts early with a readable error instead of a confusing
//! `undefined is not a function` from deep inside the script.

use crate::error::SandboxError;

/// Default maximum script size in bytes (512 KB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 512 * 1024;

const BANNED_PATTERNS: &[&str] = &[
    "Deno.",                   // Runtime escape
    "import(",                 // Dynamic imports bypass the module policy
    "constructor.constructor", // Function constructor bypass
    "constructor[",            // Same, via bracket notation
    "process.binding",
    "process.dlopen",
    "WebAssembly.",
];

/// Validate script text before it reaches the isolate.
///
/// Empty scripts are accepted: a script defining neither hook is a no-op.
pub fn validate_script(script: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_SCRIPT_SIZE);

    if script.len() > max {
        return Err(SandboxError::ScriptTooLarge {
            max,
            actual: script.len(),
        });
    }

    if script.contains('\0') {
        return Err(SandboxError::ValidationFailed {
            reason: "script contains a NUL byte".into(),
        });
    }

    for pattern in BANNED_PATTERNS {
        if script.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}
