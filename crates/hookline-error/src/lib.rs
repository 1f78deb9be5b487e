//! Typed error types for hookline proxy action handlers.
//!
//! Provides [`DispatchError`], the canonical error type returned by every
//! host-side proxy action (`render`, `documentStore.collection.find`, custom
//! actions) and by the bridge that routes sandbox calls to them.

use thiserror::Error;

/// Canonical error type for proxy action dispatch.
///
/// All variants are `#[non_exhaustive]` to allow future additions without
/// breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// No handler is registered for the requested action.
    #[error("No proxy method handler found for action '{action}'{}", .suggestion.as_deref().map(|s| format!(". {s}")).unwrap_or_default())]
    ActionNotFound {
        /// The action name the script asked for.
        action: String,
        /// Closest registered action, phrased as a hint.
        suggestion: Option<String>,
    },

    /// The payload sent with the action does not have the expected shape.
    #[error("invalid payload for action '{action}': {reason}")]
    InvalidPayload {
        /// The action that rejected the payload.
        action: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The nested render ceiling was reached for the current external request.
    #[error(
        "maximum nested render depth exceeded ({max}); verify proxy render calls are not causing a cycle"
    )]
    CycleLimit {
        /// The configured ceiling.
        max: u32,
    },

    /// The document store rejected or failed a query.
    #[error("document store error in collection '{collection}': {message}")]
    Store {
        /// The collection that was queried.
        collection: String,
        /// The error message from the store.
        message: String,
    },

    /// A nested render failed.
    #[error("nested render failed: {message}")]
    Render {
        /// The error message from the nested render.
        message: String,
    },

    /// A per-execution proxy call limit was exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ActionNotFound { .. } => "ACTION_NOT_FOUND",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::CycleLimit { .. } => "CYCLE_LIMIT",
            Self::Store { .. } => "STORE_ERROR",
            Self::Render { .. } => "RENDER_ERROR",
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// An [`ActionNotFound`](Self::ActionNotFound) error suggesting the
    /// closest of `known_actions`, if any is near enough.
    pub fn action_not_found<S: AsRef<str>>(action: &str, known_actions: &[S]) -> Self {
        Self::ActionNotFound {
            action: action.to_string(),
            suggestion: find_similar_action(action, known_actions),
        }
    }
}

/// Find the closest registered action name using Levenshtein distance.
///
/// Returns a suggestion string if an action within edit distance 3 is found.
fn find_similar_action<S: AsRef<str>>(action: &str, known_actions: &[S]) -> Option<String> {
    let mut best: Option<(usize, String)> = None;

    for candidate in known_actions {
        let candidate = candidate.as_ref();
        let dist = strsim::levenshtein(action, candidate);
        if dist <= 3 && best.as_ref().is_none_or(|(d, _)| dist < *d) {
            best = Some((dist, format!("Did you mean '{candidate}'?")));
        }
    }

    best.map(|(_, suggestion)| suggestion)
}

// Compile-time assertion: DispatchError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<DispatchError>();
};
