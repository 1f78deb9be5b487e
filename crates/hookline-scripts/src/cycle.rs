//! Nested render guard.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Ceiling on nested `render` proxy calls per external request.
pub const MAX_NESTED_RENDERS: u32 = 3;

/// Counter of nested renders, shared by reference across one external
/// request's whole call tree.
///
/// Cloning shares the count. It never decreases and is never reset when a
/// nested render finishes; a new external request starts with a fresh
/// counter.
#[derive(Debug, Clone, Default)]
pub struct CycleCounter {
    count: Arc<AtomicU32>,
}

/// Returned by [`CycleCounter::enter`] past the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleLimitExceeded {
    /// The ceiling.
    pub max: u32,
}

impl CycleCounter {
    /// A counter for a new external request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one nested render. Fails once the count passes the ceiling.
    pub fn enter(&self) -> Result<u32, CycleLimitExceeded> {
        let count = self.count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if count > MAX_NESTED_RENDERS {
            tracing::warn!(count, max = MAX_NESTED_RENDERS, "nested render ceiling exceeded");
            return Err(CycleLimitExceeded {
                max: MAX_NESTED_RENDERS,
            });
        }
        Ok(count)
    }

    /// Nested renders recorded so far.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether two counters belong to the same call tree.
    pub fn same_tree(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.count, &other.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_ceiling() {
        let counter = CycleCounter::new();
        for expected in 1..=MAX_NESTED_RENDERS {
            assert_eq!(counter.enter(), Ok(expected));
        }
        assert_eq!(
            counter.enter(),
            Err(CycleLimitExceeded {
                max: MAX_NESTED_RENDERS
            })
        );
    }

    #[test]
    fn clones_share_the_count() {
        let top = CycleCounter::new();
        let nested = top.clone();
        top.enter().unwrap();
        nested.enter().unwrap();
        assert_eq!(top.count(), 2);
        assert!(top.same_tree(&nested));
    }

    #[test]
    fn new_requests_start_fresh() {
        let first = CycleCounter::new();
        for _ in 0..=MAX_NESTED_RENDERS {
            let _ = first.enter();
        }
        let second = CycleCounter::new();
        assert_eq!(second.count(), 0);
        assert!(!first.same_tree(&second));
    }

    #[test]
    fn refuses_every_render_past_the_ceiling() {
        let counter = CycleCounter::new();
        for _ in 0..10 {
            let _ = counter.enter();
        }
        assert_eq!(counter.count(), 10);
        assert!(counter.enter().is_err());
    }
}
