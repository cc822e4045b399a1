//! Names and id allocation.
//!
//! [`Symbol`] names rules, variables, fields and classes. The
//! [`AtomicIdAllocator`] hands out monotonically increasing ids for external
//! instances and temporary variables; it is safe to share across threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A name: rule names, variables, dictionary keys and class tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Temporaries (`_value_3`, renamed rule variables, `_`) start with an underscore.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with('_')
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of the placeholder variable used in partial constraints.
pub const THIS: &str = "_this";

/// Lock-free monotonic counter.
#[derive(Debug)]
pub struct AtomicIdAllocator {
    next: AtomicU64,
}

impl AtomicIdAllocator {
    /// Create an allocator whose first id is `start`.
    pub fn starting_from(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Return the current id and advance.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh temporary variable name such as `_value_12`.
    pub fn gensym(&self, prefix: &str) -> Symbol {
        Symbol(format!("_{prefix}_{}", self.next_id()))
    }
}

impl Default for AtomicIdAllocator {
    fn default() -> Self {
        Self::starting_from(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ids_start_at_the_given_value() {
        let ids = AtomicIdAllocator::default();
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn gensym_uses_prefix_and_counter() {
        let ids = AtomicIdAllocator::starting_from(5);
        assert_eq!(ids.gensym("value"), Symbol::new("_value_5"));
        assert!(ids.gensym("op").is_temporary());
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        let ids = Arc::new(AtomicIdAllocator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
