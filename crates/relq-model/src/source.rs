//! Query-source handles and the arena that issues them.
//!
//! A query source identifies one row-producing clause of a query (the main
//! from, an additional from, a join, or a subquery). Handles are small
//! integers issued once at parse time, so every per-source map in the
//! compiler is keyed by a plain index instead of reference identity.

use serde::{Deserialize, Serialize};

/// Opaque identity of one row-producing clause in a query.
///
/// Equality is handle equality: two sources are the same clause iff they
/// carry the same handle from the same [`QuerySourceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuerySource(u32);

impl QuerySource {
    /// Raw handle value, usable as an array index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena issuing query-source handles for one query compilation.
///
/// The arena is created by the upstream parser and outlives the compiled
/// query model; the compiler only reads from it.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QuerySourceArena {
    names: Vec<String>,
}

impl QuerySourceArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new query source with a diagnostic item name.
    pub fn create(&mut self, name: impl Into<String>) -> QuerySource {
        let handle = QuerySource(self.names.len() as u32);
        self.names.push(name.into());
        handle
    }

    /// Diagnostic name of a source (the range variable it was declared as).
    pub fn name(&self, source: QuerySource) -> &str {
        &self.names[source.index()]
    }

    /// Number of sources issued so far.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check whether no sources have been issued.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_distinct() {
        let mut arena = QuerySourceArena::new();
        let a = arena.create("a");
        let b = arena.create("b");
        assert_ne!(a, b);
        assert_eq!(arena.name(a), "a");
        assert_eq!(arena.name(b), "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_index_is_issue_order() {
        let mut arena = QuerySourceArena::new();
        let a = arena.create("a");
        let b = arena.create("b");
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
    }
}
