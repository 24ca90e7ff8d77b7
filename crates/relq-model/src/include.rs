//! Include specifications for navigation loading.

use serde::{Deserialize, Serialize};

use crate::source::QuerySource;

/// A request to load related entities along a navigation path.
///
/// Built by an upstream include clause; the compiler consumes it to compute
/// reader offsets and to splice navigation fixup into the shaper for the
/// owning query source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeSpec {
    /// The query source whose results own the navigations.
    pub source: QuerySource,
    /// Navigation names walked from the source's entity type, in order.
    pub navigation_path: Vec<String>,
    /// Whether loaded related entities must be registered for tracking.
    pub tracking: bool,
}

impl IncludeSpec {
    /// Create an include for a navigation path on a source.
    pub fn new(source: QuerySource, path: Vec<impl Into<String>>) -> Self {
        Self {
            source,
            navigation_path: path.into_iter().map(Into::into).collect(),
            tracking: true,
        }
    }

    /// Disable tracking for entities loaded through this include.
    pub fn no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QuerySourceArena;

    #[test]
    fn test_include_path() {
        let mut arena = QuerySourceArena::new();
        let c = arena.create("c");
        let include = IncludeSpec::new(c, vec!["orders", "lines"]);
        assert_eq!(include.navigation_path, vec!["orders", "lines"]);
        assert!(include.tracking);
        assert!(!include.no_tracking().tracking);
    }
}
