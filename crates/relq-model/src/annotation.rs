//! Per-source semantic markers attached during parsing.

use serde::{Deserialize, Serialize};

use crate::source::QuerySource;

/// The semantic marker carried by an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnotationKind {
    /// Results for this source must be registered with the state manager.
    TrackingRequired,
    /// Results for this source must not be tracked.
    NoTracking,
    /// Predicates over this source use relational (three-valued) null
    /// semantics instead of in-process comparison semantics.
    RelationalNullSemantics,
}

/// A semantic marker attached to a query source during parsing.
///
/// When the compiler merges a source into another (subquery lifting, join
/// flattening), it re-keys the annotation to the surviving source so later
/// passes still find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnnotation {
    /// The source the marker applies to. Mutated on merge.
    pub source: QuerySource,
    /// The marker itself.
    pub kind: AnnotationKind,
}

impl QueryAnnotation {
    /// Create an annotation for a source.
    pub fn new(source: QuerySource, kind: AnnotationKind) -> Self {
        Self { source, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QuerySourceArena;

    #[test]
    fn test_rekey() {
        let mut arena = QuerySourceArena::new();
        let inner = arena.create("inner");
        let outer = arena.create("outer");

        let mut annotation = QueryAnnotation::new(inner, AnnotationKind::TrackingRequired);
        annotation.source = outer;
        assert_eq!(annotation.source, outer);
        assert_eq!(annotation.kind, AnnotationKind::TrackingRequired);
    }
}
