//! Compilation frames.
//!
//! Each query-model nesting level gets one frame holding the in-progress
//! selects for the sources declared at that level. Frames form a tree via
//! parent ids in a flat arena; child frames walk ancestors when binding a
//! property on a source declared further out.

use std::collections::HashMap;

use relq_model::QuerySource;

use crate::sql::SelectExpr;

/// Index of a frame in the arena.
pub type FrameId = usize;

/// Per-level compilation state.
#[derive(Debug, Default)]
pub struct Frame {
    parent: Option<FrameId>,
    queries: HashMap<QuerySource, SelectExpr>,
    subqueries: HashMap<QuerySource, SelectExpr>,
}

impl Frame {
    /// Register the select for a source declared in this frame.
    pub fn add_query(&mut self, source: QuerySource, select: SelectExpr) {
        self.queries.insert(source, select);
    }

    /// Remove and return the select registered for a source.
    pub fn remove_query(&mut self, source: QuerySource) -> Option<SelectExpr> {
        self.queries.remove(&source)
    }

    /// Park the pre-lift select of a from-clause subquery.
    pub fn add_subquery(&mut self, source: QuerySource, select: SelectExpr) {
        self.subqueries.insert(source, select);
    }

    /// The parked subquery select for a source, if one was recorded.
    pub fn subquery(&self, source: QuerySource) -> Option<&SelectExpr> {
        self.subqueries.get(&source)
    }

    /// Move a parked subquery select out; a source leaves the subquery map
    /// at most once, when it lifts or falls back to nested execution.
    pub fn take_subquery(&mut self, source: QuerySource) -> Option<SelectExpr> {
        self.subqueries.remove(&source)
    }

    /// The select producing rows for a source: a direct registration, or the
    /// select that absorbed the source through a merge.
    pub fn query(&self, source: QuerySource) -> Option<&SelectExpr> {
        self.queries.get(&source).or_else(|| {
            self.queries
                .values()
                .find(|select| select.handles_query_source(source))
        })
    }

    /// Mutable access to the select producing rows for a source.
    pub fn query_mut(&mut self, source: QuerySource) -> Option<&mut SelectExpr> {
        if self.queries.contains_key(&source) {
            return self.queries.get_mut(&source);
        }
        self.queries
            .values_mut()
            .find(|select| select.handles_query_source(source))
    }

    /// True when some select in this frame produces rows for the source.
    pub fn handles(&self, source: QuerySource) -> bool {
        self.queries.contains_key(&source)
            || self
                .queries
                .values()
                .any(|select| select.handles_query_source(source))
    }
}

/// Flat arena of compilation frames, one tree per compile call.
#[derive(Debug, Default)]
pub struct FrameArena {
    frames: Vec<Frame>,
}

impl FrameArena {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new frame with the given parent, returning its id.
    pub fn push(&mut self, parent: Option<FrameId>) -> FrameId {
        self.frames.push(Frame {
            parent,
            ..Default::default()
        });
        self.frames.len() - 1
    }

    /// Borrow a frame.
    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id]
    }

    /// Mutably borrow a frame.
    pub fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        &mut self.frames[id]
    }

    /// Find the ancestor frame (excluding `frame` itself) whose selects
    /// produce rows for the source.
    pub fn ancestor_handling(&self, frame: FrameId, source: QuerySource) -> Option<FrameId> {
        let mut current = self.frames[frame].parent;
        while let Some(id) = current {
            if self.frames[id].handles(source) {
                return Some(id);
            }
            current = self.frames[id].parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relq_model::QuerySourceArena;

    #[test]
    fn test_query_lookup_falls_back_to_absorbing_select() {
        let mut sources = QuerySourceArena::new();
        let u = sources.create("u");
        let p = sources.create("p");

        let mut arena = FrameArena::new();
        let frame = arena.push(None);

        let mut select = SelectExpr::from_table("users", "u", u);
        select.add_cross_join(
            crate::sql::TableExpr::Base {
                table: "posts".into(),
                alias: "p".into(),
                source: p,
            },
            vec![],
        );
        arena.frame_mut(frame).add_query(u, select);

        // p was absorbed into u's select; lookups for p land on it.
        assert!(arena.frame(frame).handles(p));
        assert!(arena.frame(frame).query(p).is_some());
        assert!(arena.frame_mut(frame).remove_query(p).is_none());
    }

    #[test]
    fn test_parked_subquery_select_moves_out_once() {
        let mut sources = QuerySourceArena::new();
        let s = sources.create("s");

        let mut arena = FrameArena::new();
        let frame = arena.push(None);
        arena
            .frame_mut(frame)
            .add_subquery(s, SelectExpr::from_table("users", "u", s));

        assert!(arena.frame(frame).subquery(s).is_some());
        assert!(arena.frame_mut(frame).take_subquery(s).is_some());
        assert!(arena.frame(frame).subquery(s).is_none());
        assert!(arena.frame_mut(frame).take_subquery(s).is_none());
    }

    #[test]
    fn test_ancestor_lookup_skips_current_frame() {
        let mut sources = QuerySourceArena::new();
        let u = sources.create("u");

        let mut arena = FrameArena::new();
        let root = arena.push(None);
        let child = arena.push(Some(root));
        arena
            .frame_mut(root)
            .add_query(u, SelectExpr::from_table("users", "u", u));

        assert_eq!(arena.ancestor_handling(child, u), Some(root));
        assert_eq!(arena.ancestor_handling(root, u), None);
    }
}
