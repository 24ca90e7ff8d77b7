//! Shaped queries: the compiled pairing of a row source and a per-row
//! shaping function.
//!
//! Compilation produces data, not closures: a [`CompiledQuery`] holds the
//! finished select, a [`Shaper`] describing how each raw row buffer becomes
//! scoped results (entities or offset buffer views), the client-side
//! operations that could not be pushed down, and the final row selector.
//! The executor in [`crate::exec`] interprets all of it.

use std::sync::Arc;

use relq_model::{Expr, OrderSpec, QuerySource, Value};

use crate::identity::Entity;
use crate::sql::SelectExpr;

/// A raw row of values with a positional offset.
///
/// Offsets let one merged row serve several shapers: after join flattening
/// the inner shaper reads the same buffer shifted by the outer's original
/// projection count.
#[derive(Debug, Clone)]
pub struct ValueBuffer {
    values: Arc<Vec<Value>>,
    offset: usize,
}

impl ValueBuffer {
    /// Create a buffer over a row of values.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: Arc::new(values),
            offset: 0,
        }
    }

    /// A view of the same row shifted by `offset` positions.
    pub fn with_offset(&self, offset: usize) -> Self {
        Self {
            values: Arc::clone(&self.values),
            offset: self.offset + offset,
        }
    }

    /// Read the value at a position relative to this view's offset.
    pub fn get(&self, index: usize) -> &Value {
        &self.values[self.offset + index]
    }

    /// Number of values visible from this view's offset.
    pub fn len(&self) -> usize {
        self.values.len().saturating_sub(self.offset)
    }

    /// True when no values are visible from this view's offset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One shaped result for a single query source.
#[derive(Debug, Clone)]
pub enum Shaped {
    /// An offset view of the raw row, with a property-to-position map.
    Buffer(BufferView),
    /// A materialized (possibly tracked) entity.
    Entity(Arc<Entity>),
    /// A plain scalar value.
    Value(Value),
    /// A sequence of shaped results (group joins, client subqueries).
    Sequence(Vec<Shaped>),
}

/// An offset view of a row buffer plus the property map needed to read
/// columns from it client-side.
#[derive(Debug, Clone)]
pub struct BufferView {
    /// The offset row view.
    pub buffer: ValueBuffer,
    /// Property name to position, relative to the view's offset.
    pub columns: Arc<Vec<(String, usize)>>,
}

impl BufferView {
    /// Read a property's value out of the view.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, index)| self.buffer.get(*index))
    }
}

/// The per-row scope: shaped results keyed by query source.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    entries: Vec<(QuerySource, Shaped)>,
}

impl Scope {
    /// An empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shaped result for a source.
    pub fn insert(&mut self, source: QuerySource, shaped: Shaped) {
        self.entries.push((source, shaped));
    }

    /// Look up the shaped result for a source.
    pub fn get(&self, source: QuerySource) -> Option<&Shaped> {
        self.entries
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, shaped)| shaped)
    }
}

/// How one query source's slice of the row becomes a shaped result.
#[derive(Debug, Clone)]
pub enum Shaper {
    /// Return an offset buffer view, skipping entity-key computation.
    Buffer(BufferShaper),
    /// Materialize a tracked entity through the identity map.
    Entity(EntityShaper),
    /// A flattened join row: outer shaper first, inner shaper reading the
    /// same buffer at a shifted offset.
    Pair {
        /// Shaper for the first source's columns.
        outer: Box<Shaper>,
        /// Shaper for the columns appended by the merge.
        inner: Box<Shaper>,
    },
}

impl Shaper {
    /// Merge two shapers over one flattened row, shifting the inner shaper
    /// by the outer's original projection count.
    pub fn flattened(outer: Shaper, mut inner: Shaper, offset: usize) -> Shaper {
        inner.shift_offset(offset);
        Shaper::Pair {
            outer: Box::new(outer),
            inner: Box::new(inner),
        }
    }

    /// Shift every buffer offset in this shaper by `by` positions.
    pub fn shift_offset(&mut self, by: usize) {
        match self {
            Shaper::Buffer(b) => b.offset += by,
            Shaper::Entity(e) => e.offset += by,
            Shaper::Pair { outer, inner } => {
                outer.shift_offset(by);
                inner.shift_offset(by);
            }
        }
    }

    /// Query sources this shaper produces results for.
    pub fn sources(&self) -> Vec<QuerySource> {
        match self {
            Shaper::Buffer(b) => vec![b.source],
            Shaper::Entity(e) => vec![e.source],
            Shaper::Pair { outer, inner } => {
                let mut sources = outer.sources();
                sources.extend(inner.sources());
                sources
            }
        }
    }

    /// The primary (first declared) source of this shaper.
    pub fn primary_source(&self) -> QuerySource {
        match self {
            Shaper::Buffer(b) => b.source,
            Shaper::Entity(e) => e.source,
            Shaper::Pair { outer, .. } => outer.primary_source(),
        }
    }

    /// Find the entity shaper for a source, if any.
    pub fn entity_shaper_mut(&mut self, source: QuerySource) -> Option<&mut EntityShaper> {
        match self {
            Shaper::Entity(e) if e.source == source => Some(e),
            Shaper::Entity(_) | Shaper::Buffer(_) => None,
            Shaper::Pair { outer, inner } => outer
                .entity_shaper_mut(source)
                .or_else(|| inner.entity_shaper_mut(source)),
        }
    }

    /// Find the buffer shaper for a source, if any.
    pub fn buffer_shaper_mut(&mut self, source: QuerySource) -> Option<&mut BufferShaper> {
        match self {
            Shaper::Buffer(b) if b.source == source => Some(b),
            Shaper::Buffer(_) | Shaper::Entity(_) => None,
            Shaper::Pair { outer, inner } => outer
                .buffer_shaper_mut(source)
                .or_else(|| inner.buffer_shaper_mut(source)),
        }
    }
}

/// Shaper producing a raw buffer view for a source.
#[derive(Debug, Clone)]
pub struct BufferShaper {
    /// The source being shaped.
    pub source: QuerySource,
    /// Offset of this source's columns in the merged row.
    pub offset: usize,
    /// Property name to position, relative to `offset`.
    pub columns: Vec<(String, usize)>,
}

/// Shaper materializing an entity for a source.
#[derive(Debug, Clone)]
pub struct EntityShaper {
    /// The source being shaped.
    pub source: QuerySource,
    /// Entity type name.
    pub entity: String,
    /// Offset of this source's columns in the merged row.
    pub offset: usize,
    /// Positions of the key properties, relative to `offset`.
    pub key_indices: Vec<usize>,
    /// Property name to position, relative to `offset`, in declaration
    /// order - the materializer mapping.
    pub properties: Vec<(String, usize)>,
    /// Whether materialized entities register with the state manager.
    pub tracking: bool,
    /// Navigation loads spliced in for this source.
    pub includes: Vec<IncludeShaper>,
}

/// A compiled include: the resolved navigation path plus the reader indices
/// computed from declaration order.
#[derive(Debug, Clone)]
pub struct IncludeShaper {
    /// Resolved navigation steps from the owner's entity type outward.
    pub steps: Vec<NavigationStep>,
    /// For each scalar step, the count of readers already opened when it is
    /// read; collection steps open a new reader and record nothing.
    pub reader_indices: Vec<usize>,
    /// Whether attached entities register with the state manager.
    pub tracking: bool,
}

/// One resolved step of an include's navigation path.
#[derive(Debug, Clone)]
pub struct NavigationStep {
    /// Navigation name on the owning entity type.
    pub navigation: String,
    /// Target entity type name.
    pub target: String,
    /// Foreign-key property (on the target for collections, on the owner
    /// for references).
    pub foreign_key: String,
    /// Whether the step is collection-valued.
    pub collection: bool,
}

/// How the final result is selected from each row's scope.
#[derive(Debug, Clone)]
pub enum RowSelector {
    /// Return the shaped result of one source.
    Source(QuerySource),
    /// Read the column at an absolute projection index.
    Column(usize),
    /// Evaluate a generic expression over the scope client-side.
    Client(Expr),
}

/// A client-side operation applied to the shaped row stream, in clause
/// order, because it could not be pushed down.
#[derive(Debug, Clone)]
pub enum ClientOp {
    /// Filter rows by evaluating a predicate over the scope.
    Filter(Expr),
    /// Sort the materialized stream.
    OrderBy(Vec<OrderSpec>),
    /// Cross-join a separately executed secondary source (client
    /// `SelectMany` fallback).
    CrossJoin(SecondarySource),
    /// Nested-loop equi-join against a separately executed secondary source
    /// (join whose predicate did not translate).
    NestedLoopJoin {
        /// The secondary rows.
        secondary: SecondarySource,
        /// Key selector over the existing scope.
        outer_key: Expr,
        /// Key selector over the secondary source.
        inner_key: Expr,
    },
    /// Group-join: matching secondary rows become a sequence in the scope.
    GroupJoin {
        /// Source the group sequence is exposed as.
        group_source: QuerySource,
        /// The secondary rows.
        secondary: SecondarySource,
        /// Key selector over the existing scope.
        outer_key: Expr,
        /// Key selector over the secondary source.
        inner_key: Expr,
    },
    /// Skip the first `n` results client-side.
    Skip(u64),
    /// Keep at most `n` results client-side.
    Take(u64),
}

/// A row source executed separately and combined client-side.
#[derive(Debug, Clone)]
pub struct SecondarySource {
    /// The source the secondary results are exposed as in the scope.
    pub source: QuerySource,
    /// The secondary query, executed independently per outer stream.
    pub query: Box<CompiledQuery>,
}

/// A terminal result operator applied after shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Count the results.
    Count,
    /// Keep only the first result.
    First,
}

/// Where the raw rows of a compiled query come from.
#[derive(Debug, Clone)]
pub enum RowSource {
    /// A relational select interpreted by the row store, shaped per row.
    Select {
        /// The finished select.
        select: SelectExpr,
        /// The per-row shaper.
        shaper: Shaper,
    },
    /// A nested compiled query whose results feed the outer scope (a
    /// subquery that could not be lifted).
    Nested {
        /// The source the nested results are exposed as.
        source: QuerySource,
        /// The nested query.
        query: Box<CompiledQuery>,
    },
}

/// The compiled form of one query: row source, client operations, selector,
/// and optional terminal operator.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Raw row production.
    pub source: RowSource,
    /// Client-side operations in clause order.
    pub ops: Vec<ClientOp>,
    /// Final per-row selection.
    pub selector: RowSelector,
    /// Terminal result operator, if any.
    pub terminal: Option<Terminal>,
}
