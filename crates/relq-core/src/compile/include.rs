//! Include compilation: navigation-path resolution and reader indices.
//!
//! Includes are scanned in reverse declaration order. Every collection-valued
//! step opens one new reader; scalar steps record how many readers were
//! already open when they are read (zero when no collection step preceded
//! them in the scan). The executor uses these indices to line up navigation
//! loads with their data readers.

use relq_model::IncludeSpec;

use super::SourceBindings;
use crate::error::Error;
use crate::metadata::Model;
use crate::shaping::NavigationStep;

/// One include, resolved and indexed.
#[derive(Debug, Clone)]
pub struct IncludePlan {
    /// Resolved steps, outermost first.
    pub steps: Vec<NavigationStep>,
    /// Reader indices recorded by the scalar steps, in path order.
    pub reader_indices: Vec<usize>,
    /// Whether attached entities are tracked.
    pub tracking: bool,
}

/// All includes of one query, compiled.
#[derive(Debug, Clone)]
pub struct IncludeCompilation {
    /// Plans in declaration order, parallel to the input includes.
    pub plans: Vec<IncludePlan>,
    /// Total readers opened across all includes.
    pub readers_opened: usize,
}

/// Resolve and index the includes of a query.
pub fn compile_includes(
    model: &Model,
    bindings: &SourceBindings,
    includes: &[IncludeSpec],
) -> Result<IncludeCompilation, Error> {
    let mut opened_reader_count = 0usize;
    let mut plans = vec![None; includes.len()];

    for (position, include) in includes.iter().enumerate().rev() {
        let steps = resolve_steps(model, bindings, include)?;
        let mut reader_indices = Vec::new();
        let mut opened_new_reader = false;
        for step in &steps {
            if step.collection {
                opened_new_reader = true;
                opened_reader_count += 1;
            } else {
                reader_indices.push(if opened_new_reader {
                    opened_reader_count
                } else {
                    0
                });
            }
        }
        plans[position] = Some(IncludePlan {
            steps,
            reader_indices,
            tracking: include.tracking,
        });
    }

    Ok(IncludeCompilation {
        plans: plans.into_iter().map(|p| p.expect("every include planned")).collect(),
        readers_opened: opened_reader_count,
    })
}

fn resolve_steps(
    model: &Model,
    bindings: &SourceBindings,
    include: &IncludeSpec,
) -> Result<Vec<NavigationStep>, Error> {
    let Some(mut owner) = bindings.entity_of(include.source) else {
        return Err(Error::InvalidQuery(format!(
            "include source {:?} is not entity-typed",
            include.source
        )));
    };
    let mut steps = Vec::with_capacity(include.navigation_path.len());
    for name in &include.navigation_path {
        let entity = model.require_entity(owner)?;
        let navigation = entity
            .navigation(name)
            .ok_or_else(|| Error::UnknownNavigation {
                entity: entity.name.clone(),
                navigation: name.clone(),
            })?;
        steps.push(NavigationStep {
            navigation: navigation.name.clone(),
            target: navigation.target.clone(),
            foreign_key: navigation.foreign_key.clone(),
            collection: navigation.collection,
        });
        owner = navigation.target.as_str();
    }
    Ok(steps)
}
