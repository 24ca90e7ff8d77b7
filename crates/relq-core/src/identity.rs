//! The entity identity map and query context.
//!
//! Materialization funnels through [`QueryContext::get_entity`]: for a
//! tracked query the state manager guarantees at most one instance per
//! entity key within its lifetime; untracked queries materialize fresh
//! instances without registering them.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use relq_model::Value;

/// The identity of one entity instance: type name plus key values.
#[derive(Debug, Clone)]
pub struct EntityKey {
    /// Entity type name.
    pub entity: String,
    /// Key property values in key order.
    pub values: Vec<Value>,
}

impl EntityKey {
    /// Create a key from extracted key-property values.
    pub fn new(entity: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            values,
        }
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| key_values_equal(a, b))
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        for value in &self.values {
            hash_key_value(value, state);
        }
    }
}

// Floats are compared and hashed by bit pattern so EntityKey satisfies Eq.
fn key_values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float64(x), Value::Float64(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

fn hash_key_value(value: &Value, state: &mut impl Hasher) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => (1u8, b).hash(state),
        Value::Int32(v) => (2u8, v).hash(state),
        Value::Int64(v) => (3u8, v).hash(state),
        Value::Float64(v) => (4u8, v.to_bits()).hash(state),
        Value::String(s) => (5u8, s).hash(state),
        Value::Bytes(b) => (6u8, b).hash(state),
        Value::Timestamp(t) => (7u8, t).hash(state),
        Value::Uuid(u) => (8u8, u).hash(state),
    }
}

/// A materialized entity instance.
#[derive(Debug)]
pub struct Entity {
    /// Entity type name.
    pub entity_type: String,
    /// The instance's key.
    pub key: EntityKey,
    /// Scalar property values in declaration order.
    pub fields: Vec<(String, Value)>,
    navigations: RwLock<Vec<(String, NavigationValue)>>,
}

impl Entity {
    /// Create an entity from materialized field values.
    pub fn new(entity_type: impl Into<String>, key: EntityKey, fields: Vec<(String, Value)>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key,
            fields,
            navigations: RwLock::new(Vec::new()),
        }
    }

    /// Read a scalar property value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }

    /// Read a loaded navigation.
    pub fn navigation(&self, name: &str) -> Option<NavigationValue> {
        self.navigations
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Attach a related entity to a reference navigation.
    pub fn attach_reference(&self, navigation: &str, related: Arc<Entity>) {
        let mut navigations = self.navigations.write();
        if let Some((_, existing)) = navigations.iter_mut().find(|(n, _)| n == navigation) {
            *existing = NavigationValue::Reference(related);
        } else {
            navigations.push((navigation.to_string(), NavigationValue::Reference(related)));
        }
    }

    /// Append a related entity to a collection navigation, creating it if
    /// this is the first attach.
    pub fn attach_collection_item(&self, navigation: &str, related: Arc<Entity>) {
        let mut navigations = self.navigations.write();
        match navigations.iter_mut().find(|(n, _)| n == navigation) {
            Some((_, NavigationValue::Collection(items))) => {
                if !items.iter().any(|e| e.key == related.key) {
                    items.push(related);
                }
            }
            Some((_, existing @ NavigationValue::Reference(_))) => {
                *existing = NavigationValue::Collection(vec![related]);
            }
            None => {
                navigations.push((
                    navigation.to_string(),
                    NavigationValue::Collection(vec![related]),
                ));
            }
        }
    }
}

/// A loaded navigation value.
#[derive(Debug, Clone)]
pub enum NavigationValue {
    /// A single related entity.
    Reference(Arc<Entity>),
    /// A set of related entities.
    Collection(Vec<Arc<Entity>>),
}

/// The identity map shared by tracked materialization.
///
/// Guarantees at most one tracked instance per entity key for its lifetime.
#[derive(Debug, Default)]
pub struct StateManager {
    entries: DashMap<EntityKey, Arc<Entity>>,
}

impl StateManager {
    /// Create an empty state manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the tracked instance for a key, materializing it with `load`
    /// only when the key is not tracked yet.
    pub fn get_or_create(&self, key: EntityKey, load: impl FnOnce() -> Entity) -> Arc<Entity> {
        self.entries
            .entry(key)
            .or_insert_with(|| Arc::new(load()))
            .clone()
    }

    /// Number of tracked instances.
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }
}

/// Per-query execution context: the tracking gateway for materialization.
#[derive(Debug, Clone)]
pub struct QueryContext {
    state: Arc<StateManager>,
}

impl QueryContext {
    /// Create a context over a shared state manager.
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    /// Create a context with its own private state manager.
    pub fn standalone() -> Self {
        Self::new(Arc::new(StateManager::new()))
    }

    /// The underlying state manager.
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Get-or-create a tracked entity, or materialize an untracked one.
    pub fn get_entity(
        &self,
        key: EntityKey,
        load: impl FnOnce() -> Entity,
        track: bool,
    ) -> Arc<Entity> {
        if track {
            self.state.get_or_create(key, load)
        } else {
            Arc::new(load())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("User", vec![Value::Int64(id)])
    }

    fn user(id: i64, name: &str) -> Entity {
        Entity::new(
            "User",
            key(id),
            vec![
                ("id".to_string(), Value::Int64(id)),
                ("name".to_string(), Value::String(name.into())),
            ],
        )
    }

    #[test]
    fn test_tracked_identity_is_shared() {
        let ctx = QueryContext::standalone();

        let first = ctx.get_entity(key(1), || user(1, "alice"), true);
        let second = ctx.get_entity(key(1), || user(1, "stale"), true);

        // Same instance: the second load never ran.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get("name"), Some(&Value::String("alice".into())));
        assert_eq!(ctx.state().tracked_count(), 1);
    }

    #[test]
    fn test_untracked_is_fresh_each_time() {
        let ctx = QueryContext::standalone();

        let first = ctx.get_entity(key(1), || user(1, "alice"), false);
        let second = ctx.get_entity(key(1), || user(1, "alice"), false);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.state().tracked_count(), 0);
    }

    #[test]
    fn test_collection_attach_dedups_by_key() {
        let owner = user(1, "alice");
        let related = Arc::new(user(2, "bob"));

        owner.attach_collection_item("friends", Arc::clone(&related));
        owner.attach_collection_item("friends", related);

        match owner.navigation("friends") {
            Some(NavigationValue::Collection(items)) => assert_eq!(items.len(), 1),
            other => panic!("expected collection, got {other:?}"),
        }
    }

    #[test]
    fn test_key_equality_distinguishes_entity_types() {
        let a = EntityKey::new("User", vec![Value::Int64(1)]);
        let b = EntityKey::new("Post", vec![Value::Int64(1)]);
        assert_ne!(a, b);
    }
}
