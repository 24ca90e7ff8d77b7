//! Entity metadata interfaces consumed by the compiler.
//!
//! The full entity model (conventions, building, validation) is an external
//! collaborator; the compiler only needs type/property/navigation lookup and
//! column-name resolution, which is what these types provide.

use crate::error::Error;

/// The entity model: lookup of entity types by name.
#[derive(Debug, Default, Clone)]
pub struct Model {
    entities: Vec<EntityType>,
}

impl Model {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity type.
    pub fn with_entity(mut self, entity: EntityType) -> Self {
        self.entities.push(entity);
        self
    }

    /// Find an entity type by name.
    pub fn entity(&self, name: &str) -> Option<&EntityType> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Find an entity type by name, failing with a descriptive error.
    pub fn require_entity(&self, name: &str) -> Result<&EntityType, Error> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }
}

/// One mapped entity type.
#[derive(Debug, Clone)]
pub struct EntityType {
    /// Entity type name.
    pub name: String,
    /// Backing table name.
    pub table: String,
    /// Mapped properties in declaration order.
    pub properties: Vec<PropertyDef>,
    /// Names of the primary-key properties, in key order.
    pub key: Vec<String>,
    /// Navigations to related entity types.
    pub navigations: Vec<NavigationDef>,
}

impl EntityType {
    /// Create an entity type mapped to a table.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            properties: vec![],
            key: vec![],
            navigations: vec![],
        }
    }

    /// Add a property.
    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Set the primary-key property names.
    pub fn with_key(mut self, key: Vec<impl Into<String>>) -> Self {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    /// Add a navigation.
    pub fn with_navigation(mut self, navigation: NavigationDef) -> Self {
        self.navigations.push(navigation);
        self
    }

    /// Find a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Find a navigation by name.
    pub fn navigation(&self, name: &str) -> Option<&NavigationDef> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Positions of the key properties within the property list.
    ///
    /// Panics if a key name does not resolve; that is a model-construction
    /// bug, not a query-time condition.
    pub fn key_positions(&self) -> Vec<usize> {
        self.key
            .iter()
            .map(|k| {
                self.properties
                    .iter()
                    .position(|p| &p.name == k)
                    .unwrap_or_else(|| panic!("key property '{k}' not declared on '{}'", self.name))
            })
            .collect()
    }
}

/// One mapped property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    /// Property name on the entity type.
    pub name: String,
    /// Column name in the backing table.
    pub column: String,
}

impl PropertyDef {
    /// Create a property mapped to a column.
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
        }
    }
}

/// A navigation to a related entity type.
#[derive(Debug, Clone)]
pub struct NavigationDef {
    /// Navigation name on the owning entity type.
    pub name: String,
    /// Target entity type name.
    pub target: String,
    /// Foreign-key property. For a collection navigation this lives on the
    /// target type and points back at the owner's key; for a reference
    /// navigation it lives on the owner and points at the target's key.
    pub foreign_key: String,
    /// Whether this navigation is collection-valued.
    pub collection: bool,
}

impl NavigationDef {
    /// A collection navigation (one-to-many).
    pub fn collection(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
            collection: true,
        }
    }

    /// A reference navigation (many-to-one or one-to-one).
    pub fn reference(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            foreign_key: foreign_key.into(),
            collection: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> EntityType {
        EntityType::new("Customer", "customers")
            .with_property(PropertyDef::new("id", "id"))
            .with_property(PropertyDef::new("name", "name"))
            .with_key(vec!["id"])
            .with_navigation(NavigationDef::collection("orders", "Order", "customer_id"))
    }

    #[test]
    fn test_lookup() {
        let model = Model::new().with_entity(customer());
        let entity = model.require_entity("Customer").unwrap();
        assert_eq!(entity.table, "customers");
        assert!(entity.property("name").is_some());
        assert!(entity.property("missing").is_none());
        assert!(model.require_entity("Nope").is_err());
    }

    #[test]
    fn test_key_positions() {
        let entity = customer();
        assert_eq!(entity.key_positions(), vec![0]);
    }

    #[test]
    fn test_navigation_lookup() {
        let entity = customer();
        let nav = entity.navigation("orders").unwrap();
        assert!(nav.collection);
        assert_eq!(nav.target, "Order");
        assert_eq!(nav.foreign_key, "customer_id");
    }
}
