//! Core data types: feathers (schema-as-data), properties as a sum type of
//! scalar vs. relation (per the spec's re-architecture note), and the small
//! set of system types (authorization grants, subscriptions, locks, change
//! log entries) that ride alongside every feather.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The surrogate primary key column, never exposed to callers.
pub const PK_COLUMN: &str = "_pk";

/// System columns present on every object, regardless of feather.
pub const SYSTEM_COLUMNS: &[&str] = &[
    "id", "created", "createdBy", "updated", "updatedBy", "isDeleted", "etag", "lock",
];

pub type ObjectRecord = serde_json::Map<String, Value>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Feather {
    pub name: String,
    pub plural: String,
    #[serde(default = "default_inherits")]
    pub inherits: String,
    #[serde(default)]
    pub is_child: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_fetch_on_startup: bool,
    #[serde(default)]
    pub properties: PropertyList,
}

fn default_inherits() -> String {
    "Object".to_owned()
}

impl Feather {
    pub fn table_name(&self) -> String {
        to_snake_case(&self.name)
    }

    pub fn is_root(&self) -> bool {
        self.name == "Object"
    }
}

/// An ordered association list from property name to descriptor. A `Vec`
/// rather than a map because merge order (parent properties first, in
/// parent-to-child order) is load-bearing for `getFeather`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyList(pub Vec<(String, Property)>);

impl PropertyList {
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.0.iter_mut().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    pub fn insert(&mut self, name: String, property: Property) {
        if let Some(existing) = self.get_mut(&name) {
            *existing = property;
        } else {
            self.0.push((name, property));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Property> {
        let index = self.0.iter().position(|(key, _)| key == name)?;
        Some(self.0.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Property)> {
        self.0.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    /// Prepends `other`'s entries that `self` does not already declare,
    /// preserving `other`'s relative order, then stamps `inherited_from` on
    /// every prepended entry. This implements the "inherited properties
    /// appear first, in parent-to-child order" merge rule.
    pub fn merge_inherited(&mut self, parent: &PropertyList, from: &str) {
        let mut merged = Vec::with_capacity(parent.0.len() + self.0.len());

        for (name, property) in &parent.0 {
            if !self.contains(name) {
                let mut inherited = property.clone();
                inherited.set_inherited_from(from.to_owned());
                merged.push((name.clone(), inherited));
            }
        }

        merged.extend(self.0.drain(..));
        self.0 = merged;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Property {
    Relation(RelationProperty),
    Scalar(ScalarProperty),
}

impl Property {
    pub fn inherited_from(&self) -> Option<&str> {
        match self {
            Property::Scalar(scalar) => scalar.inherited_from.as_deref(),
            Property::Relation(relation) => relation.inherited_from.as_deref(),
        }
    }

    fn set_inherited_from(&mut self, from: String) {
        match self {
            Property::Scalar(scalar) => scalar.inherited_from = Some(from),
            Property::Relation(relation) => relation.inherited_from = Some(from),
        }
    }

    pub fn is_required(&self) -> bool {
        match self {
            Property::Scalar(scalar) => scalar.is_required,
            Property::Relation(relation) => relation.is_required,
        }
    }

    pub fn is_natural_key(&self) -> bool {
        matches!(self, Property::Scalar(scalar) if scalar.is_natural_key)
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Property::Scalar(scalar) => scalar.is_read_only,
            Property::Relation(_) => false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScalarProperty {
    #[serde(rename = "type")]
    pub format: Format,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<DefaultValue>,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_unique: bool,
    #[serde(default)]
    pub is_natural_key: bool,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub autonumber: Option<Autonumber>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub inherited_from: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Literal(Value),
    /// A named function reference such as `now()` or `money()`, resolved at
    /// row-insert time by `crud::resolve_default`.
    Function(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Autonumber {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    pub length: u32,
    pub sequence: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationProperty {
    pub relation: String,
    #[serde(default)]
    pub properties: Option<Vec<String>>,
    #[serde(default)]
    pub child_of: Option<String>,
    #[serde(default)]
    pub parent_of: Option<String>,
    #[serde(default)]
    pub is_child: bool,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub inherited_from: Option<String>,
}

impl RelationProperty {
    pub fn kind(&self) -> RelationKind {
        if self.is_child {
            RelationKind::IsChild
        } else if self.parent_of.is_some() {
            RelationKind::ToMany
        } else {
            RelationKind::ToOne
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    ToOne,
    ToMany,
    IsChild,
}

/// Scalar formats, each mapping to a physical column type and a literal (or
/// named-function) default, per `tools.formats`/`tools.types`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Format {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Money,
    Color,
    Object,
    Array,
}

impl Format {
    pub fn db_type(self) -> &'static str {
        match self {
            Format::String | Format::Color => "text",
            Format::Integer => "integer",
            Format::Number => "double precision",
            Format::Boolean => "boolean",
            Format::Date => "date",
            Format::DateTime => "timestamptz",
            Format::Money => "jsonb",
            Format::Object | Format::Array => "jsonb",
        }
    }

    pub fn type_default(self) -> Value {
        match self {
            Format::String | Format::Color | Format::Date | Format::DateTime => Value::Null,
            Format::Integer => Value::from(0),
            Format::Number => Value::from(0.0),
            Format::Boolean => Value::from(false),
            Format::Money => serde_json::json!({ "amount": 0, "currency": null, "effective": null, "baseAmount": null }),
            Format::Object => Value::Object(Default::default()),
            Format::Array => Value::Array(Default::default()),
        }
    }
}

/// The principal making a request.
#[derive(Clone, Debug)]
pub struct CurrentUser {
    pub username: String,
    pub is_super_user: bool,
}

impl CurrentUser {
    pub fn super_user() -> Self {
        Self {
            username: "root".to_owned(),
            is_super_user: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    CanCreate,
    CanRead,
    CanUpdate,
    CanDelete,
}

impl Action {
    pub fn column(self) -> &'static str {
        match self {
            Action::CanCreate => "can_create",
            Action::CanRead => "can_read",
            Action::CanUpdate => "can_update",
            Action::CanDelete => "can_delete",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub object_pk: i64,
    pub role: String,
    pub can_create: bool,
    pub can_read: bool,
    pub can_update: bool,
    pub can_delete: bool,
    pub is_member_auth: bool,
    pub is_inherited: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub node_id: String,
    pub session_id: String,
    pub subscription_id: String,
    pub target: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub username: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub node_id: String,
    pub event_key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Post,
    Patch,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub object_id: String,
    pub action: ChangeAction,
    pub created_by: String,
    pub change: Value,
}

/// A feather's resolved ancestor chain, `self` last: `[Object, ..., Self]`
/// reversed for the trigger walk which runs "from the feather up to
/// `Object`" before, and the opposite order after.
pub fn inheritance_chain(feathers: &HashMap<String, Feather>, name: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cursor = Some(name.to_owned());
    let mut guard = 0;

    while let Some(current) = cursor {
        chain.push(current.clone());
        if current == "Object" || guard > 64 {
            break;
        }
        cursor = feathers.get(&current).map(|feather| feather.inherits.clone());
        guard += 1;
    }

    chain
}

pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);

    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }

    out
}

pub fn to_spinal_case(name: &str) -> String {
    to_snake_case(name).replace('_', "-")
}

pub fn to_camel_case(name: &str) -> String {
    let mut parts = name.split('_').filter(|part| !part.is_empty());
    let Some(first) = parts.next() else {
        return String::new();
    };

    let mut out = first.to_owned();
    for part in parts {
        let mut chars = part.chars();
        if let Some(head) = chars.next() {
            out.extend(head.to_uppercase());
            out.push_str(chars.as_str());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar() -> Property {
        Property::Scalar(ScalarProperty {
            format: Format::String,
            ..Default::default()
        })
    }

    #[test]
    fn merge_inherited_prepends_parent_properties() {
        let mut parent = PropertyList::default();
        parent.insert("firstName".to_owned(), scalar());

        let mut child = PropertyList::default();
        child.insert("lastName".to_owned(), scalar());
        child.merge_inherited(&parent, "Party");

        let names: Vec<&str> = child.names().collect();
        assert_eq!(names, vec!["firstName", "lastName"]);
        assert_eq!(child.get("firstName").unwrap().inherited_from(), Some("Party"));
        assert_eq!(child.get("lastName").unwrap().inherited_from(), None);
    }

    #[test]
    fn child_override_is_not_marked_inherited() {
        let mut parent = PropertyList::default();
        parent.insert("name".to_owned(), scalar());

        let mut child = PropertyList::default();
        child.insert("name".to_owned(), scalar());
        child.merge_inherited(&parent, "Party");

        assert_eq!(child.0.len(), 1);
        assert_eq!(child.get("name").unwrap().inherited_from(), None);
    }

    #[test]
    fn snake_and_camel_case_round_trip() {
        assert_eq!(to_snake_case("OrderLine"), "order_line");
        assert_eq!(to_camel_case("order_line"), "orderLine");
        assert_eq!(to_camel_case("created_by"), "createdBy");
    }

    #[test]
    fn inheritance_chain_walks_to_object() {
        let mut feathers = HashMap::new();
        feathers.insert(
            "OrderLine".to_owned(),
            Feather {
                name: "OrderLine".to_owned(),
                plural: "OrderLines".to_owned(),
                inherits: "Object".to_owned(),
                is_child: true,
                is_system: false,
                is_read_only: false,
                is_fetch_on_startup: false,
                properties: PropertyList::default(),
            },
        );

        let chain = inheritance_chain(&feathers, "OrderLine");
        assert_eq!(chain, vec!["OrderLine", "Object"]);
    }
}
