//! The feather catalog: schema-as-data, with an in-memory cache in front of
//! the `$feather` system table and the DDL needed to keep physical tables in
//! sync with saved descriptors. Grounded in the teacher's `Chat` struct
//! (`examples/chat/src/chat.rs`), which holds shared mutable state behind an
//! `Arc` for the lifetime of the process; the catalog plays the same role
//! here for feather metadata instead of chat rooms.

use diesel::sql_types::{Jsonb, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::db::Connection;
use crate::error::Result;
use crate::model::{Feather, PropertyList, inheritance_chain};

#[derive(QueryableByName)]
struct FeatherRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Jsonb)]
    body: serde_json::Value,
}

/// Holds every registered feather, keyed by name. `saveFeather`/
/// `deleteFeather` mutate both this cache and the physical schema inside the
/// same transaction that provisioned the row in `$feather`, so the cache
/// never observes a descriptor the database doesn't also have.
pub struct Catalog {
    feathers: RwLock<HashMap<String, Feather>>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            feathers: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every persisted feather into the cache. Called once at
    /// startup; `is_fetch_on_startup` on individual feathers does not gate
    /// this (that flag controls client bootstrap payloads, not the server
    /// cache).
    pub async fn load(&self, conn: &mut Connection<'_>) -> Result<()> {
        let rows: Vec<FeatherRow> = diesel::sql_query("SELECT name, body FROM feather")
            .load(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to load feather catalog: {error}")))?;

        let mut feathers = self.feathers.write().expect("feather cache poisoned");
        feathers.clear();
        for row in rows {
            if let Ok(feather) = serde_json::from_value::<Feather>(row.body) {
                feathers.insert(row.name, feather);
            }
        }

        Ok(())
    }

    /// Returns the merged descriptor: inherited properties first (in
    /// parent-to-child order), with a child redeclaration overriding the
    /// inherited fields it names.
    pub fn get_feather(&self, name: &str, include_inherited: bool) -> Result<Feather> {
        let feathers = self.feathers.read().expect("feather cache poisoned");
        let own = feathers
            .get(name)
            .cloned()
            .ok_or_else(|| crate::err!(404, message = format!("unknown feather \"{name}\"")))?;

        if !include_inherited || own.is_root() {
            return Ok(own);
        }

        let chain = inheritance_chain(&feathers, name);
        let mut merged_properties = PropertyList::default();

        for ancestor in chain.iter().rev() {
            let Some(ancestor_feather) = feathers.get(ancestor) else {
                continue;
            };
            if ancestor == name {
                merged_properties.merge_inherited(&PropertyList::default(), ancestor);
                for (property_name, property) in ancestor_feather.properties.iter() {
                    merged_properties.insert(property_name.clone(), property.clone());
                }
            } else {
                merged_properties.merge_inherited(&ancestor_feather.properties, ancestor);
            }
        }

        Ok(Feather {
            properties: merged_properties,
            ..own
        })
    }

    pub fn snapshot_for_inheritance(&self) -> HashMap<String, Feather> {
        self.snapshot()
    }

    /// Resolves a spinal-case path token against every feather's singular
    /// and plural form. Returns the feather plus whether the match was the
    /// plural (collection) form, so `/data/:name` can disambiguate a
    /// filtered query from an insert using one route pattern.
    pub fn resolve_spinal(&self, token: &str) -> Option<(Feather, bool)> {
        let feathers = self.feathers.read().expect("feather cache poisoned");
        for feather in feathers.values() {
            if crate::model::to_spinal_case(&feather.name) == token {
                return Some((feather.clone(), false));
            }
            if crate::model::to_spinal_case(&feather.plural) == token {
                return Some((feather.clone(), true));
            }
        }
        None
    }

    fn snapshot(&self) -> HashMap<String, Feather> {
        self.feathers.read().expect("feather cache poisoned").clone()
    }

    /// Idempotent: the first save provisions the physical table (inheriting
    /// from the parent feather's table); later saves diff the incoming
    /// properties against the stored descriptor and reconcile columns.
    pub async fn save_feather(&self, conn: &mut Connection<'_>, mut feather: Feather) -> Result<Feather> {
        inject_parent_of_for_child_of(&mut feather, &self.snapshot())?;

        let existing = self.feathers.read().expect("feather cache poisoned").get(&feather.name).cloned();

        match existing {
            None => create_table(conn, &feather).await?,
            Some(previous) => reconcile_table(conn, &previous, &feather).await?,
        }

        let body = serde_json::to_value(&feather).expect("feather serializes");
        diesel::sql_query(
            "INSERT INTO feather (name, body) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET body = EXCLUDED.body",
        )
        .bind::<Text, _>(feather.name.clone())
        .bind::<Jsonb, _>(body)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to persist feather: {error}")))?;

        self.feathers
            .write()
            .expect("feather cache poisoned")
            .insert(feather.name.clone(), feather.clone());

        Ok(feather)
    }

    /// Drops the table (and any composite views), removes the catalog
    /// entry, and rebuilds any parent feather whose `parentOf` pointed at
    /// this feather.
    pub async fn delete_feather(&self, conn: &mut Connection<'_>, name: &str) -> Result<()> {
        let feather = self.get_feather(name, false)?;

        diesel::sql_query(format!("DROP TABLE IF EXISTS {} CASCADE", feather.table_name()))
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to drop table for {name}: {error}")))?;

        diesel::sql_query("DELETE FROM feather WHERE name = $1")
            .bind::<Text, _>(name.to_owned())
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to remove feather \"{name}\" from catalog: {error}")))?;

        self.feathers.write().expect("feather cache poisoned").remove(name);

        let parents_to_rebuild: Vec<String> = self
            .snapshot()
            .values()
            .filter(|candidate| {
                candidate
                    .properties
                    .iter()
                    .any(|(_, property)| matches!(property, crate::model::Property::Relation(r) if r.parent_of.as_deref() == Some(name)))
            })
            .map(|candidate| candidate.name.clone())
            .collect();

        for parent_name in parents_to_rebuild {
            let parent = self.feathers.read().expect("feather cache poisoned").get(&parent_name).cloned();
            if let Some(parent) = parent {
                reconcile_table(conn, &parent, &parent).await?;
            }
        }

        Ok(())
    }
}

/// When a child feather declares a `childOf` relation, the parent feather
/// must carry a matching `parentOf` descriptor; this injects (or validates
/// the uniqueness of) that counterpart.
fn inject_parent_of_for_child_of(feather: &mut Feather, feathers: &HashMap<String, Feather>) -> Result<()> {
    for (property_name, property) in feather.properties.iter() {
        let crate::model::Property::Relation(relation) = property else {
            continue;
        };
        let Some(parent_name) = &relation.child_of else {
            continue;
        };

        if let Some(parent) = feathers.get(parent_name) {
            let slot_taken = parent.properties.iter().any(|(other_name, other_property)| {
                other_name != property_name
                    && matches!(other_property, crate::model::Property::Relation(r) if r.parent_of.as_deref() == Some(&feather.name))
            });
            if slot_taken {
                return Err(crate::err!(
                    400,
                    message = format!("two properties claim the same parentOf slot on {parent_name}")
                ));
            }
        }
    }

    Ok(())
}

async fn create_table(conn: &mut Connection<'_>, feather: &Feather) -> Result<()> {
    let parent_table = if feather.is_root() {
        None
    } else {
        Some(crate::model::to_snake_case(&feather.inherits))
    };

    let mut columns = Vec::new();
    for (name, property) in feather.properties.iter() {
        columns.extend(column_definitions(name, property));
    }

    let ddl = match parent_table {
        Some(parent) => format!(
            "CREATE TABLE IF NOT EXISTS {} ({}{}) INHERITS ({parent})",
            feather.table_name(),
            if columns.is_empty() { "LIKE ".to_owned() + &parent } else { columns.join(", ") },
            ""
        ),
        None => format!(
            "CREATE TABLE IF NOT EXISTS {} (_pk BIGSERIAL PRIMARY KEY, id TEXT UNIQUE NOT NULL, {})",
            feather.table_name(),
            columns.join(", ")
        ),
    };

    diesel::sql_query(ddl)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to create table for {}: {error}", feather.name)))?;

    Ok(())
}

/// Diffs `next`'s properties against `previous` and applies the column-level
/// changes: drops columns the new spec no longer declares (unless they are
/// `parentOf` markers, which are re-injected), and adds new columns.
async fn reconcile_table(conn: &mut Connection<'_>, previous: &Feather, next: &Feather) -> Result<()> {
    let table = next.table_name();

    for (name, property) in previous.properties.iter() {
        let is_parent_of_marker = matches!(property, crate::model::Property::Relation(r) if r.parent_of.is_some());
        if !next.properties.contains(name) && !is_parent_of_marker {
            for column in column_names(name, property) {
                let statement = format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {column}");
                diesel::sql_query(statement)
                    .execute(conn)
                    .await
                    .map_err(|error| crate::err!(500, message = format!("failed to drop column {column} on {table}: {error}")))?;
            }
        }
    }

    for (name, property) in next.properties.iter() {
        if previous.properties.contains(name) {
            continue;
        }
        for definition in column_definitions(name, property) {
            let statement = format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {definition}");
            diesel::sql_query(statement)
                .execute(conn)
                .await
                .map_err(|error| crate::err!(500, message = format!("failed to add column {definition} on {table}: {error}")))?;
        }
    }

    Ok(())
}

/// The four physical columns a `Money` property expands into, in the order
/// `type_default`'s JSON shape names them. Other scalar formats stay a
/// single column.
fn money_column_suffixes() -> [(&'static str, &'static str); 4] {
    [("amount", "numeric"), ("currency", "text"), ("effective", "timestamptz"), ("base_amount", "numeric")]
}

fn column_names(name: &str, property: &crate::model::Property) -> Vec<String> {
    let column = crate::model::to_snake_case(name);
    match property {
        crate::model::Property::Scalar(scalar) if scalar.format == crate::model::Format::Money => {
            money_column_suffixes().iter().map(|(suffix, _)| format!("{column}_{suffix}")).collect()
        }
        crate::model::Property::Relation(relation) if relation.kind() == crate::model::RelationKind::ToMany => Vec::new(),
        _ => vec![column],
    }
}

fn column_definitions(name: &str, property: &crate::model::Property) -> Vec<String> {
    let column = crate::model::to_snake_case(name);
    match property {
        crate::model::Property::Scalar(scalar) if scalar.format == crate::model::Format::Money => money_column_suffixes()
            .iter()
            .map(|(suffix, db_type)| format!("{column}_{suffix} {db_type}"))
            .collect(),
        crate::model::Property::Scalar(scalar) => {
            let db_type = scalar.format.db_type();
            let required = if scalar.is_required { " NOT NULL" } else { "" };
            vec![format!("{column} {db_type}{required}")]
        }
        crate::model::Property::Relation(relation) => match relation.kind() {
            crate::model::RelationKind::ToOne | crate::model::RelationKind::IsChild => {
                vec![format!("{column} BIGINT DEFAULT -1")]
            }
            crate::model::RelationKind::ToMany => Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Format, Property, ScalarProperty};

    fn feather(name: &str, inherits: &str) -> Feather {
        Feather {
            name: name.to_owned(),
            plural: format!("{name}s"),
            inherits: inherits.to_owned(),
            is_child: false,
            is_system: false,
            is_read_only: false,
            is_fetch_on_startup: false,
            properties: PropertyList::default(),
        }
    }

    #[test]
    fn merged_feather_reports_inherited_fields() {
        let mut feathers = HashMap::new();

        let mut party = feather("Party", "Object");
        party
            .properties
            .insert("name".to_owned(), Property::Scalar(ScalarProperty { format: Format::String, ..Default::default() }));
        feathers.insert("Party".to_owned(), party.clone());

        let mut contact = feather("Contact", "Party");
        contact
            .properties
            .insert("email".to_owned(), Property::Scalar(ScalarProperty { format: Format::String, ..Default::default() }));
        feathers.insert("Contact".to_owned(), contact);
        feathers.insert("Object".to_owned(), feather("Object", "Object"));

        let catalog = Catalog {
            feathers: RwLock::new(feathers),
        };

        let merged = catalog.get_feather("Contact", true).unwrap();
        assert!(merged.properties.contains("name"));
        assert!(merged.properties.contains("email"));
        assert_eq!(merged.properties.get("name").unwrap().inherited_from(), Some("Party"));
        assert_eq!(merged.properties.get("email").unwrap().inherited_from(), None);
    }

    #[test]
    fn unknown_feather_is_not_found() {
        let catalog = Catalog::empty();
        assert!(catalog.get_feather("Nope", true).is_err());
    }
}
