//! SQL primitives shared by `catalog`, `auth`, and `crud`: identifier
//! sanitizing, the filter/sort compiler, and the authorization-join
//! fragment. Grounded in the teacher's `sorts!`/`filters!` query-builder
//! macros (`examples/chat/src/database/query`), generalized here into plain
//! functions because feather columns are runtime data, not a compile-time
//! Diesel schema.

use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{Action, Feather, Format, Property};

pub fn pkcol() -> &'static str {
    "_pk"
}

/// A bound parameter collected while compiling a filter or sort clause.
/// Kept as `Value` so both `sql_query` bind passes and tests can inspect it
/// uniformly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundValue(pub Value);

/// An accumulator threaded through `resolve_path`/`process_sort`/filter
/// compilation: the growing parameter list and the `JOIN` clauses emitted
/// so far (deduplicated by target table).
#[derive(Default)]
pub struct Tokens {
    pub params: Vec<BoundValue>,
    pub joins: Vec<String>,
}

impl Tokens {
    pub fn bind(&mut self, value: Value) -> String {
        self.params.push(BoundValue(value));
        format!("${}", self.params.len())
    }

    fn push_join(&mut self, clause: String) {
        if !self.joins.iter().any(|existing| existing == &clause) {
            self.joins.push(clause);
        }
    }
}

/// Drops keys beginning with `_`, converts remaining snake_case keys to
/// camelCase, and recursively sanitizes nested objects/arrays. Strings and
/// other scalars pass through untouched.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if key.starts_with('_') {
                    continue;
                }
                out.insert(crate::model::to_camel_case(key), sanitize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Resolves a dotted path such as `"parent.child.attr"` against `feather`,
/// emitting one left-outer join per hop and returning a `table.column`
/// reference to the final attribute. Joins already present in `tokens` are
/// not re-emitted.
pub fn resolve_path(dotted: &str, tokens: &mut Tokens, feather: &Feather) -> Result<String> {
    let mut segments = dotted.split('.').peekable();
    let Some(first) = segments.next() else {
        return Err(invalid_argument(format!("empty property path on {}", feather.name)));
    };

    if segments.peek().is_none() {
        if !feather.properties.contains(first) && !crate::model::SYSTEM_COLUMNS.contains(&first) {
            return Err(invalid_argument(format!("{} has no property \"{first}\"", feather.name)));
        }
        return Ok(format!("{}.{}", feather.table_name(), crate::model::to_snake_case(first)));
    }

    let mut current_table = feather.table_name();
    let mut current_feather = feather.clone();
    let mut alias = current_table.clone();

    loop {
        let Some(property) = current_feather.properties.get(first) else {
            return Err(invalid_argument(format!(
                "{} has no property \"{first}\"",
                current_feather.name
            )));
        };

        let Property::Relation(relation) = property else {
            return Err(invalid_argument(format!("\"{first}\" on {} is not a relation", current_feather.name)));
        };

        let target_table = crate::model::to_snake_case(&relation.relation);
        let next_alias = format!("{alias}__{first}");
        tokens.push_join(format!(
            "LEFT OUTER JOIN {target_table} AS {next_alias} ON {alias}.{first} = {next_alias}.{}",
            pkcol()
        ));

        current_table = target_table;
        alias = next_alias;

        let Some(next_segment) = segments.next() else {
            break;
        };

        if segments.peek().is_none() {
            return Ok(format!("{alias}.{next_segment}"));
        }
    }

    let _ = current_table;
    Err(invalid_argument(format!("could not resolve path \"{dotted}\"")))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SortTerm {
    pub property: String,
    #[serde(default)]
    pub order: Option<String>,
}

/// Builds an `ORDER BY` clause, validating each direction and appending
/// `tools.pkcol()` as a final tiebreaker so result order is stable.
pub fn process_sort(sort: &[SortTerm], tokens: &mut Tokens, feather: &Feather) -> Result<String> {
    let mut clauses = Vec::with_capacity(sort.len() + 1);

    for term in sort {
        let direction = match term.order.as_deref().unwrap_or("ASC").to_ascii_uppercase().as_str() {
            "ASC" => "ASC",
            "DESC" => "DESC",
            other => return Err(invalid_argument(format!("unknown sort direction \"{other}\""))),
        };

        let column = resolve_path(&term.property, tokens, feather)?;
        clauses.push(format!("{column} {direction}"));
    }

    clauses.push(format!("{}.{}", feather.table_name(), pkcol()));
    Ok(format!("ORDER BY {}", clauses.join(", ")))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriteriaProperty {
    Single(String),
    Many(Vec<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Criterion {
    pub property: CriteriaProperty,
    #[serde(default)]
    pub operator: Option<String>,
    pub value: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub sort: Vec<SortTerm>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

fn sql_operator(operator: &str) -> Result<&'static str> {
    Ok(match operator {
        "=" => "=",
        "!=" | "<>" => "<>",
        "<" => "<",
        ">" => ">",
        "<=" => "<=",
        ">=" => ">=",
        "~" => "~",
        "~*" => "~*",
        "!~" => "!~",
        "!~*" => "!~*",
        "IN" => "IN",
        other => return Err(invalid_argument(format!("unknown filter operator \"{other}\""))),
    })
}

/// Compiles `filter.criteria` into a `WHERE`-clause fragment (without the
/// leading `WHERE`), binding each value through `tokens`. `property = null`
/// compiles to `IS NULL` rather than `= $n`, matching SQL's null semantics.
pub fn build_criteria_sql(filter: &Filter, tokens: &mut Tokens, feather: &Feather) -> Result<Option<String>> {
    if filter.criteria.is_empty() {
        return Ok(None);
    }

    let mut clauses = Vec::with_capacity(filter.criteria.len());

    for criterion in &filter.criteria {
        let operator = sql_operator(criterion.operator.as_deref().unwrap_or("="))?;
        let properties = match &criterion.property {
            CriteriaProperty::Single(name) => vec![name.clone()],
            CriteriaProperty::Many(names) => names.clone(),
        };

        let mut disjuncts = Vec::with_capacity(properties.len());
        for property in &properties {
            let column = resolve_path(property, tokens, feather)?;
            disjuncts.push(compile_single_criterion(&column, operator, &criterion.value, tokens)?);
        }

        let joined = if disjuncts.len() == 1 {
            disjuncts.remove(0)
        } else {
            format!("({})", disjuncts.join(" OR "))
        };
        clauses.push(joined);
    }

    Ok(Some(clauses.join(" AND ")))
}

fn compile_single_criterion(column: &str, operator: &str, value: &Value, tokens: &mut Tokens) -> Result<String> {
    if value.is_null() && operator == "=" {
        return Ok(format!("{column} IS NULL"));
    }
    if value.is_null() && operator == "<>" {
        return Ok(format!("{column} IS NOT NULL"));
    }

    if operator == "IN" {
        let items = value
            .as_array()
            .ok_or_else(|| invalid_argument("IN operator requires an array value"))?;
        let placeholders: Vec<String> = items.iter().map(|item| tokens.bind(item.clone())).collect();
        return Ok(format!("{column} IN ({})", placeholders.join(", ")));
    }

    let placeholder = tokens.bind(value.clone());
    Ok(format!("{column} {operator} {placeholder}"))
}

/// Returns a `WHERE`-fragment that intersects the candidate row set with
/// the roles the current user transitively belongs to, then subtracts
/// explicit denies, per the authorization-join design. A super-user short
/// circuits to `TRUE` by never calling this at all (callers check first).
pub fn build_auth_sql(action: Action, table: &str, tokens: &mut Tokens, username: &str) -> String {
    let column = action.column();
    let user_param = tokens.bind(Value::String(username.to_owned()));

    format!(
        "{table}.{pk} IN (
            SELECT auth.object_pk FROM auth
            JOIN role_member ON role_member.role = auth.role
            WHERE role_member.member = {user_param} AND auth.{column} = TRUE
        )
        AND {table}.{pk} NOT IN (
            SELECT auth.object_pk FROM auth
            JOIN role_member ON role_member.role = auth.role
            WHERE role_member.member = {user_param} AND auth.{column} = FALSE AND auth.is_inherited = FALSE
        )",
        pk = pkcol(),
    )
}

/// The `{dbType, default}` table for every scalar format, per
/// `tools.formats`/`tools.types`.
pub fn type_info(format: Format) -> (&'static str, Value) {
    (format.db_type(), format.type_default())
}

/// Binds `value` as its JSON text form and returns a SQL expression that
/// casts it to `db_type`. Column types are runtime data here, so a plain
/// `$n` placeholder can't carry a compile-time Diesel `SqlType`; routing
/// every bind through `jsonb` text extraction sidesteps that without
/// resorting to string-interpolated literals for non-identifier values.
pub fn bind_value(tokens: &mut Tokens, value: &Value, db_type: &str) -> String {
    let placeholder = tokens.bind(value.clone());
    if db_type == "jsonb" {
        format!("{placeholder}::jsonb")
    } else {
        format!("({placeholder}::jsonb #>> '{{}}')::{db_type}")
    }
}

/// Boxes `query` and binds every parameter `tokens` collected as its JSON
/// text form. Column types are runtime data, so every placeholder is a
/// `Text` bind that the surrounding SQL casts explicitly with
/// `bind_value`'s `::jsonb #>> '{}'::<type>` expression; `into_boxed`
/// absorbs the otherwise-static arity of Diesel's bind chain.
pub fn bind_tokens<'a>(query: SqlQuery, tokens: Tokens) -> BoxedSqlQuery<'a, Pg, SqlQuery> {
    let mut boxed = query.into_boxed();
    for param in tokens.params {
        boxed = boxed.bind::<Text, _>(param.0.to_string());
    }
    boxed
}

fn invalid_argument(message: impl Into<String>) -> Error {
    crate::err!(400, message = message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PropertyList, ScalarProperty};

    fn contact_feather() -> Feather {
        let mut properties = PropertyList::default();
        properties.insert(
            "lastName".to_owned(),
            Property::Scalar(ScalarProperty {
                format: Format::String,
                is_natural_key: true,
                ..Default::default()
            }),
        );

        Feather {
            name: "Contact".to_owned(),
            plural: "Contacts".to_owned(),
            inherits: "Object".to_owned(),
            is_child: false,
            is_system: false,
            is_read_only: false,
            is_fetch_on_startup: false,
            properties,
        }
    }

    #[test]
    fn sanitize_drops_underscore_keys_and_camel_cases_the_rest() {
        let input = serde_json::json!({ "_pk": 1, "last_name": "Lovelace", "nested": { "first_name": "Ada" } });
        let out = sanitize(&input);
        assert_eq!(
            out,
            serde_json::json!({ "lastName": "Lovelace", "nested": { "firstName": "Ada" } })
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let feather = contact_feather();
        let filter = Filter {
            criteria: vec![Criterion {
                property: CriteriaProperty::Single("lastName".to_owned()),
                operator: Some("LIKE".to_owned()),
                value: Value::String("Lovelace".to_owned()),
            }],
            ..Default::default()
        };

        let mut tokens = Tokens::default();
        assert!(build_criteria_sql(&filter, &mut tokens, &feather).is_err());
    }

    #[test]
    fn null_equality_compiles_to_is_null() {
        let feather = contact_feather();
        let filter = Filter {
            criteria: vec![Criterion {
                property: CriteriaProperty::Single("lastName".to_owned()),
                operator: Some("=".to_owned()),
                value: Value::Null,
            }],
            ..Default::default()
        };

        let mut tokens = Tokens::default();
        let sql = build_criteria_sql(&filter, &mut tokens, &feather).unwrap().unwrap();
        assert_eq!(sql, "contact.lastName IS NULL");
        assert!(tokens.params.is_empty());
    }

    #[test]
    fn sort_appends_pk_tiebreaker() {
        let feather = contact_feather();
        let mut tokens = Tokens::default();
        let sort = vec![SortTerm {
            property: "lastName".to_owned(),
            order: Some("desc".to_owned()),
        }];

        let sql = process_sort(&sort, &mut tokens, &feather).unwrap();
        assert_eq!(sql, "ORDER BY contact.lastName DESC, contact._pk");
    }

    #[test]
    fn unknown_sort_direction_is_rejected() {
        let feather = contact_feather();
        let mut tokens = Tokens::default();
        let sort = vec![SortTerm {
            property: "lastName".to_owned(),
            order: Some("sideways".to_owned()),
        }];

        assert!(process_sort(&sort, &mut tokens, &feather).is_err());
    }
}
