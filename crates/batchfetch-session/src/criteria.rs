//! Owner-selection criteria for list queries.
//!
//! A [`Criteria`] is rendered once for the list query and the same rendered
//! predicate is stored in the subselect descriptor, so the collection fetch
//! replays exactly what selected the owners.

use batchfetch_core::{Dialect, Value};

/// A predicate over the columns of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Criteria {
    /// No restriction.
    #[default]
    All,
    /// `column = value`
    Eq(&'static str, Value),
    /// `column IN (values...)`
    In(&'static str, Vec<Value>),
    /// Conjunction of predicates.
    And(Vec<Criteria>),
}

impl Criteria {
    /// Match every row.
    #[must_use]
    pub fn all() -> Self {
        Criteria::All
    }

    /// `column = value`
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Criteria::Eq(column, value.into())
    }

    /// `column IN (values...)`. An empty list matches nothing.
    pub fn in_list<V: Into<Value>>(column: &'static str, values: impl IntoIterator<Item = V>) -> Self {
        Criteria::In(column, values.into_iter().map(Into::into).collect())
    }

    /// Combine with another predicate using AND.
    #[must_use]
    pub fn and(self, other: Criteria) -> Self {
        match self {
            Criteria::All => other,
            Criteria::And(mut parts) => {
                parts.push(other);
                Criteria::And(parts)
            }
            first => Criteria::And(vec![first, other]),
        }
    }

    /// Render the predicate, appending bound values to `params`.
    ///
    /// Returns `None` when the criteria does not restrict anything.
    pub fn build_with_dialect(&self, dialect: Dialect, params: &mut Vec<Value>) -> Option<String> {
        match self {
            Criteria::All => None,
            Criteria::Eq(column, value) => {
                params.push(value.clone());
                Some(format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    dialect.placeholder(params.len())
                ))
            }
            Criteria::In(column, values) => {
                if values.is_empty() {
                    return Some("1 = 0".to_string());
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        dialect.placeholder(params.len())
                    })
                    .collect();
                Some(format!(
                    "{} IN ({})",
                    dialect.quote_identifier(column),
                    placeholders.join(", ")
                ))
            }
            Criteria::And(parts) => {
                let rendered: Vec<String> = parts
                    .iter()
                    .filter_map(|part| part.build_with_dialect(dialect, params))
                    .collect();
                match rendered.len() {
                    0 => None,
                    1 => rendered.into_iter().next(),
                    _ => Some(
                        rendered
                            .iter()
                            .map(|part| format!("({part})"))
                            .collect::<Vec<_>>()
                            .join(" AND "),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_renders_nothing() {
        let mut params = Vec::new();
        assert_eq!(Criteria::all().build_with_dialect(Dialect::Postgres, &mut params), None);
        assert!(params.is_empty());
    }

    #[test]
    fn in_list_binds_each_value() {
        let mut params = Vec::new();
        let sql = Criteria::in_list("id", [1_i64, 2, 3])
            .build_with_dialect(Dialect::Postgres, &mut params)
            .unwrap();
        assert_eq!(sql, "\"id\" IN ($1, $2, $3)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let mut params = Vec::new();
        let sql = Criteria::in_list::<i64>("id", [])
            .build_with_dialect(Dialect::Postgres, &mut params)
            .unwrap();
        assert_eq!(sql, "1 = 0");
    }

    #[test]
    fn conjunction_numbers_placeholders_in_order() {
        let mut params = Vec::new();
        let sql = Criteria::eq("name", "ops")
            .and(Criteria::in_list("id", [4_i64, 5]))
            .build_with_dialect(Dialect::Sqlite, &mut params)
            .unwrap();
        assert_eq!(sql, "(\"name\" = ?1) AND (\"id\" IN (?2, ?3))");
        assert_eq!(params[0], Value::Text("ops".to_string()));
    }

    #[test]
    fn all_is_identity_for_and() {
        let criteria = Criteria::all().and(Criteria::eq("id", 1_i64));
        assert_eq!(criteria, Criteria::Eq("id", Value::BigInt(1)));
    }
}
