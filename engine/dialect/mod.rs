//! Per-provider SQL synthesis. All dialect-specific syntax is required to live behind
//! this trait (§9 "Dialect divergence") — the find/mutation planners call these methods
//! rather than branching on `AnyKind` themselves.
//!
//! Relation selection is implemented here as a correlated scalar subquery for every
//! provider, including Postgres. The specification's Postgres strategy is a `LEFT JOIN
//! LATERAL`; a correlated subquery in the SELECT list is semantically equivalent and
//! lets one `build_relation_selection` implementation serve all three dialects, at the
//! cost of the query planner optimization a real lateral join can offer Postgres. See
//! DESIGN.md for the open-question record.

use std::sync::Arc;

use qorm_schema::Field;

mod mysql;
mod postgres;
mod sqlite;

/// Capability flags the planners query before emitting a feature that not every
/// backend supports (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_returning: bool,
    pub supports_update_with_limit: bool,
    pub supports_delete_with_limit: bool,
    pub supports_distinct_on: bool,
    pub supports_insert_with_default: bool,
    pub supports_lateral_join: bool,
    pub supports_skip_duplicates: bool,
    pub supports_create_many_and_return: bool,
}

pub trait Dialect: Send + Sync {
    fn kind(&self) -> sqlx::any::AnyKind;
    fn capabilities(&self) -> Capabilities;
    fn json_object_fn(&self) -> &'static str;
    fn json_array_agg_fn(&self) -> &'static str;
    fn empty_array_literal(&self) -> &'static str;

    /// Builds the SQL text for a single relation column: a scalar subquery producing a
    /// JSON object (to-one) or JSON array of objects (to-many), correlated via
    /// `correlation_sql` (the join predicate, e.g. `"child"."authorId" = "parent"."id"`).
    /// `inner_columns_sql` is the already-built, comma-separated `key, value, key, value,
    /// ...` argument list for `json_object_fn`.
    fn build_relation_selection(
        &self,
        child_table_sql: &str,
        child_alias: &str,
        inner_columns_sql: &str,
        correlation_sql: &str,
        extra_where_sql: Option<&str>,
        order_by_sql: Option<&str>,
        limit_sql: Option<&str>,
        is_to_many: bool,
    ) -> String {
        let object_expr = format!("{}({})", self.json_object_fn(), inner_columns_sql);
        let mut where_sql = correlation_sql.to_owned();
        if let Some(extra) = extra_where_sql {
            where_sql.push_str(" AND (");
            where_sql.push_str(extra);
            where_sql.push(')');
        }

        if is_to_many {
            let order = order_by_sql.map(|o| format!(" ORDER BY {o}")).unwrap_or_default();
            format!(
                "COALESCE((SELECT {agg}({obj}) FROM {table} AS {alias} WHERE {clause}{order}), {empty})",
                agg = self.json_array_agg_fn(),
                obj = object_expr,
                table = child_table_sql,
                alias = child_alias,
                clause = where_sql,
                order = order,
                empty = self.empty_array_literal(),
            )
        } else {
            let limit = limit_sql.unwrap_or("LIMIT 1");
            format!(
                "(SELECT {obj} FROM {table} AS {alias} WHERE {clause} {limit})",
                obj = object_expr,
                table = child_table_sql,
                alias = child_alias,
                clause = where_sql,
                limit = limit,
            )
        }
    }

    /// True if `field`'s relation can be expressed with this dialect's capabilities.
    /// Currently always true: relation selection here has no dialect-conditional
    /// feature requirement beyond function-name differences.
    fn supports_relation(&self, _field: &Field) -> bool {
        true
    }
}

pub fn for_kind(kind: sqlx::any::AnyKind) -> Arc<dyn Dialect> {
    match kind {
        sqlx::any::AnyKind::Postgres => Arc::new(postgres::PostgresDialect),
        sqlx::any::AnyKind::MySql => Arc::new(mysql::MySqlDialect),
        sqlx::any::AnyKind::Sqlite => Arc::new(sqlite::SqliteDialect),
        _ => Arc::new(sqlite::SqliteDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_supports_returning_and_lateral_join() {
        let d = for_kind(sqlx::any::AnyKind::Postgres);
        assert!(d.capabilities().supports_returning);
        assert!(d.capabilities().supports_lateral_join);
    }

    #[test]
    fn sqlite_lacks_update_with_limit_and_lateral_join() {
        let d = for_kind(sqlx::any::AnyKind::Sqlite);
        assert!(!d.capabilities().supports_update_with_limit);
        assert!(!d.capabilities().supports_lateral_join);
    }

    #[test]
    fn mysql_rejects_create_many_and_return() {
        let d = for_kind(sqlx::any::AnyKind::MySql);
        assert!(!d.capabilities().supports_create_many_and_return);
    }

    #[test]
    fn to_many_selection_coalesces_to_empty_array() {
        let d = for_kind(sqlx::any::AnyKind::Sqlite);
        let sql = d.build_relation_selection(
            "\"Post\"",
            "p",
            "'title', p.\"title\"",
            "p.\"authorId\" = parent.\"id\"",
            None,
            None,
            None,
            true,
        );
        assert!(sql.starts_with("COALESCE("));
        assert!(sql.contains("JSON_GROUP_ARRAY"));
    }
}
