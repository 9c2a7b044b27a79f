use super::{Capabilities, Dialect};

/// MySQL shares SQLite's correlated-subquery relation strategy (no lateral join
/// support) but names its JSON functions differently and rejects a handful of
/// operations outright (§4.2, §4.5 step 9).
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn kind(&self) -> sqlx::any::AnyKind {
        sqlx::any::AnyKind::MySql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_returning: false,
            supports_update_with_limit: true,
            supports_delete_with_limit: true,
            supports_distinct_on: false,
            supports_insert_with_default: false,
            supports_lateral_join: false,
            supports_skip_duplicates: false,
            supports_create_many_and_return: false,
        }
    }

    fn json_object_fn(&self) -> &'static str {
        "JSON_OBJECT"
    }

    fn json_array_agg_fn(&self) -> &'static str {
        "JSON_ARRAYAGG"
    }

    fn empty_array_literal(&self) -> &'static str {
        "JSON_ARRAY()"
    }
}
