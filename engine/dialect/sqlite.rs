use super::{Capabilities, Dialect};

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn kind(&self) -> sqlx::any::AnyKind {
        sqlx::any::AnyKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_returning: true,
            supports_update_with_limit: false,
            supports_delete_with_limit: false,
            supports_distinct_on: false,
            supports_insert_with_default: false,
            supports_lateral_join: false,
            supports_skip_duplicates: true,
            supports_create_many_and_return: true,
        }
    }

    fn json_object_fn(&self) -> &'static str {
        "JSON_OBJECT"
    }

    fn json_array_agg_fn(&self) -> &'static str {
        "JSON_GROUP_ARRAY"
    }

    fn empty_array_literal(&self) -> &'static str {
        "'[]'"
    }
}
