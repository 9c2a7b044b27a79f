use super::{Capabilities, Dialect};

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> sqlx::any::AnyKind {
        sqlx::any::AnyKind::Postgres
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_returning: true,
            supports_update_with_limit: false,
            supports_delete_with_limit: false,
            supports_distinct_on: true,
            supports_insert_with_default: true,
            supports_lateral_join: true,
            supports_skip_duplicates: true,
            supports_create_many_and_return: true,
        }
    }

    fn json_object_fn(&self) -> &'static str {
        "jsonb_build_object"
    }

    fn json_array_agg_fn(&self) -> &'static str {
        "jsonb_agg"
    }

    fn empty_array_literal(&self) -> &'static str {
        "'[]'::jsonb"
    }
}
