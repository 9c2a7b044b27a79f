use anyhow::{bail, Context, Result};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::Row;

use super::{OutputExpr, Query};
use crate::coerce;
use crate::ctx::DataCtx;

/// Runs `query` and decodes every row through its `output` expression. Fails if the
/// query carries no output (a programmer error in the planner, never a valid input).
pub async fn fetch_all(ctx: &mut DataCtx, query: &Query) -> Result<Vec<serde_json::Value>> {
    let Some(output) = query.output.as_ref() else {
        bail!("cannot fetch rows for a query with no output shape")
    };

    let args = bind_args(query)?;
    let rows = sqlx::query_with(&query.sql_text, args)
        .fetch_all(&mut *ctx.txn)
        .await
        .with_context(|| describe_failure(query))?;

    rows.iter().map(|row| decode_output(row, output)).collect()
}

/// Runs `query` for its side effect (INSERT/UPDATE/DELETE), returning the affected-row
/// count and, where the driver reports one, the last auto-generated id.
pub async fn execute(ctx: &mut DataCtx, query: &Query) -> Result<ExecuteResult> {
    let args = bind_args(query)?;
    let result = sqlx::query_with(&query.sql_text, args)
        .execute(&mut *ctx.txn)
        .await
        .with_context(|| describe_failure(query))?;

    Ok(ExecuteResult {
        rows_affected: result.rows_affected(),
        last_insert_id: result.last_insert_id(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

fn bind_args(query: &Query) -> Result<AnyArguments<'static>> {
    let mut args = AnyArguments::default();
    for param in &query.params {
        coerce::encode_into(&param.repr, param.optional, &param.value, &mut args)?;
    }
    Ok(args)
}

fn decode_output(row: &AnyRow, expr: &OutputExpr) -> Result<serde_json::Value> {
    match expr {
        OutputExpr::Object(fields) => {
            let mut obj = serde_json::Map::with_capacity(fields.len());
            for (name, field_expr) in fields {
                obj.insert(name.clone(), decode_output(row, field_expr)?);
            }
            Ok(serde_json::Value::Object(obj))
        }
        OutputExpr::Field { repr, col_idx, .. } => coerce::decode_column(row, *col_idx, repr),
        OutputExpr::RawJson { col_idx } => {
            let text: Option<String> = row.try_get(*col_idx)?;
            match text {
                Some(text) => serde_json::from_str(&text).context("failed to parse JSON result column"),
                None => Ok(serde_json::Value::Null),
            }
        }
    }
}

fn describe_failure(query: &Query) -> String {
    if cfg!(debug_assertions) {
        format!("query failed: {:?}", query.sql_text)
    } else {
        "query failed".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ColumnRepr;
    use crate::query::{build::QueryBuilder, OutputExpr};
    use sqlx::any::{install_default_drivers, AnyPoolOptions};

    #[tokio::test]
    async fn round_trips_a_row_through_bound_params_and_output_expr() {
        install_default_drivers();
        let pool = AnyPoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id TEXT, n INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let mut ctx = DataCtx::begin(&crate::conn::DataConn::new(
            std::sync::Arc::new(crate::layout::Layout {
                model_tables: Default::default(),
                schema: std::sync::Arc::new(empty_schema()),
            }),
            pool,
        ))
        .await
        .unwrap();

        let mut insert = QueryBuilder::new(sqlx::any::AnyKind::Sqlite);
        insert.sql.write_str("INSERT INTO t (id, n) VALUES (");
        let id_idx = insert.add_param(ColumnRepr::Text, false, serde_json::json!("row-1"));
        insert.sql.write_param(id_idx);
        insert.sql.write_str(", ");
        let n_idx = insert.add_param(ColumnRepr::Int, false, serde_json::json!(42));
        insert.sql.write_param(n_idx);
        insert.sql.write_str(")");
        execute(&mut ctx, &insert.build()).await.unwrap();

        let mut select = QueryBuilder::new(sqlx::any::AnyKind::Sqlite);
        select.sql.write_str("SELECT id, n FROM t");
        select.output(OutputExpr::Object(vec![
            (
                "id".to_owned(),
                OutputExpr::Field {
                    repr: ColumnRepr::Text,
                    optional: false,
                    col_idx: 0,
                },
            ),
            (
                "n".to_owned(),
                OutputExpr::Field {
                    repr: ColumnRepr::Int,
                    optional: false,
                    col_idx: 1,
                },
            ),
        ]));
        let rows = fetch_all(&mut ctx, &select.build()).await.unwrap();
        assert_eq!(rows, vec![serde_json::json!({"id": "row-1", "n": 42})]);
    }

    fn empty_schema() -> qorm_schema::Schema {
        qorm_schema::Schema {
            provider: qorm_schema::Provider {
                type_: qorm_schema::ProviderType::Sqlite,
                default_schema: None,
                schemas: None,
            },
            models: Default::default(),
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }
}
