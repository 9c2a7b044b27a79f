//! Runs compiled find/mutation plans against a connection, gating bare mutations in
//! their own transaction, folding the plugin chain's `onDriverQuery` hook around every
//! statement sent to the driver, and firing the `onEntityMutation` hook pipeline around
//! each hook-visible mutation step (§4.6).

use std::sync::Arc;

use qorm_schema::ModelName;
use serde_json::Value;

use crate::conn::DataConn;
use crate::ctx::{DataCtx, IsolationLevel};
use crate::error::{EngineError, Result};
use crate::find::{self, FindPlan};
use crate::mutate::{HookMeta, MutationPlan};
use crate::plugin::{MutationKind, MutationWhen, PluginChain};
use crate::query::exec;
use crate::query::Query;

/// The default isolation level for a mutation that auto-begins its own transaction
/// (one not wrapped in an explicit `$transaction` block), per provider (§4.6).
fn default_isolation(conn: &DataConn) -> IsolationLevel {
    match conn.kind() {
        sqlx::any::AnyKind::Postgres => IsolationLevel::ReadCommitted,
        sqlx::any::AnyKind::MySql => IsolationLevel::RepeatableRead,
        _ => IsolationLevel::Serializable,
    }
}

/// A mutation's net effect: how many rows it touched, plus whichever rows a
/// `RETURNING`/fallback-select step actually recovered (used by `createManyAndReturn`/
/// `updateManyAndReturn`; most callers only need `affected`).
#[derive(Debug, Default)]
pub struct MutationOutcome {
    pub affected: u64,
    pub rows: Vec<Value>,
}

/// One `onEntityMutation` after-hook invocation deferred until the surrounding
/// transaction actually commits (§4.6: "registered as commit callbacks and run only if
/// the outer transaction commits").
pub struct PendingAfterHook {
    model_name: ModelName,
    kind: MutationKind,
    row: Value,
}

pub struct Executor {
    conn: DataConn,
    plugins: Arc<PluginChain>,
}

impl Executor {
    pub fn new(conn: DataConn, plugins: Arc<PluginChain>) -> Self {
        Self { conn, plugins }
    }

    /// Opens a transaction at the default isolation level and hands it to the caller,
    /// for use by `$transaction`'s interactive form.
    pub async fn begin(&self) -> Result<DataCtx> {
        DataCtx::begin_with_isolation(&self.conn, default_isolation(&self.conn))
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    /// Runs a read-only find operation in its own short-lived transaction.
    pub async fn find_many(&self, model_name: &ModelName, args: &Value) -> Result<Vec<Value>> {
        let dialect = self.conn.dialect();
        let plan = find::plan_find(&self.conn.layout.schema, &self.conn.layout, dialect.as_ref(), model_name, args)?;
        let mut ctx = DataCtx::begin(&self.conn).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        let rows = self.run_find(&mut ctx, model_name, &plan).await;
        match &rows {
            Ok(_) => ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?,
            Err(_) => {
                let _ = ctx.rollback().await;
            }
        }
        let mut rows = rows?;
        if plan.reverse_rows {
            rows.reverse();
        }
        Ok(rows)
    }

    async fn run_find(&self, ctx: &mut DataCtx, model_name: &ModelName, plan: &FindPlan) -> Result<Vec<Value>> {
        self.fetch_rows(ctx, model_name, &plan.query).await
    }

    /// Runs a read-only find operation against an already-open context, for use inside
    /// an interactive `$transaction` block so reads observe the block's own uncommitted
    /// writes instead of opening a separate transaction.
    pub async fn find_many_in(&self, ctx: &mut DataCtx, model_name: &ModelName, args: &Value) -> Result<Vec<Value>> {
        let dialect = self.conn.dialect();
        let plan = find::plan_find(&self.conn.layout.schema, &self.conn.layout, dialect.as_ref(), model_name, args)?;
        let mut rows = self.run_find(ctx, model_name, &plan).await?;
        if plan.reverse_rows {
            rows.reverse();
        }
        Ok(rows)
    }

    /// Runs an already-compiled read-only query (`count`/`aggregate`/`groupBy`) in its
    /// own short-lived transaction. Unlike `find_many`, the caller has already applied
    /// any row-order postprocessing the plan needs, since those planners have no
    /// `reverse_rows` obligation.
    pub async fn run_query(&self, model_name: &ModelName, query: &Query) -> Result<Vec<Value>> {
        let mut ctx = DataCtx::begin(&self.conn).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        let rows = self.fetch_rows(&mut ctx, model_name, query).await;
        match &rows {
            Ok(_) => ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?,
            Err(_) => {
                let _ = ctx.rollback().await;
            }
        }
        rows
    }

    /// Runs a mutation outside of an explicit `$transaction`: opens its own transaction,
    /// runs every planned step in order, and commits, rolling back on the first failure.
    /// After-hooks queued during the run fire only once the commit has actually
    /// succeeded.
    pub async fn run_mutation(&self, model_name: &ModelName, plan: &MutationPlan) -> Result<MutationOutcome> {
        let mut ctx = self.begin().await?;
        let (outcome, after_hooks) = match self.run_mutation_steps(&mut ctx, model_name, plan).await {
            Ok(v) => v,
            Err(e) => {
                let _ = ctx.rollback().await;
                return Err(e);
            }
        };
        ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?;
        self.flush_after_hooks(after_hooks)?;
        Ok(outcome)
    }

    /// Runs `plan`'s steps against an already-open context, for use inside an
    /// interactive `$transaction` block where the caller owns the commit/rollback. The
    /// caller is responsible for flushing the returned after-hooks once (and only if)
    /// the surrounding transaction commits.
    pub async fn run_mutation_steps(&self, ctx: &mut DataCtx, model_name: &ModelName, plan: &MutationPlan) -> Result<(MutationOutcome, Vec<PendingAfterHook>)> {
        let mut affected = 0u64;
        let mut rows = Vec::new();
        let mut after_hooks = Vec::new();

        for step in &plan.steps {
            if let Some(meta) = &step.hook {
                if !ctx.hooks_suppressed {
                    if let Some(pre_image) = &step.pre_image {
                        let pre_rows = self.fetch_rows(ctx, model_name, pre_image).await?;
                        for row in pre_rows {
                            self.fire_hook(ctx, meta, MutationWhen::Before, row)?;
                        }
                    }
                }
            }

            let sql = self.plugins.on_driver_query(model_name, &step.query.sql_text);
            let query = Query {
                sql_text: sql,
                params: clone_params(&step.query.params),
                output: clone_output(step.query.output.as_ref()),
            };

            let step_rows = if step.returns_rows {
                let fetched = exec::fetch_all(ctx, &query)
                    .await
                    .map_err(|e| EngineError::db_query(query.sql_text.clone(), Vec::new(), e))?;
                affected += fetched.len() as u64;
                fetched
            } else {
                let result = exec::execute(ctx, &query)
                    .await
                    .map_err(|e| EngineError::db_query(query.sql_text.clone(), Vec::new(), e))?;
                affected += result.rows_affected;
                match &step.after_select {
                    Some(after_select) => self.fetch_rows(ctx, model_name, after_select).await?,
                    None => Vec::new(),
                }
            };

            if let Some(meta) = &step.hook {
                if !ctx.hooks_suppressed {
                    // A DELETE that used RETURNING has no separate pre-image select (see
                    // `mutate::push_own_delete_step`): the returned rows serve as both
                    // the before- and after-image, since the row is still recoverable by
                    // rolling back this same transaction.
                    if step.pre_image.is_none() && meta.kind == MutationKind::Delete {
                        for row in &step_rows {
                            self.fire_hook(ctx, meta, MutationWhen::Before, row.clone())?;
                        }
                    }
                    for row in &step_rows {
                        after_hooks.push(PendingAfterHook {
                            model_name: meta.model_name.clone(),
                            kind: meta.kind,
                            row: row.clone(),
                        });
                    }
                }
            }
            rows.extend(step_rows);
        }

        Ok((MutationOutcome { affected, rows }, after_hooks))
    }

    /// Flushes after-hooks queued by one or more `run_mutation_steps` calls. Callers
    /// (`run_mutation`, `$transaction`'s sequential and interactive forms) must only
    /// call this once the transaction the hooks were queued under has committed.
    pub fn flush_after_hooks(&self, hooks: Vec<PendingAfterHook>) -> Result<()> {
        for hook in hooks {
            self.plugins
                .on_entity_mutation(&hook.model_name, hook.kind, MutationWhen::After, hook.row)
                .map_err(EngineError::MutationRejected)?;
        }
        Ok(())
    }

    fn fire_hook(&self, ctx: &mut DataCtx, meta: &HookMeta, when: MutationWhen, row: Value) -> Result<()> {
        ctx.hooks_suppressed = true;
        let result = self.plugins.on_entity_mutation(&meta.model_name, meta.kind, when, row);
        ctx.hooks_suppressed = false;
        result.map(|_| ()).map_err(EngineError::MutationRejected)
    }

    async fn fetch_rows(&self, ctx: &mut DataCtx, model_name: &ModelName, plan_query: &Query) -> Result<Vec<Value>> {
        let sql = self.plugins.on_driver_query(model_name, &plan_query.sql_text);
        let query = Query {
            sql_text: sql,
            params: clone_params(&plan_query.params),
            output: clone_output(plan_query.output.as_ref()),
        };
        exec::fetch_all(ctx, &query)
            .await
            .map_err(|e| EngineError::db_query(query.sql_text.clone(), Vec::new(), e))
    }
}

use crate::query::{BoundParam, OutputExpr};

fn clone_params(params: &[BoundParam]) -> Vec<BoundParam> {
    params
        .iter()
        .map(|p| BoundParam {
            repr: p.repr.clone(),
            optional: p.optional,
            value: p.value.clone(),
        })
        .collect()
}

fn clone_output(output: Option<&OutputExpr>) -> Option<OutputExpr> {
    output.map(clone_output_expr)
}

fn clone_output_expr(expr: &OutputExpr) -> OutputExpr {
    match expr {
        OutputExpr::Object(fields) => {
            OutputExpr::Object(fields.iter().map(|(name, e)| (name.clone(), clone_output_expr(e))).collect())
        }
        OutputExpr::Field { repr, optional, col_idx } => OutputExpr::Field {
            repr: repr.clone(),
            optional: *optional,
            col_idx: *col_idx,
        },
        OutputExpr::RawJson { col_idx } => OutputExpr::RawJson { col_idx: *col_idx },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::mutate;
    use crate::plugin::Plugin;
    use qorm_schema::{Field, FieldName, FieldType, Model, Provider, ProviderType, ScalarType};
    use sqlx::any::{install_default_drivers, AnyPoolOptions};

    fn user_schema() -> qorm_schema::Schema {
        let id = Arc::new(Field {
            name: FieldName::from("id"),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id: true,
            unique: false,
            updated_at: false,
            default: None,
            relation: None,
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
        let name = Arc::new(Field {
            name: FieldName::from("name"),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id: false,
            unique: false,
            updated_at: false,
            default: None,
            relation: None,
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
        let mut fields = indexmap::IndexMap::new();
        fields.insert(id.name.clone(), id);
        fields.insert(name.name.clone(), name);
        let model = Arc::new(Model {
            name: ModelName::from("User"),
            fields,
            attributes: Vec::new(),
            id_fields: vec![FieldName::from("id")],
            unique_keys: Default::default(),
            computed_fields: Default::default(),
            virtual_fields: Default::default(),
            base_model: None,
            db_table: None,
            db_schema: None,
        });
        let mut models = indexmap::IndexMap::new();
        models.insert(model.name.clone(), model);
        qorm_schema::Schema {
            provider: Provider { type_: ProviderType::Sqlite, default_schema: None, schemas: None },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    async fn fresh_conn() -> (DataConn, Arc<qorm_schema::Schema>, Arc<Layout>) {
        install_default_drivers();
        let schema = Arc::new(user_schema());
        let layout = Arc::new(Layout::build(schema.clone()));
        let pool = AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let conn = DataConn::new(layout.clone(), pool);
        let mut ctx = DataCtx::begin(&conn).await.unwrap();
        sqlx::query("CREATE TABLE \"User\" (id TEXT PRIMARY KEY, name TEXT)")
            .execute(&mut *ctx.txn)
            .await
            .unwrap();
        ctx.commit().await.unwrap();
        (conn, schema, layout)
    }

    async fn fresh_executor() -> (Executor, Arc<qorm_schema::Schema>, Arc<Layout>) {
        let (conn, schema, layout) = fresh_conn().await;
        (Executor::new(conn, Arc::new(PluginChain::new())), schema, layout)
    }

    #[tokio::test]
    async fn create_runs_inside_its_own_transaction_and_reports_affected_rows() {
        let (executor, schema, layout) = fresh_executor().await;
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let data = serde_json::json!({"id": "u1", "name": "Ada"});
        let plan = mutate::plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &data).unwrap();
        let outcome = executor.run_mutation(&ModelName::from("User"), &plan).await.unwrap();
        assert_eq!(outcome.affected, 1);
    }

    #[tokio::test]
    async fn a_before_hook_that_rejects_rolls_back_and_surfaces_mutation_rejected() {
        struct Reject;
        impl Plugin for Reject {
            fn on_entity_mutation(&self, _m: &ModelName, _k: MutationKind, when: MutationWhen, row: Value) -> std::result::Result<Value, String> {
                match when {
                    MutationWhen::Before => Err("vetoed".to_owned()),
                    MutationWhen::After => Ok(row),
                }
            }
        }
        let (conn, schema, layout) = fresh_conn().await;
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let plain = Executor::new(conn.clone(), Arc::new(PluginChain::new()));
        let create = mutate::plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &serde_json::json!({"id": "u1", "name": "Ada"}))
            .unwrap();
        plain.run_mutation(&ModelName::from("User"), &create).await.unwrap();

        let mut chain = PluginChain::new();
        chain.use_plugin("reject", Arc::new(Reject));
        let guarded = Executor::new(conn, Arc::new(chain));
        let update = mutate::plan_update(
            &schema,
            &layout,
            dialect.as_ref(),
            &ModelName::from("User"),
            &serde_json::json!({"id": "u1"}),
            &serde_json::json!({"name": "Grace"}),
        )
        .unwrap();
        let err = guarded.run_mutation(&ModelName::from("User"), &update).await.unwrap_err();
        assert!(matches!(err, EngineError::MutationRejected(_)));

        let rows = plain.find_many(&ModelName::from("User"), &serde_json::json!({"where": {"id": "u1"}})).await.unwrap();
        assert_eq!(rows[0]["name"], serde_json::json!("Ada"));
    }
}
