//! Per-model CRUD surface plus the `$`-prefixed client-level operations: `$transaction`,
//! `$use`/`$unuse`/`$unuseAll`, `$setAuth`/`$setOptions`/`$setInputValidation`,
//! `$connect`/`$disconnect`, raw SQL escape hatches (`$executeRaw`/`$queryRaw`/`$qbRaw`),
//! `$procs.<name>`, and `$pushSchema` (§4.9, §6).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use qorm_schema::{ModelName, Procedure, Schema};
use serde_json::Value;

use crate::conn::DataConn;
use crate::ctx::DataCtx;
use crate::error::{EngineError, Result};
use crate::executor::Executor;
use crate::find;
use crate::layout::Layout;
use crate::mutate;
use crate::plugin::{Plugin, PluginChain};
use crate::pusher;
use crate::result::{self, VirtualFieldRegistry};
use crate::validate::{Operation, Validator};

/// A registered `$procs.<name>` handler. Takes the already-validated `{args: ...}`
/// payload's inner value (or `Value::Null` when the procedure declares no params) and
/// returns its result, or an error message a plugin's `onProcedure` veto or the handler
/// itself produced.
pub type ProcedureHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

/// Runtime-mutable state that sits outside the immutable [`Schema`]: the active plugin
/// chain, registered procedure handlers and virtual-field resolvers, and the caller's
/// auth/options context, all changeable at any point in the client's lifetime without
/// reconstructing it (§4.9 "$use/$setAuth are not schema data").
struct ClientState {
    auth: Option<Value>,
    options: Value,
    input_validation_enabled: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            auth: None,
            options: Value::Object(Default::default()),
            input_validation_enabled: true,
        }
    }
}

pub struct Client {
    schema: Arc<Schema>,
    layout: Arc<Layout>,
    conn: DataConn,
    validator: Validator,
    plugins: RwLock<Arc<PluginChain>>,
    state: RwLock<ClientState>,
    procedures: RwLock<HashMap<String, ProcedureHandler>>,
    virtual_fields: RwLock<Arc<VirtualFieldRegistry>>,
}

impl Client {
    pub fn connect(schema: Arc<Schema>, pool: sqlx::AnyPool) -> Self {
        let layout = Arc::new(Layout::build(schema.clone()));
        let conn = DataConn::new(layout.clone(), pool);
        Self {
            validator: Validator::new(schema.clone()),
            schema,
            layout,
            conn,
            plugins: RwLock::new(Arc::new(PluginChain::new())),
            state: RwLock::new(ClientState::default()),
            procedures: RwLock::new(HashMap::new()),
            virtual_fields: RwLock::new(Arc::new(VirtualFieldRegistry::new())),
        }
    }

    pub async fn disconnect(&self) {
        self.conn.pool.close().await;
    }

    fn executor(&self) -> Executor {
        let plugins = self.plugins.read().expect("plugin chain lock poisoned").clone();
        Executor::new(self.conn.clone(), plugins)
    }

    /// `$use`: appends a plugin to the active chain under `name`. Rebuilds the chain
    /// rather than mutating it in place, since it is shared via `Arc` with any executor
    /// an in-flight request already holds a reference to.
    pub fn use_plugin(&self, name: impl Into<String>, plugin: Arc<dyn Plugin>) {
        let mut guard = self.plugins.write().expect("plugin chain lock poisoned");
        let mut next = guard.clone_chain();
        next.use_plugin(name, plugin);
        *guard = Arc::new(next);
    }

    /// `$unuse`: removes a plugin by name. Returns whether one was found.
    pub fn unuse(&self, name: &str) -> bool {
        let mut guard = self.plugins.write().expect("plugin chain lock poisoned");
        let mut next = (*guard).clone_chain();
        let found = next.unuse(name);
        *guard = Arc::new(next);
        found
    }

    /// `$unuseAll`: clears the plugin chain.
    pub fn unuse_all(&self) {
        let mut guard = self.plugins.write().expect("plugin chain lock poisoned");
        *guard = Arc::new(PluginChain::new());
    }

    /// `$setAuth`: sets the auth context later hook invocations, virtual-field
    /// resolvers, and policy expressions (once implemented) read.
    pub fn set_auth(&self, auth: Option<Value>) {
        self.state.write().expect("client state lock poisoned").auth = auth;
    }

    pub fn auth(&self) -> Option<Value> {
        self.state.read().expect("client state lock poisoned").auth.clone()
    }

    /// `$setOptions`: merges `options` into the client's current option set.
    pub fn set_options(&self, options: Value) {
        let mut state = self.state.write().expect("client state lock poisoned");
        if let (Value::Object(existing), Value::Object(incoming)) = (&mut state.options, options) {
            existing.extend(incoming);
        } else {
            state.options = options;
        }
    }

    pub fn options(&self) -> Value {
        self.state.read().expect("client state lock poisoned").options.clone()
    }

    /// `$setInputValidation`: enables or disables structural payload validation. Off by
    /// default for no client, but every client starts with it enabled; callers that
    /// trust their own payloads (e.g. a layer that already validated against a GraphQL
    /// schema) can disable it to skip the duplicate work.
    pub fn set_input_validation(&self, enabled: bool) {
        self.state.write().expect("client state lock poisoned").input_validation_enabled = enabled;
    }

    fn validate(&self, operation: Operation, model_name: &ModelName, payload: &Value) -> Result<Value> {
        if !self.state.read().expect("client state lock poisoned").input_validation_enabled {
            return Ok(payload.clone());
        }
        self.validator.validate(operation, model_name, payload)
    }

    /// Registers the handler invoked for `$procs.<name>`. There is no handler field on
    /// the schema's [`Procedure`] declaration itself (params/returnType only); a handler
    /// must be registered at runtime, the same way a plugin is, before `call_procedure`
    /// can resolve it.
    pub fn register_procedure<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let handler = Arc::new(move |args: Value| Box::pin(handler(args)) as BoxFuture<'static, std::result::Result<Value, String>>);
        self.procedures.write().expect("procedure registry lock poisoned").insert(name.into(), handler);
    }

    /// Registers the computation callback for `model.field`, a virtual field with no
    /// stored or computed value of its own (§4.7).
    pub fn register_virtual_field<F>(&self, model: impl Into<String>, field: impl Into<String>, resolver: F)
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mut guard = self.virtual_fields.write().expect("virtual field registry lock poisoned");
        let mut next = (**guard).clone();
        next.register(ModelName::from(model.into().as_str()), qorm_schema::FieldName::from(field.into().as_str()), Arc::new(resolver));
        *guard = Arc::new(next);
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn model_name(name: &str) -> ModelName {
        ModelName::from(name)
    }

    pub async fn find_many(&self, model: &str, args: Value) -> Result<Vec<Value>> {
        let model_name = Self::model_name(model);
        let args = self.plugins().on_query(&model_name, args);
        let args = self.validate(Operation::FindMany, &model_name, &args)?;
        let rows = self.executor().find_many(&model_name, &args).await?;
        self.finalize(&model_name, rows, false)
    }

    fn finalize(&self, model_name: &ModelName, rows: Vec<Value>, reverse: bool) -> Result<Vec<Value>> {
        let model = self.schema.model(model_name).map_err(|e| EngineError::Internal(e.to_string()))?;
        let virtual_fields = self.virtual_fields.read().expect("virtual field registry lock poisoned").clone();
        let auth = self.auth().unwrap_or(Value::Null);
        result::finalize_rows(&self.schema, model, rows, reverse, &virtual_fields, &auth)
    }

    pub async fn find_first(&self, model: &str, mut args: Value) -> Result<Option<Value>> {
        cap_take_one(&mut args);
        let rows = self.find_many(model, args).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn find_first_or_throw(&self, model: &str, args: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let row = self.find_first(model, args).await?;
        row.ok_or_else(|| EngineError::not_found(model_name.0))
    }

    pub async fn find_unique(&self, model: &str, args: Value) -> Result<Option<Value>> {
        let model_name = Self::model_name(model);
        let model_def = self.schema.model(&model_name).map_err(|e| EngineError::Internal(e.to_string()))?;
        if let Some(where_) = args.get("where") {
            find::validate_unique_where(model_def, where_)?;
        } else {
            return Err(EngineError::input_validation("$.where", "findUnique requires where"));
        }
        let rows = self.find_many(model, args).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn find_unique_or_throw(&self, model: &str, args: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let row = self.find_unique(model, args).await?;
        row.ok_or_else(|| EngineError::not_found(model_name.0))
    }

    pub async fn create(&self, model: &str, data: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let payload = serde_json::json!({"data": data});
        let payload = self.plugins().on_query(&model_name, payload);
        let payload = self.validate(Operation::Create, &model_name, &payload)?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);

        let dialect = self.conn.dialect();
        let plan = mutate::plan_create(&self.schema, &self.layout, dialect.as_ref(), &model_name, &data)?;
        self.executor().run_mutation(&model_name, &plan).await?;

        let id_filter = unique_filter_from_row(&self.schema, &model_name, &data)?;
        self.find_unique_or_throw(model, serde_json::json!({"where": id_filter})).await
    }

    pub async fn create_many(&self, model: &str, args: Value) -> Result<u64> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::CreateMany, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let plan = mutate::plan_create_many(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        Ok(outcome.affected)
    }

    pub async fn create_many_and_return(&self, model: &str, args: Value) -> Result<Vec<Value>> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::CreateManyAndReturn, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let plan = mutate::plan_create_many_and_return(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        self.finalize(&model_name, outcome.rows, false)
    }

    pub async fn update(&self, model: &str, where_: Value, data: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let payload = serde_json::json!({"where": where_, "data": data});
        let payload = self.validate(Operation::Update, &model_name, &payload)?;
        let where_ = payload.get("where").cloned().unwrap_or(Value::Null);
        let data = payload.get("data").cloned().unwrap_or(Value::Null);

        let dialect = self.conn.dialect();
        let plan = mutate::plan_update(&self.schema, &self.layout, dialect.as_ref(), &model_name, &where_, &data)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        if outcome.affected == 0 {
            return Err(EngineError::not_found(model_name.0));
        }
        self.find_unique_or_throw(model, serde_json::json!({"where": where_})).await
    }

    pub async fn update_many(&self, model: &str, args: Value) -> Result<u64> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::UpdateMany, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let plan = mutate::plan_update_many(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        Ok(outcome.affected)
    }

    pub async fn update_many_and_return(&self, model: &str, args: Value) -> Result<Vec<Value>> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::UpdateManyAndReturn, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let plan = mutate::plan_update_many_and_return(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        self.finalize(&model_name, outcome.rows, false)
    }

    /// `upsert`: creates the row if `where` misses, otherwise updates it. IDs are always
    /// caller-supplied in this implementation, so `create`'s payload already carries the
    /// identity `where` names and the planner needs no round trip to decide which branch
    /// applies at the database level — `plan_upsert` compiles both branches into one
    /// `INSERT ... ON CONFLICT DO UPDATE`-shaped step (or its dialect equivalent).
    pub async fn upsert(&self, model: &str, where_: Value, create: Value, update: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let payload = serde_json::json!({"where": where_, "create": create, "data": update});
        let payload = self.validate(Operation::Upsert, &model_name, &payload)?;
        let where_ = payload.get("where").cloned().unwrap_or(Value::Null);
        let create = payload.get("create").cloned().unwrap_or(Value::Null);
        let update = payload.get("data").cloned().unwrap_or(Value::Null);

        let dialect = self.conn.dialect();
        let plan = mutate::plan_upsert(&self.schema, &self.layout, dialect.as_ref(), &model_name, &where_, &create, &update)?;
        self.executor().run_mutation(&model_name, &plan).await?;
        self.find_unique_or_throw(model, serde_json::json!({"where": where_})).await
    }

    pub async fn delete(&self, model: &str, where_: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let found = self.find_unique_or_throw(model, serde_json::json!({"where": where_.clone()})).await?;
        let dialect = self.conn.dialect();
        let plan = mutate::plan_delete(&self.schema, &self.layout, &model_name, dialect.as_ref(), &where_)?;
        self.executor().run_mutation(&model_name, &plan).await?;
        Ok(found)
    }

    pub async fn delete_many(&self, model: &str, args: Value) -> Result<u64> {
        let model_name = Self::model_name(model);
        let dialect = self.conn.dialect();
        let plan = mutate::plan_delete_many(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let outcome = self.executor().run_mutation(&model_name, &plan).await?;
        Ok(outcome.affected)
    }

    pub async fn count(&self, model: &str, args: Value) -> Result<u64> {
        let rows = self.find_many(model, strip_selection(args)).await?;
        Ok(rows.len() as u64)
    }

    /// `aggregate`: `AVG`/`SUM`/`MIN`/`MAX`/`COUNT` projections over the matching rows,
    /// collapsing to the single summary row the client-surface table describes (§4.3,
    /// §4.9).
    pub async fn aggregate(&self, model: &str, args: Value) -> Result<Value> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::Aggregate, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let query = find::plan_aggregate(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        let mut rows = self.executor().run_query(&model_name, &query).await?;
        Ok(rows.pop().unwrap_or(Value::Null))
    }

    /// `groupBy`: one row per distinct combination of `by` fields, with `having` over
    /// the aggregate expressions and `orderBy` restricted to `by` fields (§4.3).
    pub async fn group_by(&self, model: &str, args: Value) -> Result<Vec<Value>> {
        let model_name = Self::model_name(model);
        let args = self.validate(Operation::GroupBy, &model_name, &args)?;
        let dialect = self.conn.dialect();
        let query = find::plan_group_by(&self.schema, &self.layout, dialect.as_ref(), &model_name, &args)?;
        self.executor().run_query(&model_name, &query).await
    }

    pub async fn exists(&self, model: &str, where_: Value) -> Result<bool> {
        let mut args = serde_json::json!({"where": where_, "take": 1});
        cap_take_one(&mut args);
        let rows = self.find_many(model, args).await?;
        Ok(!rows.is_empty())
    }

    /// `$procs.<name>(input?)`: validates `{args: {...}}` against the procedure's
    /// declared params (unknown/missing args rejected; the payload may be omitted
    /// entirely when every param is optional), wraps the call through `onProcedure`,
    /// and invokes the registered handler. Raises [`EngineError::Config`] if no handler
    /// was registered for `name` — the schema knows the procedure's shape but never its
    /// implementation (§4.9).
    pub async fn call_procedure(&self, name: &str, payload: Option<Value>) -> Result<Value> {
        let procedure = self
            .schema
            .procedures
            .get(name)
            .ok_or_else(|| EngineError::not_supported(format!("no procedure named {name:?}")))?;
        let input = validate_procedure_args(procedure, payload)?;
        let input = self.plugins().on_procedure(name, input).map_err(EngineError::MutationRejected)?;

        let handler = self
            .procedures
            .read()
            .expect("procedure registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no handler registered for procedure {name:?}")))?;
        handler(input).await.map_err(EngineError::MutationRejected)
    }

    /// `$executeRaw`: runs arbitrary SQL outside the planner, binding each parameter by
    /// its own JSON type (string/number/bool/null) rather than through a declared
    /// column representation, since raw SQL carries no schema to look one up from.
    pub async fn execute_raw(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let mut ctx = DataCtx::begin(&self.conn).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        let args = raw_args(&params);
        let result = sqlx::query_with(sql, args)
            .execute(&mut *ctx.txn)
            .await
            .map_err(|e| EngineError::db_query(sql.to_owned(), Vec::new(), e.into()))?;
        ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// `$queryRaw`: runs arbitrary SQL outside the planner and decodes every column of
    /// every row as a JSON value via the driver's native type, without a declared
    /// `OutputExpr` shape (the caller has no schema to validate against for raw SQL).
    pub async fn query_raw(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        let mut ctx = DataCtx::begin(&self.conn).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        let rows = raw_query_rows(&mut ctx, sql, params).await?;
        ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(rows)
    }

    /// `$qbRaw`: this implementation has no separate query-builder AST to assemble and
    /// inspect before execution, so `$qbRaw` is simply an alias onto the same raw-SQL
    /// passthrough `$queryRaw` uses (§4.9: "maps onto raw-SQL passthrough").
    pub async fn qb_raw(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        self.query_raw(sql, params).await
    }

    /// `$pushSchema`: applies every model's table (and, on Postgres, every declared
    /// schema and enum type) as `CREATE ... IF NOT EXISTS` DDL.
    pub async fn push_schema(&self) -> Result<()> {
        let dialect = self.conn.dialect();
        let statements = pusher::plan_push(&self.schema, &self.layout, dialect.as_ref())?;
        let mut ctx = DataCtx::begin(&self.conn).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        for sql in statements {
            sqlx::query(&sql)
                .execute(&mut *ctx.txn)
                .await
                .map_err(|e| EngineError::db_query(sql, Vec::new(), e.into()))?;
        }
        ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(())
    }

    /// `$transaction`'s sequential form: runs a fixed list of pre-built operations (each
    /// produced by one of this client's mutation-planning helpers) inside one
    /// transaction, flushing every after-hook queued across the whole list exactly once,
    /// after the single commit succeeds.
    pub async fn transaction_sequential(&self, models_and_plans: Vec<(ModelName, mutate::MutationPlan)>) -> Result<Vec<u64>> {
        let executor = self.executor();
        let mut ctx = executor.begin().await?;
        let mut results = Vec::with_capacity(models_and_plans.len());
        let mut all_after_hooks = Vec::new();
        for (model_name, plan) in &models_and_plans {
            match executor.run_mutation_steps(&mut ctx, model_name, plan).await {
                Ok((outcome, after_hooks)) => {
                    results.push(outcome.affected);
                    all_after_hooks.extend(after_hooks);
                }
                Err(e) => {
                    let _ = ctx.rollback().await;
                    return Err(e);
                }
            }
        }
        ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?;
        executor.flush_after_hooks(all_after_hooks)?;
        Ok(results)
    }

    /// `$transaction`'s interactive form: opens a transaction (§4.6's default isolation
    /// per provider) and hands the caller a [`TransactionClient`] bound to it, so every
    /// operation the callback performs through it runs inside the same transaction
    /// instead of opening its own. Commits and flushes queued after-hooks if the
    /// callback returns `Ok`; rolls back (dropping the queued hooks) otherwise.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TransactionClient<'_>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let executor = self.executor();
        let mut ctx = executor.begin().await?;
        let after_hooks = Arc::new(std::sync::Mutex::new(Vec::new()));
        let txn_client = TransactionClient { client: self, executor: &executor, ctx: &mut ctx, after_hooks: after_hooks.clone() };
        let result = f(txn_client).await;
        match &result {
            Ok(_) => ctx.commit().await.map_err(|e| EngineError::Internal(e.to_string()))?,
            Err(_) => {
                let _ = ctx.rollback().await;
            }
        }
        if result.is_ok() {
            let hooks = std::mem::take(&mut *after_hooks.lock().expect("after-hooks lock poisoned"));
            executor.flush_after_hooks(hooks)?;
        }
        result
    }

    fn plugins(&self) -> Arc<PluginChain> {
        self.plugins.read().expect("plugin chain lock poisoned").clone()
    }
}

/// A client handle bound to one already-open transaction, handed to an interactive
/// `$transaction` callback. Mirrors the subset of [`Client`]'s CRUD surface that makes
/// sense mid-transaction; every call routes through the same [`DataCtx`] instead of
/// opening its own, and every after-hook it queues is collected for the outer
/// `$transaction` call to flush once (and only if) the whole block commits.
pub struct TransactionClient<'a> {
    client: &'a Client,
    executor: &'a Executor,
    ctx: &'a mut DataCtx,
    after_hooks: Arc<std::sync::Mutex<Vec<crate::executor::PendingAfterHook>>>,
}

impl<'a> TransactionClient<'a> {
    pub async fn find_many(&mut self, model: &str, args: Value) -> Result<Vec<Value>> {
        let model_name = Client::model_name(model);
        let args = self.client.plugins().on_query(&model_name, args);
        let args = self.client.validate(Operation::FindMany, &model_name, &args)?;
        let rows = self.executor.find_many_in(self.ctx, &model_name, &args).await?;
        self.client.finalize(&model_name, rows, false)
    }

    pub async fn create(&mut self, model: &str, data: Value) -> Result<Value> {
        let model_name = Client::model_name(model);
        let payload = serde_json::json!({"data": data});
        let payload = self.client.validate(Operation::Create, &model_name, &payload)?;
        let data = payload.get("data").cloned().unwrap_or(Value::Null);

        let dialect = self.client.conn.dialect();
        let plan = mutate::plan_create(&self.client.schema, &self.client.layout, dialect.as_ref(), &model_name, &data)?;
        let (_, hooks) = self.executor.run_mutation_steps(self.ctx, &model_name, &plan).await?;
        self.after_hooks.lock().expect("after-hooks lock poisoned").extend(hooks);

        let id_filter = unique_filter_from_row(&self.client.schema, &model_name, &data)?;
        self.find_unique_or_throw(model, serde_json::json!({"where": id_filter})).await
    }

    pub async fn update(&mut self, model: &str, where_: Value, data: Value) -> Result<Value> {
        let model_name = Client::model_name(model);
        let payload = serde_json::json!({"where": where_, "data": data});
        let payload = self.client.validate(Operation::Update, &model_name, &payload)?;
        let where_ = payload.get("where").cloned().unwrap_or(Value::Null);
        let data = payload.get("data").cloned().unwrap_or(Value::Null);

        let dialect = self.client.conn.dialect();
        let plan = mutate::plan_update(&self.client.schema, &self.client.layout, dialect.as_ref(), &model_name, &where_, &data)?;
        let (outcome, hooks) = self.executor.run_mutation_steps(self.ctx, &model_name, &plan).await?;
        self.after_hooks.lock().expect("after-hooks lock poisoned").extend(hooks);
        if outcome.affected == 0 {
            return Err(EngineError::not_found(model_name.0));
        }
        self.find_unique_or_throw(model, serde_json::json!({"where": where_})).await
    }

    pub async fn delete(&mut self, model: &str, where_: Value) -> Result<Value> {
        let model_name = Client::model_name(model);
        let found = self.find_unique_or_throw(model, serde_json::json!({"where": where_.clone()})).await?;
        let dialect = self.client.conn.dialect();
        let plan = mutate::plan_delete(&self.client.schema, &self.client.layout, &model_name, dialect.as_ref(), &where_)?;
        let (_, hooks) = self.executor.run_mutation_steps(self.ctx, &model_name, &plan).await?;
        self.after_hooks.lock().expect("after-hooks lock poisoned").extend(hooks);
        Ok(found)
    }

    pub async fn find_unique_or_throw(&mut self, model: &str, args: Value) -> Result<Value> {
        let model_name = Client::model_name(model);
        let rows = self.find_many(model, args).await?;
        rows.into_iter().next().ok_or_else(|| EngineError::not_found(model_name.0))
    }
}

/// Validates `$procs.<name>`'s payload against its declared params: every non-optional
/// param must be present under `payload.args`, every present key must be declared, and
/// the payload itself may be omitted only when every param is optional (§4.9).
fn validate_procedure_args(procedure: &Procedure, payload: Option<Value>) -> Result<Value> {
    let args = match payload {
        Some(Value::Object(obj)) => obj
            .get("args")
            .cloned()
            .ok_or_else(|| EngineError::input_validation("$", "procedure payload must be {args: {...}}"))?,
        Some(_) => return Err(EngineError::input_validation("$", "procedure payload must be an object")),
        None if procedure.all_optional() => Value::Object(Default::default()),
        None => return Err(EngineError::input_validation("$.args", "missing required procedure arguments")),
    };
    let Value::Object(args) = args else {
        return Err(EngineError::input_validation("$.args", "args must be an object"));
    };

    for key in args.keys() {
        if !procedure.params.iter().any(|p| &p.name == key) {
            return Err(EngineError::input_validation("$.args", format!("unknown argument {key:?}")));
        }
    }
    for param in &procedure.params {
        if !param.optional && !args.contains_key(&param.name) {
            return Err(EngineError::input_validation("$.args", format!("missing required argument {:?}", param.name)));
        }
    }
    Ok(Value::Object(args))
}

fn cap_take_one(args: &mut Value) {
    if let Value::Object(obj) = args {
        obj.insert("take".to_owned(), Value::from(1));
    }
}

fn strip_selection(mut args: Value) -> Value {
    if let Value::Object(obj) = &mut args {
        obj.remove("select");
        obj.remove("include");
    }
    args
}

/// Builds a `where` object identifying the row just created, from its own `data`
/// payload, for the immediate re-read every `create` needs to return the full projected
/// shape (including relation columns `data` itself never carried).
fn unique_filter_from_row(schema: &Schema, model_name: &ModelName, data: &Value) -> Result<Value> {
    let model = schema.model(model_name).map_err(|e| EngineError::Internal(e.to_string()))?;
    let mut filter = serde_json::Map::new();
    for id_field in &model.id_fields {
        let value = data
            .get(&id_field.0)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("create payload is missing id field {:?}", id_field.0)))?;
        filter.insert(id_field.0.clone(), value);
    }
    Ok(Value::Object(filter))
}

fn raw_args(params: &[Value]) -> sqlx::any::AnyArguments<'static> {
    use sqlx::any::AnyArguments;
    use sqlx::Arguments;

    let mut args = AnyArguments::default();
    for param in params {
        match param {
            Value::String(s) => args.add(s.clone()),
            Value::Number(n) if n.is_i64() => args.add(n.as_i64().unwrap_or_default()),
            Value::Number(n) => args.add(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => args.add(*b),
            Value::Null => args.add(None::<String>),
            other => args.add(other.to_string()),
        }
    }
    args
}

async fn raw_query_rows(ctx: &mut DataCtx, sql: &str, params: Vec<Value>) -> Result<Vec<Value>> {
    use sqlx::Row;

    let args = raw_args(&params);

    let rows = sqlx::query_with(sql, args)
        .fetch_all(&mut *ctx.txn)
        .await
        .map_err(|e| EngineError::db_query(sql.to_owned(), Vec::new(), e.into()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut obj = serde_json::Map::new();
        for (i, column) in row.columns().iter().enumerate() {
            let value: Option<String> = row.try_get(i).unwrap_or(None);
            obj.insert(column.name().to_owned(), value.map(Value::String).unwrap_or(Value::Null));
        }
        out.push(Value::Object(obj));
    }
    Ok(out)
}
