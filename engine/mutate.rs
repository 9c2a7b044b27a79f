//! Compiles `create`/`update`/`delete`/`upsert` (and their `*Many` variants) into an
//! ordered list of INSERT/UPDATE/DELETE statements (§4.5).
//!
//! The nested-write walker below handles every operator the payload grammar allows
//! inside `data` — `create`/`createMany`/`connect`/`connectOrCreate`/`disconnect`/`set`/
//! `update`/`updateMany`/`upsert`/`delete`/`deleteMany` — plus delegate fan-out across a
//! model's `baseModel` chain. This is only tractable because ids are always
//! caller-supplied: `create`'s `data.id` and `update`'s unique-key `where` both name the
//! row's identity before any statement runs, so a to-many nested write can target its
//! child rows by that identity without reading the database first. The one case that
//! genuinely cannot be resolved this way is a nested `update`/`upsert`/`delete`/`create`
//! on the *owning* side of a to-one relation when the payload gives no identifying key
//! for the currently-connected row — that needs to know what's connected today, which
//! only a read can tell it. Those are rejected with `NotSupportedError`; see DESIGN.md.

use indexmap::IndexMap;
use qorm_schema::{Field, FieldName, Model, ModelName, Schema};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{EngineError, Result};
use crate::layout::{Layout, ModelTable};
use crate::plugin::MutationKind;
use crate::qutils;
use crate::query::build::QueryBuilder;
use crate::query::{OutputExpr, Query};

/// One or more statements to run, in order, inside a single transaction.
pub struct MutationPlan {
    pub steps: Vec<MutationStep>,
}

/// One planned statement plus enough shape information for the executor to run the
/// plugin mutation-hook pipeline around it (§4.6): a pre-image select for hooks that need
/// the row's prior state, whether the statement's own output already carries the
/// resulting rows (`RETURNING`), and a fallback select for dialects that lack it.
pub struct MutationStep {
    pub query: Query,
    pub returns_rows: bool,
    pub pre_image: Option<Query>,
    pub after_select: Option<Query>,
    pub hook: Option<HookMeta>,
}

/// Identifies the logical entity a step's `onEntityMutation` hook should fire for. Steps
/// with no `HookMeta` (a delegate ancestor table's own row, for instance) are storage
/// plumbing for a single logical write and are not independently hook-visible.
pub struct HookMeta {
    pub model_name: ModelName,
    pub kind: MutationKind,
}

/// A field name plus the JSON value to encode for it, in the order they'll appear in the
/// statement.
type Row = Vec<(FieldName, Value)>;

pub fn plan_create(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, data: &Value) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let steps = plan_create_recursive(schema, layout, dialect, model, data, &[])?;
    Ok(MutationPlan { steps })
}

pub fn plan_create_many(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<MutationPlan> {
    plan_create_many_impl(schema, layout, dialect, model_name, args, false)
}

pub fn plan_create_many_and_return(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<MutationPlan> {
    if !dialect.capabilities().supports_create_many_and_return {
        return Err(EngineError::not_supported("createManyAndReturn on this provider"));
    }
    plan_create_many_impl(schema, layout, dialect, model_name, args, true)
}

fn plan_create_many_impl(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value, want_rows: bool) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let skip_duplicates = args.get("skipDuplicates").and_then(Value::as_bool).unwrap_or(false);
    if skip_duplicates && !dialect.capabilities().supports_skip_duplicates {
        return Err(EngineError::not_supported("skipDuplicates on this provider"));
    }
    let items = args
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::input_validation("$.data", "createMany requires an array"))?;
    let mut steps = Vec::new();
    for item in items {
        let (row, nested) = resolve_create_own_fields(schema, model, item, &[])?;
        if !nested.is_empty() {
            return Err(EngineError::input_validation("$.data", "createMany cannot create nested relations"));
        }
        steps.append(&mut build_delegate_insert_steps(schema, layout, dialect, model, row, skip_duplicates, want_rows)?);
    }
    Ok(MutationPlan { steps })
}

pub fn plan_update(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, where_: &Value, data: &Value) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    crate::find::validate_unique_where(model, where_)?;
    plan_update_one(schema, layout, dialect, model, where_, data)
}

/// Resolves `data` into per-table assignment rows (own table plus, when `where_` carries
/// the effective id, any delegate ancestor tables the payload touches), plans each
/// table's `UPDATE`, and plans the nested to-many writes the payload's relation keys
/// carry.
fn plan_update_one(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, where_: &Value, data: &Value) -> Result<MutationPlan> {
    let (own_row, nested) = resolve_update_own_fields(schema, model, data)?;
    let chain = qutils::ancestor_chain(schema, model);
    let mut steps = Vec::new();

    if !chain.is_empty() {
        let has_id_where = qutils::effective_id_fields(schema, model)
            .map(|ids| ids.iter().all(|f| where_.get(&f.0).is_some()))
            .unwrap_or(false);
        let by_table = route_by_table(model, own_row)?;
        for ancestor in &chain {
            let Some(rows) = by_table.get(&ancestor.name) else { continue };
            if rows.is_empty() {
                continue;
            }
            if !has_id_where {
                return Err(EngineError::not_supported(format!(
                    "updating field(s) inherited from {:?} requires `where` to name the id (no read is performed to discover it otherwise)",
                    ancestor.name.0
                )));
            }
            let ancestor_table = layout.table(&ancestor.name).map_err(to_internal)?;
            let (query, returns_rows) = build_update_with_returning(dialect, ancestor_table, rows, &[], None, None, false)?;
            steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
        }
        let leaf_rows = by_table.get(&model.name).cloned().unwrap_or_default();
        push_own_update_step(dialect, layout, model, leaf_rows, where_, &mut steps)?;
    } else {
        push_own_update_step(dialect, layout, model, own_row, where_, &mut steps)?;
    }

    for (field_name, value) in nested {
        let field = model.field(&field_name).map_err(to_internal)?;
        let fk_conditions = to_many_fk_conditions(schema, model, field, where_)?;
        steps.append(&mut plan_to_many_ops(schema, layout, dialect, field, value, &fk_conditions)?);
    }

    Ok(MutationPlan { steps })
}

fn push_own_update_step(dialect: &dyn Dialect, layout: &Layout, model: &Model, assignments: Row, where_: &Value, steps: &mut Vec<MutationStep>) -> Result<()> {
    if assignments.is_empty() {
        return Err(EngineError::input_validation("$.data", "update requires at least one field"));
    }
    let table = layout.table(&model.name).map_err(to_internal)?;
    let pre_image = Some(build_select_rows(dialect, table, &[], Some(where_))?);
    let (query, returns_rows) = build_update_with_returning(dialect, table, &assignments, &[], Some(where_), None, true)?;
    let after_select = (!returns_rows).then(|| build_select_rows(dialect, table, &[], Some(where_))).transpose()?;
    steps.push(MutationStep {
        query,
        returns_rows,
        pre_image,
        after_select,
        hook: Some(HookMeta { model_name: model.name.clone(), kind: MutationKind::Update }),
    });
    Ok(())
}

pub fn plan_update_many(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<MutationPlan> {
    plan_update_many_impl(schema, layout, dialect, model_name, args, false)
}

pub fn plan_update_many_and_return(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<MutationPlan> {
    plan_update_many_impl(schema, layout, dialect, model_name, args, true)
}

fn plan_update_many_impl(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value, want_rows: bool) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let table = layout.table(model_name).map_err(to_internal)?;
    let limit = args.get("limit").and_then(Value::as_u64);
    if limit.is_some() && !dialect.capabilities().supports_update_with_limit {
        return Err(EngineError::not_supported("updateMany limit on this provider"));
    }
    let data = args.get("data").ok_or_else(|| EngineError::input_validation("$.data", "updateMany requires data"))?;
    let (assignments, nested) = resolve_update_own_fields(schema, model, data)?;
    if !nested.is_empty() {
        return Err(EngineError::not_supported("nested relation writes inside updateMany's data"));
    }
    let where_ = args.get("where").cloned().unwrap_or_else(|| serde_json::json!({}));
    let pre_image = want_rows.then(|| build_select_rows(dialect, table, &[], Some(&where_))).transpose()?;
    let (query, returns_rows) = build_update_with_returning(dialect, table, &assignments, &[], Some(&where_), limit, want_rows)?;
    let after_select = (want_rows && !returns_rows).then(|| build_select_rows(dialect, table, &[], Some(&where_))).transpose()?;
    let hook = want_rows.then(|| HookMeta { model_name: model_name.clone(), kind: MutationKind::Update });
    Ok(MutationPlan {
        steps: vec![MutationStep { query, returns_rows, pre_image, after_select, hook }],
    })
}

pub fn plan_delete(schema: &Schema, layout: &Layout, model_name: &ModelName, dialect: &dyn Dialect, where_: &Value) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    crate::find::validate_unique_where(model, where_)?;
    let chain = qutils::ancestor_chain(schema, model);
    let mut steps = Vec::new();
    // Descendant-first: the leaf table's row is removed before its ancestors' shared-id
    // rows, so a foreign key from the leaf table back up the chain is never left dangling
    // mid-transaction regardless of how the pusher declared its `ON DELETE` action.
    push_own_delete_step(dialect, layout, model_name, where_, &mut steps)?;
    for ancestor in chain.iter().rev() {
        let ancestor_table = layout.table(&ancestor.name).map_err(to_internal)?;
        let (query, returns_rows) = build_delete_with_returning(dialect, ancestor_table, &[], Some(where_), None, false)?;
        steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
    }
    Ok(MutationPlan { steps })
}

fn push_own_delete_step(dialect: &dyn Dialect, layout: &Layout, model_name: &ModelName, where_: &Value, steps: &mut Vec<MutationStep>) -> Result<()> {
    let table = layout.table(model_name).map_err(to_internal)?;
    let (query, returns_rows) = build_delete_with_returning(dialect, table, &[], Some(where_), None, true)?;
    // With RETURNING the DELETE has already physically removed the row by the time the
    // before-hook runs, but since everything stays inside one transaction until
    // `run_mutation` commits, a hook that rejects the row still rolls the delete back —
    // so reusing the returned row as both the before- and after-image is sound, and
    // saves a pre-image SELECT. Without RETURNING we must read before deleting.
    let pre_image = (!returns_rows).then(|| build_select_rows(dialect, table, &[], Some(where_))).transpose()?;
    steps.push(MutationStep {
        query,
        returns_rows,
        pre_image,
        after_select: None,
        hook: Some(HookMeta { model_name: model_name.clone(), kind: MutationKind::Delete }),
    });
    Ok(())
}

pub fn plan_delete_many(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<MutationPlan> {
    let _ = schema;
    let table = layout.table(model_name).map_err(to_internal)?;
    let limit = args.get("limit").and_then(Value::as_u64);
    if limit.is_some() && !dialect.capabilities().supports_delete_with_limit {
        return Err(EngineError::not_supported("deleteMany limit on this provider"));
    }
    let where_ = args.get("where").cloned().unwrap_or_else(|| serde_json::json!({}));
    let (query, _) = build_delete_with_returning(dialect, table, &[], Some(&where_), limit, false)?;
    Ok(MutationPlan {
        steps: vec![MutationStep { query, returns_rows: false, pre_image: None, after_select: None, hook: None }],
    })
}

/// `upsert`: since the row's id (or whichever unique key `where` names) is always known
/// up front, this compiles to one `INSERT ... ON CONFLICT DO UPDATE` statement (§4.5,
/// §4.9) rather than a read-then-branch. The statement cannot itself say which branch
/// fired, so its `onEntityMutation` hook always reports [`MutationKind::Update`] — the
/// closest fit `Plugin`'s two-variant taxonomy offers for a create that just happened.
pub fn plan_upsert(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, where_: &Value, create: &Value, update: &Value) -> Result<MutationPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    crate::find::validate_unique_where(model, where_)?;
    let table = layout.table(model_name).map_err(to_internal)?;

    let where_obj = where_.as_object().ok_or_else(|| EngineError::input_validation("$.where", "must be an object"))?;
    let conflict_fields: Vec<FieldName> = where_obj.keys().map(|k| FieldName::from(k.as_str())).collect();

    let (create_row, create_nested) = resolve_create_own_fields(schema, model, create, &[])?;
    if !create_nested.is_empty() {
        return Err(EngineError::not_supported("nested relation writes inside upsert's create"));
    }
    let (update_row, update_nested) = resolve_update_own_fields(schema, model, update)?;
    if !update_nested.is_empty() {
        return Err(EngineError::not_supported("nested relation writes inside upsert's update"));
    }

    let (query, returns_rows) = build_upsert_query(dialect, table, &create_row, &conflict_fields, &update_row, true)?;
    let after_select = (!returns_rows).then(|| build_select_rows(dialect, table, &[], Some(where_))).transpose()?;
    Ok(MutationPlan {
        steps: vec![MutationStep {
            query,
            returns_rows,
            pre_image: None,
            after_select,
            hook: Some(HookMeta { model_name: model_name.clone(), kind: MutationKind::Update }),
        }],
    })
}

fn to_internal(e: anyhow::Error) -> EngineError {
    EngineError::Internal(e.to_string())
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn as_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// A model's id field values, read directly out of `source` (a `create`'s `data`, or an
/// `update`'s already-validated unique `where`) — never queried, since the caller always
/// supplies them.
fn extract_id_values(schema: &Schema, model: &Model, source: &Value) -> Result<Vec<(FieldName, Value)>> {
    let ids = qutils::effective_id_fields(schema, model).map_err(to_internal)?;
    ids.iter()
        .map(|f| {
            source
                .get(&f.0)
                .cloned()
                .map(|v| (f.clone(), v))
                .ok_or_else(|| EngineError::input_validation("$.data", format!("create requires id field {:?}", f.0)))
        })
        .collect()
}

/// The target table's foreign-key column values for a relation field, read out of
/// `source` (the parent's `data`/`where`) via the relation's referenced field names —
/// e.g. for `posts` on `User`, `[("authorId", source["id"])]`.
fn to_many_fk_conditions(schema: &Schema, model: &Model, field: &Field, source: &Value) -> Result<Vec<(FieldName, Value)>> {
    let pairs = qutils::join_pairs(schema, model, field).map_err(to_internal)?;
    pairs
        .into_iter()
        .map(|(owning_field, referenced_field)| {
            let v = source.get(&referenced_field.0).cloned().ok_or_else(|| {
                EngineError::input_validation("$.data", format!("resolving relation {:?} needs {:?}", field.name.0, referenced_field.0))
            })?;
            Ok((owning_field, v))
        })
        .collect()
}

/// Resolves `data` for a `create`: scalar/enum fields pass through; an owning to-one
/// relation's `connect`/`disconnect` resolves straight into this row's own foreign-key
/// columns, and `create`/`connectOrCreate` resolve the FK columns the same way from the
/// nested payload's own identity (the target's id, or its `where`) while also recording
/// the field in `nested` so the caller can plan the target's insert as a pre-step (it
/// must run before this row's own insert, since this row's FK references it). To-many
/// relation fields are returned unresolved in `nested` too, for the caller to plan once
/// this row's own id is known.
fn resolve_create_own_fields<'a>(schema: &Schema, model: &Model, data: &'a Value, fk_override: &[(FieldName, Value)]) -> Result<(Row, Vec<(FieldName, &'a Value)>)> {
    let obj = data.as_object().ok_or_else(|| EngineError::input_validation("$.data", "must be an object"))?;
    let mut row: IndexMap<FieldName, Value> = IndexMap::new();
    for (f, v) in fk_override {
        row.insert(f.clone(), v.clone());
    }
    let mut nested: Vec<(FieldName, &'a Value)> = Vec::new();
    for (key, value) in obj {
        let field_name = FieldName::from(key.as_str());
        let field = model.field(&field_name).map_err(to_internal)?;
        if !field.is_relation() {
            row.insert(field_name, value.clone());
            continue;
        }
        if field.is_to_many() {
            nested.push((field_name, value));
            continue;
        }
        if !field.is_owning_relation() {
            return Err(EngineError::not_supported(format!(
                "nested writes on the back-reference side of relation field {key:?} at create time"
            )));
        }
        let pairs = qutils::join_pairs(schema, model, field).map_err(to_internal)?;
        let ops = crate::visit::write_ops(value);
        if ops.is_empty() {
            return Err(EngineError::input_validation("$.data", format!("relation field {key:?} needs an operator")));
        }
        for op in ops {
            match op.op {
                "connect" => {
                    let connect_obj = op.arg.as_object().ok_or_else(|| EngineError::input_validation("$.data", "connect must name the target's unique key"))?;
                    for (owning_field, referenced_field) in &pairs {
                        let v = connect_obj
                            .get(&referenced_field.0)
                            .ok_or_else(|| EngineError::input_validation("$.data", format!("connect is missing {:?}", referenced_field.0)))?;
                        row.insert(owning_field.clone(), v.clone());
                    }
                }
                "disconnect" => {
                    for (owning_field, _) in &pairs {
                        let owning = model.field(owning_field).map_err(to_internal)?;
                        if !owning.optional {
                            return Err(EngineError::not_supported(format!("disconnect on required relation field {key:?}")));
                        }
                        row.insert(owning_field.clone(), Value::Null);
                    }
                }
                "create" => {
                    for (owning_field, referenced_field) in &pairs {
                        let v = op.arg.get(&referenced_field.0).ok_or_else(|| {
                            EngineError::input_validation("$.data", format!("nested create for {key:?} is missing id field {:?}", referenced_field.0))
                        })?;
                        row.insert(owning_field.clone(), v.clone());
                    }
                    nested.push((field_name.clone(), value));
                }
                "connectOrCreate" => {
                    let where_ = op
                        .arg
                        .get("where")
                        .ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate requires where"))?;
                    for (owning_field, referenced_field) in &pairs {
                        let v = where_.get(&referenced_field.0).ok_or_else(|| {
                            EngineError::input_validation("$.data", format!("connectOrCreate for {key:?} is missing {:?}", referenced_field.0))
                        })?;
                        row.insert(owning_field.clone(), v.clone());
                    }
                    nested.push((field_name.clone(), value));
                }
                other => return Err(EngineError::not_supported(format!("{other:?} on relation field {key:?} at create time"))),
            }
        }
    }
    Ok((row.into_iter().collect(), nested))
}

/// Plans the pre-steps a to-one relation's nested `create`/`connectOrCreate` needs
/// (inserting the target row before this row's own insert) — the counterpart to the
/// FK-column resolution [`resolve_create_own_fields`] already did for the same fields.
fn plan_to_one_pre_steps(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, nested: &[(FieldName, &Value)]) -> Result<Vec<MutationStep>> {
    let mut steps = Vec::new();
    for (field_name, value) in nested {
        let field = model.field(field_name).map_err(to_internal)?;
        if field.is_to_many() {
            continue;
        }
        if let Some(create_arg) = value.get("create") {
            let target = qutils::target_model(schema, field).map_err(to_internal)?;
            steps.append(&mut plan_create_recursive(schema, layout, dialect, target, create_arg, &[])?);
        } else if let Some(coc) = value.get("connectOrCreate") {
            let target = qutils::target_model(schema, field).map_err(to_internal)?;
            let where_ = coc.get("where").ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate requires where"))?;
            let create_arg = coc.get("create").ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate requires create"))?;
            let target_table = layout.table(&target.name).map_err(to_internal)?;
            let (row, target_nested) = resolve_create_own_fields(schema, target, create_arg, &[])?;
            if !target_nested.is_empty() {
                return Err(EngineError::not_supported("nested relation writes inside connectOrCreate's create"));
            }
            let where_obj = where_.as_object().ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate where must be an object"))?;
            let conflict_fields: Vec<FieldName> = where_obj.keys().map(|k| FieldName::from(k.as_str())).collect();
            let (query, returns_rows) = build_upsert_query(dialect, target_table, &row, &conflict_fields, &[], false)?;
            steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
        }
    }
    Ok(steps)
}

/// Resolves `data` for an `update`: scalar/enum fields pass through, an owning to-one
/// relation's `connect`/`disconnect` updates this row's own FK columns, and any other
/// to-one operator (`update`/`upsert`/`delete`/`create`/`connectOrCreate` on the owning
/// side) is rejected — updating the *currently connected* target needs to know its
/// identity, and nothing but a database read can tell us that. To-many fields are
/// returned unresolved in `nested`.
fn resolve_update_own_fields<'a>(schema: &Schema, model: &Model, data: &'a Value) -> Result<(Row, Vec<(FieldName, &'a Value)>)> {
    let obj = data.as_object().ok_or_else(|| EngineError::input_validation("$.data", "must be an object"))?;
    let mut row = Vec::new();
    let mut nested: Vec<(FieldName, &'a Value)> = Vec::new();
    for (key, value) in obj {
        let field_name = FieldName::from(key.as_str());
        let field = model.field(&field_name).map_err(to_internal)?;
        if !field.is_relation() {
            row.push((field_name, value.clone()));
            continue;
        }
        if field.is_to_many() {
            nested.push((field_name, value));
            continue;
        }
        if !field.is_owning_relation() {
            return Err(EngineError::not_supported(format!("nested writes on the back-reference side of relation field {key:?}")));
        }
        let pairs = qutils::join_pairs(schema, model, field).map_err(to_internal)?;
        let ops = crate::visit::write_ops(value);
        if ops.is_empty() {
            return Err(EngineError::input_validation("$.data", format!("relation field {key:?} needs an operator")));
        }
        for op in ops {
            match op.op {
                "connect" => {
                    let connect_obj = op.arg.as_object().ok_or_else(|| EngineError::input_validation("$.data", "connect must name the target's unique key"))?;
                    for (owning_field, referenced_field) in &pairs {
                        let v = connect_obj
                            .get(&referenced_field.0)
                            .ok_or_else(|| EngineError::input_validation("$.data", format!("connect is missing {:?}", referenced_field.0)))?;
                        row.push((owning_field.clone(), v.clone()));
                    }
                }
                "disconnect" => {
                    for (owning_field, _) in &pairs {
                        let owning = model.field(owning_field).map_err(to_internal)?;
                        if !owning.optional {
                            return Err(EngineError::not_supported(format!("disconnect on required relation field {key:?}")));
                        }
                        row.push((owning_field.clone(), Value::Null));
                    }
                }
                other => {
                    return Err(EngineError::not_supported(format!(
                        "{other:?} on the owning side of to-one relation field {key:?} without an explicit target: qorm has no way to discover the currently-connected row without a database read"
                    )));
                }
            }
        }
    }
    Ok((row, nested))
}

/// Splits a flat row into one row per physical table across `model`'s delegate chain,
/// routing each field by [`Field::origin_model`].
fn route_by_table(model: &Model, row: Row) -> Result<IndexMap<ModelName, Row>> {
    let mut by_table: IndexMap<ModelName, Row> = IndexMap::new();
    for (field_name, value) in row {
        let field = model.field(&field_name).map_err(to_internal)?;
        let owner = field.origin_model.clone().unwrap_or_else(|| model.name.clone());
        by_table.entry(owner).or_insert_with(Vec::new).push((field_name, value));
    }
    Ok(by_table)
}

/// Splits `row` across `model`'s delegate chain, injecting shared id column values and
/// (on the root table) the `@@delegate` discriminator, and builds one `INSERT` per
/// non-empty table (root first). Only the leaf table's insert is hook-visible (§4.6/§4.7)
/// — the ancestor rows are storage plumbing for the same logical entity.
fn build_delegate_insert_steps(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model: &Model,
    row: Row,
    skip_duplicates: bool,
    want_rows: bool,
) -> Result<Vec<MutationStep>> {
    let chain = qutils::ancestor_chain(schema, model);
    let row_lookup: std::collections::HashMap<FieldName, Value> = row.iter().cloned().collect();
    let id_fields = qutils::effective_id_fields(schema, model).map_err(to_internal)?.to_vec();
    let mut id_pairs = Vec::with_capacity(id_fields.len());
    for f in &id_fields {
        let v = row_lookup
            .get(f)
            .cloned()
            .ok_or_else(|| EngineError::input_validation("$.data", format!("create requires id field {:?}", f.0)))?;
        id_pairs.push((f.clone(), v));
    }

    let mut by_table = route_by_table(model, row)?;
    if let Some((root_name, disc_field)) = qutils::delegate_discriminator(schema, model) {
        if !chain.is_empty() {
            let root_row = by_table.entry(root_name).or_insert_with(Vec::new);
            if !root_row.iter().any(|(f, _)| *f == disc_field) {
                root_row.push((disc_field, Value::String(model.name.0.clone())));
            }
        }
    }

    let mut table_order: Vec<ModelName> = chain.iter().map(|m| m.name.clone()).collect();
    table_order.push(model.name.clone());

    let mut steps = Vec::new();
    for table_name in &table_order {
        let mut table_row = by_table.shift_remove(table_name).unwrap_or_default();
        for (f, v) in &id_pairs {
            if !table_row.iter().any(|(existing, _)| existing == f) {
                table_row.push((f.clone(), v.clone()));
            }
        }
        let table = layout.table(table_name).map_err(to_internal)?;
        let is_leaf = table_name == &model.name;
        let want_returning = is_leaf && want_rows;
        let (query, returns_rows) = build_insert_with_returning(dialect, table, &table_row, skip_duplicates, want_returning)?;
        let after_select = (is_leaf && want_rows && !returns_rows)
            .then(|| build_select_rows(dialect, table, &id_pairs, None))
            .transpose()?;
        steps.push(MutationStep {
            query,
            returns_rows,
            pre_image: None,
            after_select,
            hook: is_leaf.then(|| HookMeta { model_name: model.name.clone(), kind: MutationKind::Create }),
        });
    }
    Ok(steps)
}

/// Recursively plans one `create`, its delegate fan-out, and every nested write its
/// `data` carries (to-one pre-steps before this row's own insert, to-many post-steps
/// after it — a to-many child needs this row's id, which by then is known either from
/// `fk_override` or straight from `data`).
fn plan_create_recursive(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, data: &Value, fk_override: &[(FieldName, Value)]) -> Result<Vec<MutationStep>> {
    let (own_row, nested) = resolve_create_own_fields(schema, model, data, fk_override)?;
    let mut pre_steps = plan_to_one_pre_steps(schema, layout, dialect, model, &nested)?;

    let mut steps = build_delegate_insert_steps(schema, layout, dialect, model, own_row, false, true)?;

    let id_pairs = extract_id_values(schema, model, data)?;
    let id_source = Value::Object(id_pairs.iter().map(|(f, v)| (f.0.clone(), v.clone())).collect());
    let mut post_steps = Vec::new();
    for (field_name, value) in nested {
        let field = model.field(&field_name).map_err(to_internal)?;
        if !field.is_to_many() {
            continue;
        }
        let fk_conditions = to_many_fk_conditions(schema, model, field, &id_source)?;
        post_steps.append(&mut plan_to_many_ops(schema, layout, dialect, field, value, &fk_conditions)?);
    }

    pre_steps.append(&mut steps);
    pre_steps.append(&mut post_steps);
    Ok(pre_steps)
}

/// Plans every nested-write operator present on a to-many relation field's payload
/// (§4.5), in [`crate::visit::WRITE_OPERATORS`] dependency order, against the target
/// table identified by `fk_conditions` (the parent's id copied into the target's own
/// foreign-key columns).
fn plan_to_many_ops(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, field: &Field, value: &Value, fk_conditions: &[(FieldName, Value)]) -> Result<Vec<MutationStep>> {
    let target = qutils::target_model(schema, field).map_err(to_internal)?;
    let target_table = layout.table(&target.name).map_err(to_internal)?;
    let fk_optional = fk_conditions.iter().all(|(f, _)| target.field(f).map(|fld| fld.optional).unwrap_or(false));

    let mut steps = Vec::new();
    for op in crate::visit::write_ops(value) {
        match op.op {
            "create" => {
                for item in as_items(op.arg) {
                    steps.append(&mut plan_create_recursive(schema, layout, dialect, target, item, fk_conditions)?);
                }
            }
            "createMany" => {
                let args = op.arg.as_object().ok_or_else(|| EngineError::input_validation("$.data", "createMany requires an object"))?;
                let skip = args.get("skipDuplicates").and_then(Value::as_bool).unwrap_or(false);
                let items = args
                    .get("data")
                    .and_then(Value::as_array)
                    .ok_or_else(|| EngineError::input_validation("$.data", "createMany requires an array"))?;
                for item in items {
                    let obj = item.as_object().ok_or_else(|| EngineError::input_validation("$.data", "createMany item must be an object"))?;
                    let mut row: Row = Vec::with_capacity(obj.len());
                    for (k, v) in obj {
                        let f = target.field(&FieldName::from(k.as_str())).map_err(to_internal)?;
                        if f.is_relation() {
                            return Err(EngineError::input_validation("$.data", "createMany cannot create nested relations"));
                        }
                        row.push((FieldName::from(k.as_str()), v.clone()));
                    }
                    row.extend(fk_conditions.iter().cloned());
                    steps.append(&mut build_delegate_insert_steps(schema, layout, dialect, target, row, skip, false)?);
                }
            }
            "connect" => {
                for filter in as_items(op.arg) {
                    let (query, returns_rows) = build_update_with_returning(dialect, target_table, fk_conditions, &[], Some(filter), None, false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "connectOrCreate" => {
                for item in as_items(op.arg) {
                    let where_ = item.get("where").ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate requires where"))?;
                    let create_arg = item.get("create").ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate requires create"))?;
                    let (mut row, target_nested) = resolve_create_own_fields(schema, target, create_arg, fk_conditions)?;
                    if !target_nested.is_empty() {
                        return Err(EngineError::not_supported("nested relation writes inside connectOrCreate's create"));
                    }
                    row.retain(|(f, _)| !fk_conditions.iter().any(|(cf, _)| cf == f));
                    row.extend(fk_conditions.iter().cloned());
                    let where_obj = where_.as_object().ok_or_else(|| EngineError::input_validation("$.data", "connectOrCreate where must be an object"))?;
                    let conflict_fields: Vec<FieldName> = where_obj.keys().map(|k| FieldName::from(k.as_str())).collect();
                    let (query, returns_rows) = build_upsert_query(dialect, target_table, &row, &conflict_fields, &[], false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "disconnect" => {
                if !fk_optional {
                    return Err(EngineError::not_supported("disconnect on a required relation"));
                }
                let null_row: Row = fk_conditions.iter().map(|(f, _)| (f.clone(), Value::Null)).collect();
                let filter = if matches!(op.arg, Value::Bool(true)) { None } else { Some(op.arg) };
                let (query, returns_rows) = build_update_with_returning(dialect, target_table, &null_row, fk_conditions, filter, None, false)?;
                steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
            }
            "set" => {
                if !fk_optional {
                    return Err(EngineError::not_supported("set on a required relation"));
                }
                let items = op.arg.as_array().ok_or_else(|| EngineError::input_validation("$.data", "set requires an array"))?;
                // Disconnect everything currently attached, then reconnect exactly the
                // named rows — simpler than computing the symmetric difference and
                // correct regardless of what was previously connected.
                let null_row: Row = fk_conditions.iter().map(|(f, _)| (f.clone(), Value::Null)).collect();
                let (query, returns_rows) = build_update_with_returning(dialect, target_table, &null_row, fk_conditions, None, None, false)?;
                steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                for filter in items {
                    let (query, returns_rows) = build_update_with_returning(dialect, target_table, fk_conditions, &[], Some(filter), None, false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "update" => {
                for item in as_items(op.arg) {
                    let where_ = item.get("where").ok_or_else(|| EngineError::input_validation("$.data", "nested update requires where"))?;
                    let data = item.get("data").ok_or_else(|| EngineError::input_validation("$.data", "nested update requires data"))?;
                    let (assignments, target_nested) = resolve_update_own_fields(schema, target, data)?;
                    if !target_nested.is_empty() {
                        return Err(EngineError::not_supported("nested relation writes two levels deep"));
                    }
                    let (query, returns_rows) = build_update_with_returning(dialect, target_table, &assignments, fk_conditions, Some(where_), None, false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "updateMany" => {
                let where_ = op.arg.get("where").cloned().unwrap_or_else(|| serde_json::json!({}));
                let data = op.arg.get("data").ok_or_else(|| EngineError::input_validation("$.data", "updateMany requires data"))?;
                let (assignments, target_nested) = resolve_update_own_fields(schema, target, data)?;
                if !target_nested.is_empty() {
                    return Err(EngineError::not_supported("nested relation writes inside updateMany's data"));
                }
                let (query, returns_rows) = build_update_with_returning(dialect, target_table, &assignments, fk_conditions, Some(&where_), None, false)?;
                steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
            }
            "upsert" => {
                for item in as_items(op.arg) {
                    let where_ = item.get("where").ok_or_else(|| EngineError::input_validation("$.data", "nested upsert requires where"))?;
                    let create_arg = item.get("create").ok_or_else(|| EngineError::input_validation("$.data", "nested upsert requires create"))?;
                    let update_arg = item.get("update").ok_or_else(|| EngineError::input_validation("$.data", "nested upsert requires update"))?;
                    let (mut row, target_nested) = resolve_create_own_fields(schema, target, create_arg, fk_conditions)?;
                    if !target_nested.is_empty() {
                        return Err(EngineError::not_supported("nested relation writes inside nested upsert's create"));
                    }
                    row.retain(|(f, _)| !fk_conditions.iter().any(|(cf, _)| cf == f));
                    row.extend(fk_conditions.iter().cloned());
                    let (update_row, update_nested) = resolve_update_own_fields(schema, target, update_arg)?;
                    if !update_nested.is_empty() {
                        return Err(EngineError::not_supported("nested relation writes inside nested upsert's update"));
                    }
                    let where_obj = where_.as_object().ok_or_else(|| EngineError::input_validation("$.data", "nested upsert where must be an object"))?;
                    let conflict_fields: Vec<FieldName> = where_obj.keys().map(|k| FieldName::from(k.as_str())).collect();
                    let (query, returns_rows) = build_upsert_query(dialect, target_table, &row, &conflict_fields, &update_row, false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "delete" => {
                for filter in as_items(op.arg) {
                    let (query, returns_rows) = build_delete_with_returning(dialect, target_table, fk_conditions, Some(filter), None, false)?;
                    steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
                }
            }
            "deleteMany" => {
                let where_ = op.arg.clone();
                let (query, returns_rows) = build_delete_with_returning(dialect, target_table, fk_conditions, Some(&where_), None, false)?;
                steps.push(MutationStep { query, returns_rows, pre_image: None, after_select: None, hook: None });
            }
            other => return Err(EngineError::not_supported(format!("nested-write operator {other:?}"))),
        }
    }
    Ok(steps)
}

fn write_flat_where(qb: &mut QueryBuilder, table: &ModelTable, conditions: &[(FieldName, Value)], extra: Option<&Value>) -> Result<()> {
    let mut all: Vec<(FieldName, Value)> = conditions.to_vec();
    if let Some(v) = extra {
        if !v.is_null() {
            let obj = v.as_object().ok_or_else(|| EngineError::input_validation("$.where", "must be an object"))?;
            for (k, val) in obj {
                all.push((FieldName::from(k.as_str()), val.clone()));
            }
        }
    }
    if all.is_empty() {
        return Ok(());
    }
    qb.sql.write_str(" WHERE ");
    for (i, (field_name, value)) in all.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(" AND ");
        }
        let col = table.column(field_name).map_err(to_internal)?;
        qb.sql.write_str(&quoted(&col.col_name.0));
        qb.sql.write_str(" = ");
        let idx = qb.add_param(col.repr.clone(), col.optional, value.clone());
        qb.sql.write_param(idx);
    }
    Ok(())
}

fn write_all_columns(qb: &mut QueryBuilder, table: &ModelTable) {
    for (i, col) in table.field_cols.values().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        qb.sql.write_str(&quoted(&col.col_name.0));
    }
}

fn build_row_output(table: &ModelTable) -> OutputExpr {
    let fields = table
        .field_cols
        .values()
        .enumerate()
        .map(|(col_idx, col)| {
            (
                col.field_name.0.clone(),
                OutputExpr::Field { repr: col.repr.clone(), optional: col.optional, col_idx },
            )
        })
        .collect();
    OutputExpr::Object(fields)
}

/// Selects every scalar/enum column of `table` for the row(s) matching `conditions`
/// (AND'ed equality) plus an optional flat equality `filter` — the pre-image/after-image
/// reader every mutation step's plugin hooks are built on (§4.6).
fn build_select_rows(dialect: &dyn Dialect, table: &ModelTable, conditions: &[(FieldName, Value)], filter: Option<&Value>) -> Result<Query> {
    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("SELECT ");
    write_all_columns(&mut qb, table);
    qb.sql.write_str(" FROM ");
    qb.sql.write_table_name(table);
    write_flat_where(&mut qb, table, conditions, filter)?;
    qb.output(build_row_output(table));
    Ok(qb.build())
}

fn build_insert_with_returning(dialect: &dyn Dialect, table: &ModelTable, row: &Row, skip_duplicates: bool, want_returning: bool) -> Result<(Query, bool)> {
    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("INSERT INTO ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(" (");
    for (i, (field_name, _)) in row.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(field_name).map_err(to_internal)?;
        qb.sql.write_str(&quoted(&col.col_name.0));
    }
    qb.sql.write_str(") VALUES (");
    for (i, (field_name, value)) in row.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(field_name).map_err(to_internal)?;
        let idx = qb.add_param(col.repr.clone(), col.optional, value.clone());
        qb.sql.write_param(idx);
    }
    qb.sql.write_str(")");
    if skip_duplicates {
        match dialect.kind() {
            sqlx::any::AnyKind::Postgres | sqlx::any::AnyKind::Sqlite => qb.sql.write_str(" ON CONFLICT DO NOTHING"),
            _ => qb.sql.write_str(" ON DUPLICATE KEY UPDATE id = id"),
        }
    }
    let can_return = want_returning && !skip_duplicates && dialect.capabilities().supports_returning;
    if can_return {
        qb.sql.write_str(" RETURNING ");
        write_all_columns(&mut qb, table);
        qb.output(build_row_output(table));
    }
    Ok((qb.build(), can_return))
}

fn build_update_with_returning(
    dialect: &dyn Dialect,
    table: &ModelTable,
    assignments: &Row,
    conditions: &[(FieldName, Value)],
    filter: Option<&Value>,
    limit: Option<u64>,
    want_returning: bool,
) -> Result<(Query, bool)> {
    if assignments.is_empty() {
        return Err(EngineError::input_validation("$.data", "update requires at least one field"));
    }
    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("UPDATE ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(" SET ");
    for (i, (field_name, value)) in assignments.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(field_name).map_err(to_internal)?;
        qb.sql.write_str(&quoted(&col.col_name.0));
        qb.sql.write_str(" = ");
        let idx = qb.add_param(col.repr.clone(), col.optional, value.clone());
        qb.sql.write_param(idx);
    }
    write_flat_where(&mut qb, table, conditions, filter)?;
    if let Some(n) = limit {
        qb.sql.write_str(&format!(" LIMIT {n}"));
    }
    let can_return = want_returning && dialect.capabilities().supports_returning;
    if can_return {
        qb.sql.write_str(" RETURNING ");
        write_all_columns(&mut qb, table);
        qb.output(build_row_output(table));
    }
    Ok((qb.build(), can_return))
}

fn build_delete_with_returning(
    dialect: &dyn Dialect,
    table: &ModelTable,
    conditions: &[(FieldName, Value)],
    filter: Option<&Value>,
    limit: Option<u64>,
    want_returning: bool,
) -> Result<(Query, bool)> {
    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("DELETE FROM ");
    qb.sql.write_table_name(table);
    write_flat_where(&mut qb, table, conditions, filter)?;
    if let Some(n) = limit {
        qb.sql.write_str(&format!(" LIMIT {n}"));
    }
    let can_return = want_returning && dialect.capabilities().supports_returning;
    if can_return {
        qb.sql.write_str(" RETURNING ");
        write_all_columns(&mut qb, table);
        qb.output(build_row_output(table));
    }
    Ok((qb.build(), can_return))
}

/// `INSERT ... ON CONFLICT (conflict_fields) DO UPDATE SET ...` on Postgres/SQLite,
/// `INSERT ... ON DUPLICATE KEY UPDATE ...` on MySQL (which has no conflict-target
/// syntax and infers the colliding unique/primary key itself) — the single-statement
/// upsert every top-level and nested `upsert`/`connectOrCreate` compiles to (§4.5,
/// §4.9), since the row's identity is always known before the statement runs.
fn build_upsert_query(dialect: &dyn Dialect, table: &ModelTable, create_row: &Row, conflict_fields: &[FieldName], update_row: &Row, want_returning: bool) -> Result<(Query, bool)> {
    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("INSERT INTO ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(" (");
    for (i, (f, _)) in create_row.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(f).map_err(to_internal)?;
        qb.sql.write_str(&quoted(&col.col_name.0));
    }
    qb.sql.write_str(") VALUES (");
    for (i, (f, v)) in create_row.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(f).map_err(to_internal)?;
        let idx = qb.add_param(col.repr.clone(), col.optional, v.clone());
        qb.sql.write_param(idx);
    }
    qb.sql.write_str(")");

    let no_op_col = table
        .id_cols
        .first()
        .and_then(|f| table.field_cols.get(f))
        .map(|c| quoted(&c.col_name.0))
        .unwrap_or_else(|| "0".to_owned());

    match dialect.kind() {
        sqlx::any::AnyKind::Postgres | sqlx::any::AnyKind::Sqlite => {
            qb.sql.write_str(" ON CONFLICT (");
            for (i, f) in conflict_fields.iter().enumerate() {
                if i > 0 {
                    qb.sql.write_str(", ");
                }
                let col = table.column(f).map_err(to_internal)?;
                qb.sql.write_str(&quoted(&col.col_name.0));
            }
            qb.sql.write_str(") DO ");
            if update_row.is_empty() {
                qb.sql.write_str("NOTHING");
            } else {
                qb.sql.write_str("UPDATE SET ");
                write_set_clause(&mut qb, table, update_row)?;
            }
        }
        _ => {
            qb.sql.write_str(" ON DUPLICATE KEY UPDATE ");
            if update_row.is_empty() {
                qb.sql.write_str(&format!("{no_op_col} = {no_op_col}"));
            } else {
                write_set_clause(&mut qb, table, update_row)?;
            }
        }
    }

    let can_return = want_returning && dialect.capabilities().supports_returning;
    if can_return {
        qb.sql.write_str(" RETURNING ");
        write_all_columns(&mut qb, table);
        qb.output(build_row_output(table));
    }
    Ok((qb.build(), can_return))
}

fn write_set_clause(qb: &mut QueryBuilder, table: &ModelTable, row: &Row) -> Result<()> {
    for (i, (f, v)) in row.iter().enumerate() {
        if i > 0 {
            qb.sql.write_str(", ");
        }
        let col = table.column(f).map_err(to_internal)?;
        qb.sql.write_str(&quoted(&col.col_name.0));
        qb.sql.write_str(" = ");
        let idx = qb.add_param(col.repr.clone(), col.optional, v.clone());
        qb.sql.write_param(idx);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qorm_schema::{Attr, FieldType, Provider, ProviderType, RelationInfo, ScalarType};
    use std::sync::Arc;

    fn scalar(name: &str, id: bool) -> Field {
        Field {
            name: FieldName::from(name),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id,
            unique: false,
            updated_at: false,
            default: None,
            relation: None,
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        }
    }

    fn user_schema() -> Schema {
        let id = Arc::new(scalar("id", true));
        let name = Arc::new(scalar("name", false));
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
        Schema {
            provider: Provider { type_: ProviderType::Sqlite, default_schema: None, schemas: None },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    /// `User` has-many `Post` via `Post.author`/`Post.authorId`, used to exercise nested
    /// to-many writes on `create`.
    fn user_with_posts_schema() -> Schema {
        let user_id = Arc::new(scalar("id", true));
        let posts_field = Arc::new(Field {
            name: FieldName::from("posts"),
            type_: FieldType::Relation(ModelName::from("Post")),
            array: true,
            optional: false,
            id: false,
            unique: false,
            updated_at: false,
            default: None,
            relation: Some(RelationInfo { fields: vec![], references: vec![], on_delete: None, on_update: None, opposite: Some(FieldName::from("author")), name: None }),
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
        let mut user_fields = indexmap::IndexMap::new();
        user_fields.insert(user_id.name.clone(), user_id);
        user_fields.insert(posts_field.name.clone(), posts_field);
        let user = Arc::new(Model {
            name: ModelName::from("User"),
            fields: user_fields,
            attributes: Vec::new(),
            id_fields: vec![FieldName::from("id")],
            unique_keys: Default::default(),
            computed_fields: Default::default(),
            virtual_fields: Default::default(),
            base_model: None,
            db_table: None,
            db_schema: None,
        });

        let post_id = Arc::new(scalar("id", true));
        let author_id = Arc::new(scalar("authorId", false));
        let author_field = Arc::new(Field {
            name: FieldName::from("author"),
            type_: FieldType::Relation(ModelName::from("User")),
            array: false,
            optional: false,
            id: false,
            unique: false,
            updated_at: false,
            default: None,
            relation: Some(RelationInfo {
                fields: vec![FieldName::from("authorId")],
                references: vec![FieldName::from("id")],
                on_delete: None,
                on_update: None,
                opposite: Some(FieldName::from("posts")),
                name: None,
            }),
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
        let mut post_fields = indexmap::IndexMap::new();
        post_fields.insert(post_id.name.clone(), post_id);
        post_fields.insert(author_id.name.clone(), author_id);
        post_fields.insert(author_field.name.clone(), author_field);
        let post = Arc::new(Model {
            name: ModelName::from("Post"),
            fields: post_fields,
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
        models.insert(user.name.clone(), user);
        models.insert(post.name.clone(), post);
        Schema {
            provider: Provider { type_: ProviderType::Sqlite, default_schema: None, schemas: None },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    /// `Asset` <- `RatedVideo`, `Asset` declares `@@delegate("kind")`.
    fn delegate_schema() -> Schema {
        let asset_id = Arc::new(scalar("id", true));
        let asset_kind = Arc::new(scalar("kind", false));
        let mut asset_fields = indexmap::IndexMap::new();
        asset_fields.insert(asset_id.name.clone(), asset_id);
        asset_fields.insert(asset_kind.name.clone(), asset_kind);
        let asset = Arc::new(Model {
            name: ModelName::from("Asset"),
            fields: asset_fields,
            attributes: vec![Attr {
                name: "delegate".to_owned(),
                args: vec![qorm_schema::expr::Expr::Literal(qorm_schema::expr::Literal::String("kind".to_owned()))],
            }],
            id_fields: vec![FieldName::from("id")],
            unique_keys: Default::default(),
            computed_fields: Default::default(),
            virtual_fields: Default::default(),
            base_model: None,
            db_table: None,
            db_schema: None,
        });

        let mut video_id = scalar("id", true);
        video_id.origin_model = Some(ModelName::from("Asset"));
        let mut video_kind = scalar("kind", false);
        video_kind.origin_model = Some(ModelName::from("Asset"));
        let duration = Arc::new(scalar("duration", false));
        let mut video_fields = indexmap::IndexMap::new();
        video_fields.insert(video_id.name.clone(), Arc::new(video_id));
        video_fields.insert(video_kind.name.clone(), Arc::new(video_kind));
        video_fields.insert(duration.name.clone(), duration);
        let video = Arc::new(Model {
            name: ModelName::from("RatedVideo"),
            fields: video_fields,
            attributes: Vec::new(),
            id_fields: Vec::new(),
            unique_keys: Default::default(),
            computed_fields: Default::default(),
            virtual_fields: Default::default(),
            base_model: Some(ModelName::from("Asset")),
            db_table: None,
            db_schema: None,
        });

        let mut models = indexmap::IndexMap::new();
        models.insert(asset.name.clone(), asset);
        models.insert(video.name.clone(), video);
        Schema {
            provider: Provider { type_: ProviderType::Sqlite, default_schema: None, schemas: None },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    #[test]
    fn plans_a_single_row_insert() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let data = serde_json::json!({"id": "u1", "name": "Ada"});
        let plan = plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &data).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].query.sql_text.starts_with("INSERT INTO \"User\""));
        assert_eq!(plan.steps[0].query.params.len(), 2);
    }

    #[test]
    fn update_many_without_limit_support_rejects_limit() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let args = serde_json::json!({"data": {"name": "Bea"}, "limit": 1});
        let err = plan_update_many(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &args).unwrap_err();
        assert!(matches!(err, EngineError::NotSupported(_)));
    }

    #[test]
    fn nested_create_on_a_to_many_relation_fans_out_into_a_second_insert() {
        let schema = Arc::new(user_with_posts_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let data = serde_json::json!({"id": "u1", "posts": {"create": [{"id": "p1", "title": "Hi"}]}});
        let err = plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &data).unwrap_err();
        // `Post` has no `title` field in this fixture — exercising the error path
        // confirms unknown-field detection still runs inside a nested create.
        assert!(matches!(err, EngineError::Internal(_)));

        let data = serde_json::json!({"id": "u1", "posts": {"create": [{"id": "p1"}]}});
        let plan = plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &data).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].query.sql_text.starts_with("INSERT INTO \"User\""));
        assert!(plan.steps[1].query.sql_text.starts_with("INSERT INTO \"Post\""));
        assert!(plan.steps[1].query.sql_text.contains("\"authorId\""));
    }

    #[test]
    fn nested_connect_on_a_to_many_relation_compiles_to_an_update() {
        let schema = Arc::new(user_with_posts_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let data = serde_json::json!({"id": "u1", "posts": {"connect": [{"id": "p1"}]}});
        let plan = plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &data).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[1].query.sql_text.starts_with("UPDATE \"Post\""));
    }

    #[test]
    fn owning_to_one_update_without_explicit_target_is_rejected() {
        // `Post.author` is the owning side; updating "the currently connected author"
        // needs a read qorm never performs.
        let schema = Arc::new(user_with_posts_schema());
        let post = schema.model(&ModelName::from("Post")).unwrap();
        let data = serde_json::json!({"author": {"update": {"name": "New"}}});
        let err = resolve_update_own_fields(&schema, post, &data).unwrap_err();
        assert!(matches!(err, EngineError::NotSupported(_)));
    }

    #[test]
    fn create_on_a_delegate_descendant_fans_out_to_the_ancestor_table_with_a_discriminator() {
        let schema = Arc::new(delegate_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let data = serde_json::json!({"id": "v1", "duration": "42"});
        let plan = plan_create(&schema, &layout, dialect.as_ref(), &ModelName::from("RatedVideo"), &data).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].query.sql_text.starts_with("INSERT INTO \"Asset\""));
        assert!(plan.steps[0].query.params.iter().any(|p| p.value == serde_json::json!("RatedVideo")));
        assert!(plan.steps[1].query.sql_text.starts_with("INSERT INTO \"RatedVideo\""));
        assert!(plan.steps[1].hook.is_some());
        assert!(plan.steps[0].hook.is_none());
    }

    #[test]
    fn upsert_compiles_to_a_single_on_conflict_statement() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let where_ = serde_json::json!({"id": "u1"});
        let create = serde_json::json!({"id": "u1", "name": "Ada"});
        let update = serde_json::json!({"name": "Grace"});
        let plan = plan_upsert(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &where_, &create, &update).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].query.sql_text.contains("ON CONFLICT"));
        assert!(plan.steps[0].query.sql_text.contains("DO UPDATE SET"));
    }
}
