//! Compiles `find*`/`count`/`exists` arguments into a single SELECT (§4.3), including a
//! `__delegate_<Ancestor>` correlated subquery per delegate ancestor so `result.rs` can
//! merge each ancestor's own columns into the row (§4.7). Aggregate rewrites and
//! `groupBy` compile in `plan_aggregate`/`plan_group_by` below.

use std::sync::Arc;

use qorm_schema::{Field, FieldName, Model, ModelName, Schema};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{EngineError, Result};
use crate::layout::{Layout, ModelTable};
use crate::qutils;
use crate::query::build::QueryBuilder;
use crate::query::{OutputExpr, Query};

/// A compiled find query plus whether the caller must reverse the returned rows.
/// `take: -n` is compiled by flipping the sort order and negating the limit so the
/// database can still use an index for the scan (§4.3 "negative take"); the planner
/// hands the reversal obligation back to the caller instead of sorting in memory.
pub struct FindPlan {
    pub query: Query,
    pub reverse_rows: bool,
}

pub fn plan_find(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model_name: &ModelName,
    args: &Value,
) -> Result<FindPlan> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let table = layout.table(model_name).map_err(to_internal)?;
    let alias = "t0";

    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("SELECT ");
    if let Some(distinct) = args.get("distinct") {
        write_distinct(&mut qb, dialect, table, distinct, alias)?;
    }

    let (projection_sql, output) = build_projection(schema, layout, dialect, model, args.get("select"), args.get("include"), alias, &mut qb)?;
    qb.sql.write_str(&projection_sql);
    qb.sql.write_str(" FROM ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(&format!(" AS {alias}"));

    if let Some(where_) = args.get("where") {
        let clause = build_where(schema, layout, dialect, model, where_, alias, &mut qb)?;
        if !clause.is_empty() {
            qb.sql.write_str(" WHERE ");
            qb.sql.write_str(&clause);
        }
    }

    let take_negative = args.get("take").and_then(Value::as_i64).map(|t| t < 0).unwrap_or(false);
    let order_items = order_by_items(args.get("orderBy"));
    let order_clause = build_order_by(table, &order_items, take_negative)?;
    if !order_clause.is_empty() {
        qb.sql.write_str(" ORDER BY ");
        qb.sql.write_str(&order_clause);
    }

    if let Some(take) = args.get("take").and_then(Value::as_i64) {
        qb.sql.write_str(&format!(" LIMIT {}", take.unsigned_abs()));
    }
    if let Some(skip) = args.get("skip").and_then(Value::as_i64) {
        if skip > 0 {
            qb.sql.write_str(&format!(" OFFSET {skip}"));
        }
    }

    qb.output(output);
    Ok(FindPlan {
        query: qb.build(),
        reverse_rows: take_negative,
    })
}

const AGG_FNS: &[&str] = &["_avg", "_sum", "_min", "_max"];

/// Compiles `count`/`aggregate` arguments into a single-row SELECT of scalar aggregate
/// expressions (§4.3). `count({select:{_all:true, name:true}})` and
/// `aggregate({_avg:{age:true}, ...})` share this compiler: both name a set of
/// `COUNT`/`AVG`/`SUM`/`MIN`/`MAX` projections, keyed by which top-level key they were
/// requested under.
pub fn plan_aggregate(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<Query> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let table = layout.table(model_name).map_err(to_internal)?;
    let alias = "t0";

    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("SELECT ");
    let (projection_sql, output) = build_aggregate_projection(table, args, alias)?;
    qb.sql.write_str(&projection_sql);
    qb.sql.write_str(" FROM ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(&format!(" AS {alias}"));

    if let Some(where_) = args.get("where") {
        let clause = build_where(schema, layout, dialect, model, where_, alias, &mut qb)?;
        if !clause.is_empty() {
            qb.sql.write_str(" WHERE ");
            qb.sql.write_str(&clause);
        }
    }

    qb.output(output);
    Ok(qb.build())
}

/// Compiles `groupBy` arguments into a `GROUP BY <by>` SELECT whose projection is the
/// grouping columns followed by whichever `_count`/`_avg`/`_sum`/`_min`/`_max`
/// aggregates the caller asked for, with `having` compiled as a SQL `HAVING` clause over
/// those same aggregate expressions (§4.3).
pub fn plan_group_by(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model_name: &ModelName, args: &Value) -> Result<Query> {
    let model = schema.model(model_name).map_err(to_internal)?;
    let table = layout.table(model_name).map_err(to_internal)?;
    let alias = "t0";

    let by: Vec<FieldName> = args
        .get("by")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::input_validation("$.by", "groupBy requires a non-empty array of field names"))?
        .iter()
        .filter_map(Value::as_str)
        .map(FieldName::from)
        .collect();
    if by.is_empty() {
        return Err(EngineError::input_validation("$.by", "groupBy requires a non-empty array of field names"));
    }

    let mut qb = QueryBuilder::new(dialect.kind());
    qb.sql.write_str("SELECT ");

    let mut sql_parts = Vec::new();
    let mut fields = Vec::new();
    for field_name in &by {
        push_scalar_column(table, field_name, alias, &mut sql_parts, &mut fields)?;
    }
    let (agg_sql, agg_fields) = build_aggregate_columns(table, args, alias, sql_parts.len())?;
    sql_parts.extend(agg_sql);
    fields.extend(agg_fields);

    qb.sql.write_str(&sql_parts.join(", "));
    qb.sql.write_str(" FROM ");
    qb.sql.write_table_name(table);
    qb.sql.write_str(&format!(" AS {alias}"));

    if let Some(where_) = args.get("where") {
        let clause = build_where(schema, layout, dialect, model, where_, alias, &mut qb)?;
        if !clause.is_empty() {
            qb.sql.write_str(" WHERE ");
            qb.sql.write_str(&clause);
        }
    }

    qb.sql.write_str(" GROUP BY ");
    let group_cols: Result<Vec<String>> = by
        .iter()
        .map(|f| table.column(f).map(|c| format!("{alias}.{}", quoted(&c.col_name.0))).map_err(to_internal))
        .collect();
    qb.sql.write_str(&group_cols?.join(", "));

    if let Some(having) = args.get("having") {
        let clause = build_having(table, having, alias, &mut qb)?;
        if !clause.is_empty() {
            qb.sql.write_str(" HAVING ");
            qb.sql.write_str(&clause);
        }
    }

    let order_items = order_by_items(args.get("orderBy"));
    for item in &order_items {
        if !by.contains(&item.field) {
            return Err(EngineError::input_validation("$.orderBy", "groupBy's orderBy fields must be among its by fields"));
        }
    }
    let order_clause = build_order_by(table, &order_items, false)?;
    if !order_clause.is_empty() {
        qb.sql.write_str(" ORDER BY ");
        qb.sql.write_str(&order_clause);
    }

    qb.output(OutputExpr::Object(fields));
    Ok(qb.build())
}

fn agg_sql_fn(key: &str) -> &'static str {
    match key {
        "_avg" => "AVG",
        "_sum" => "SUM",
        "_min" => "MIN",
        "_max" => "MAX",
        _ => "COUNT",
    }
}

fn agg_repr(key: &str, col_repr: &crate::layout::ColumnRepr) -> crate::layout::ColumnRepr {
    use crate::layout::ColumnRepr;
    match key {
        "_avg" => ColumnRepr::Float,
        "_count" => ColumnRepr::Int,
        _ => col_repr.clone(),
    }
}

/// Builds the `key, expr, key, expr, ...` style projection (flat, for `count`/`aggregate`)
/// alongside a nested [`OutputExpr::Object`] per top-level key (`_count`, `_avg`, ...), so
/// the result decodes to `{_count: {...}, _avg: {...}, ...}`.
fn build_aggregate_projection(table: &ModelTable, args: &Value, alias: &str) -> Result<(String, OutputExpr)> {
    let (sql_parts, fields) = build_aggregate_columns(table, args, alias, 0)?;
    if sql_parts.is_empty() {
        return Err(EngineError::input_validation("$", "count/aggregate requires at least one of _count/_avg/_sum/_min/_max"));
    }
    Ok((sql_parts.join(", "), OutputExpr::Object(fields)))
}

/// Shared column-building core for `build_aggregate_projection` and `plan_group_by`'s
/// trailing aggregate columns. `col_idx_base` offsets the decoded column indices past
/// whatever non-aggregate columns (e.g. `groupBy`'s `by` fields) already occupy the
/// projection.
fn build_aggregate_columns(table: &ModelTable, args: &Value, alias: &str, col_idx_base: usize) -> Result<(Vec<String>, Vec<(String, OutputExpr)>)> {
    let mut sql_parts = Vec::new();
    let mut fields = Vec::new();

    if let Some(count) = args.get("_count") {
        let mut inner = Vec::new();
        match count {
            Value::Bool(true) => {
                let col_idx = col_idx_base + sql_parts.len();
                sql_parts.push("COUNT(*) AS _all".to_owned());
                inner.push(("_all".to_owned(), OutputExpr::Field { repr: crate::layout::ColumnRepr::Int, optional: false, col_idx }));
            }
            Value::Object(obj) => {
                for (name, flag) in obj {
                    if flag != &Value::Bool(true) {
                        continue;
                    }
                    if name == "_all" {
                        let col_idx = col_idx_base + sql_parts.len();
                        sql_parts.push("COUNT(*) AS _all".to_owned());
                        inner.push(("_all".to_owned(), OutputExpr::Field { repr: crate::layout::ColumnRepr::Int, optional: false, col_idx }));
                        continue;
                    }
                    let field_name = FieldName::from(name.as_str());
                    let col = table.column(&field_name).map_err(to_internal)?;
                    let col_idx = col_idx_base + sql_parts.len();
                    sql_parts.push(format!("COUNT({alias}.{})", quoted(&col.col_name.0)));
                    inner.push((name.clone(), OutputExpr::Field { repr: crate::layout::ColumnRepr::Int, optional: false, col_idx }));
                }
            }
            _ => return Err(EngineError::input_validation("$._count", "must be true or an object of field flags")),
        }
        fields.push(("_count".to_owned(), OutputExpr::Object(inner)));
    }

    for key in AGG_FNS {
        let Some(spec) = args.get(key) else { continue };
        let obj = spec.as_object().ok_or_else(|| EngineError::input_validation("$", format!("{key} must be an object of field flags")))?;
        let mut inner = Vec::new();
        for (name, flag) in obj {
            if flag != &Value::Bool(true) {
                continue;
            }
            let field_name = FieldName::from(name.as_str());
            let col = table.column(&field_name).map_err(to_internal)?;
            let col_idx = col_idx_base + sql_parts.len();
            sql_parts.push(format!("{}({alias}.{})", agg_sql_fn(key), quoted(&col.col_name.0)));
            inner.push((name.clone(), OutputExpr::Field { repr: agg_repr(key, &col.repr), optional: true, col_idx }));
        }
        fields.push((key.to_owned(), OutputExpr::Object(inner)));
    }

    Ok((sql_parts, fields))
}

/// Compiles a `having` object (shaped like `_avg`/`_sum`/etc. aggregate selections, but
/// with scalar filter operators in place of `true`) into a boolean SQL expression over
/// the same aggregate expressions `build_aggregate_columns` would project.
fn build_having(table: &ModelTable, having: &Value, alias: &str, qb: &mut QueryBuilder) -> Result<String> {
    let obj = having.as_object().ok_or_else(|| EngineError::input_validation("$.having", "must be an object"))?;
    let mut predicates = Vec::new();
    for (key, spec) in obj {
        if key == "_count" || AGG_FNS.contains(&key.as_str()) {
            let fields = spec.as_object().ok_or_else(|| EngineError::input_validation("$.having", format!("{key} must be an object")))?;
            for (name, filter) in fields {
                let field_name = FieldName::from(name.as_str());
                let col = table.column(&field_name).map_err(to_internal)?;
                let expr = if key == "_count" {
                    format!("COUNT({alias}.{})", quoted(&col.col_name.0))
                } else {
                    format!("{}({alias}.{})", agg_sql_fn(key), quoted(&col.col_name.0))
                };
                let ops: Vec<(&str, &Value)> = match filter.as_object() {
                    Some(o) => o.iter().map(|(k, v)| (k.as_str(), v)).collect(),
                    None => vec![("equals", filter)],
                };
                for (op, operand) in ops {
                    let idx = qb.add_param(agg_repr(key, &col.repr), true, operand.clone());
                    let placeholder = param_placeholder(qb, idx);
                    predicates.push(match op {
                        "equals" => format!("{expr} = {placeholder}"),
                        "not" => format!("{expr} != {placeholder}"),
                        "lt" => format!("{expr} < {placeholder}"),
                        "lte" => format!("{expr} <= {placeholder}"),
                        "gt" => format!("{expr} > {placeholder}"),
                        "gte" => format!("{expr} >= {placeholder}"),
                        other => return Err(EngineError::not_supported(format!("having operator {other:?}"))),
                    });
                }
            }
        } else {
            return Err(EngineError::input_validation("$.having", format!("unknown aggregate key {key:?}")));
        }
    }
    Ok(predicates.join(" AND "))
}

/// Validates that `where` names exactly the fields of one of `model`'s unique keys, as
/// `findUnique`/`findUniqueOrThrow` require (§4.1).
pub fn validate_unique_where(model: &Model, where_: &Value) -> Result<()> {
    let Some(obj) = where_.as_object() else {
        return Err(EngineError::input_validation("$.where", "must be an object"));
    };
    let names: Vec<FieldName> = obj.keys().map(|k| FieldName::from(k.as_str())).collect();
    if model.is_id_field_set(&names) || model.unique_key_for(&names).is_some() {
        return Ok(());
    }
    Err(EngineError::input_validation("$.where", "must identify a unique key of the model"))
}

fn to_internal(e: anyhow::Error) -> EngineError {
    EngineError::Internal(e.to_string())
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn write_distinct(qb: &mut QueryBuilder, dialect: &dyn Dialect, table: &ModelTable, distinct: &Value, alias: &str) -> Result<()> {
    let fields: Vec<&str> = match distinct {
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        Value::String(s) => vec![s.as_str()],
        _ => return Err(EngineError::input_validation("$.distinct", "must be a string or array of strings")),
    };
    if dialect.capabilities().supports_distinct_on {
        qb.sql.write_str("DISTINCT ON (");
        for (i, name) in fields.iter().enumerate() {
            if i > 0 {
                qb.sql.write_str(", ");
            }
            let col = table.column(&FieldName::from(*name)).map_err(to_internal)?;
            qb.sql.write_str(&format!("{alias}.{}", quoted(&col.col_name.0)));
        }
        qb.sql.write_str(") ");
    } else {
        qb.sql.write_str("DISTINCT ");
    }
    Ok(())
}

/// The equi-join predicate correlating a relation's child rows (`child_alias`) back to
/// the parent row currently being projected (`parent_alias`), independent of which side
/// of the relation owns the foreign key.
fn correlation_predicate(
    schema: &Schema,
    layout: &Layout,
    parent_model: &Model,
    field: &Field,
    parent_alias: &str,
    child_alias: &str,
) -> Result<String> {
    let pairs = qutils::join_pairs(schema, parent_model, field).map_err(to_internal)?;
    let target = qutils::target_model(schema, field).map_err(to_internal)?;
    let target_table = layout.table(&target.name).map_err(to_internal)?;
    let parent_table = layout.table(&parent_model.name).map_err(to_internal)?;

    let predicates = pairs
        .iter()
        .map(|(owning_field, referenced_field)| {
            let (child_field, parent_field) = if field.is_owning_relation() {
                (referenced_field, owning_field)
            } else {
                (owning_field, referenced_field)
            };
            let child_col = target_table.column(child_field).map_err(to_internal)?.col_name.0.clone();
            let parent_col = parent_table.column(parent_field).map_err(to_internal)?.col_name.0.clone();
            Ok(format!("{child_alias}.{} = {parent_alias}.{}", quoted(&child_col), quoted(&parent_col)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(predicates.join(" AND "))
}

/// Builds the projection list and its matching [`OutputExpr`] tree for the outermost
/// query. `select`/`include` are validated mutually exclusive upstream (§4.1); `select`
/// replaces the default scalar-field set, `include` adds to it.
fn build_projection(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model: &Model,
    select: Option<&Value>,
    include: Option<&Value>,
    alias: &str,
    qb: &mut QueryBuilder,
) -> Result<(String, OutputExpr)> {
    let table = layout.table(&model.name).map_err(to_internal)?;
    let mut sql_parts = Vec::new();
    let mut fields = Vec::new();

    let mut err = None;
    if let Some(select) = select {
        crate::visit::walk_read_fields(
            select,
            |name| !table.field_cols.contains_key(&FieldName::from(name)),
            |name, _spec| {
                if err.is_none() {
                    if let Err(e) = push_scalar_column(table, &FieldName::from(name), alias, &mut sql_parts, &mut fields) {
                        err = Some(e);
                    }
                }
            },
            |name, spec| {
                if err.is_none() {
                    if let Err(e) = push_relation_column(schema, layout, dialect, model, name, spec, alias, qb, &mut sql_parts, &mut fields) {
                        err = Some(e);
                    }
                }
            },
        )
        .ok_or_else(|| EngineError::input_validation("$.select", "must be an object"))?;
    } else {
        for field_name in table.field_cols.keys() {
            push_scalar_column(table, field_name, alias, &mut sql_parts, &mut fields)?;
        }
        if let Some(include) = include {
            crate::visit::walk_read_fields(
                include,
                |_| true,
                |_, _| {}
                ,
                |name, spec| {
                    if err.is_none() {
                        if let Err(e) = push_relation_column(schema, layout, dialect, model, name, spec, alias, qb, &mut sql_parts, &mut fields) {
                            err = Some(e);
                        }
                    }
                },
            )
            .ok_or_else(|| EngineError::input_validation("$.include", "must be an object"))?;
        }
    }
    if let Some(e) = err {
        return Err(e);
    }

    for ancestor in qutils::ancestor_chain(schema, model) {
        let nested_sql = build_delegate_ancestor_subquery(schema, layout, dialect, table, ancestor, alias, qb)?;
        let col_idx = sql_parts.len();
        sql_parts.push(nested_sql);
        fields.push((format!("__delegate_{}", ancestor.name.0), OutputExpr::RawJson { col_idx }));
    }

    if sql_parts.is_empty() {
        return Err(EngineError::input_validation("$.select", "selection produced no columns"));
    }
    Ok((sql_parts.join(", "), OutputExpr::Object(fields)))
}

fn push_scalar_column(
    table: &ModelTable,
    field_name: &FieldName,
    alias: &str,
    sql_parts: &mut Vec<String>,
    fields: &mut Vec<(String, OutputExpr)>,
) -> Result<()> {
    let col = table.column(field_name).map_err(to_internal)?;
    let col_idx = sql_parts.len();
    sql_parts.push(format!("{alias}.{}", quoted(&col.col_name.0)));
    fields.push((
        field_name.0.clone(),
        OutputExpr::Field {
            repr: col.repr.clone(),
            optional: col.optional,
            col_idx,
        },
    ));
    Ok(())
}

fn push_relation_column(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model: &Model,
    name: &str,
    spec: &Value,
    parent_alias: &str,
    qb: &mut QueryBuilder,
    sql_parts: &mut Vec<String>,
    fields: &mut Vec<(String, OutputExpr)>,
) -> Result<()> {
    let col_idx = sql_parts.len();
    let sql = build_relation_subquery(schema, layout, dialect, model, name, spec, parent_alias, qb)?;
    sql_parts.push(sql);
    fields.push((name.to_owned(), OutputExpr::RawJson { col_idx }));
    Ok(())
}

/// Builds the correlated-subquery SQL text for relation field `name` on `model`,
/// including any relations nested inside it — those are inlined as further correlated
/// subqueries inside the same `json_object_fn` call, so the whole column decodes as one
/// self-contained JSON document with no further Rust-side reconstruction (§4.2).
fn build_relation_subquery(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model: &Model,
    name: &str,
    spec: &Value,
    parent_alias: &str,
    qb: &mut QueryBuilder,
) -> Result<String> {
    let field_name = FieldName::from(name);
    let field = model.field(&field_name).map_err(to_internal)?;
    if !field.is_relation() {
        return Err(EngineError::input_validation("$.select", format!("{name:?} is not a relation")));
    }
    let target = qutils::target_model(schema, field).map_err(to_internal)?;
    let target_table = layout.table(&target.name).map_err(to_internal)?;
    let child_alias = format!("{parent_alias}_{name}");

    let inner_columns_sql = build_object_columns(schema, layout, dialect, target, target_table, spec.get("select"), spec.get("include"), &child_alias, qb)?;
    let correlation_sql = correlation_predicate(schema, layout, model, field, parent_alias, &child_alias)?;
    let where_sql = spec
        .get("where")
        .map(|w| build_where(schema, layout, dialect, target, w, &child_alias, qb))
        .transpose()?;
    let order_items = order_by_items(spec.get("orderBy"));
    let order_by_clause = build_order_by_aliased(target_table, &order_items, &child_alias)?;
    let limit_sql = spec.get("take").and_then(Value::as_i64).map(|t| format!("LIMIT {}", t.unsigned_abs()));

    Ok(dialect.build_relation_selection(
        &target_table.qualified_name(dialect.kind()),
        &child_alias,
        &inner_columns_sql,
        &correlation_sql,
        where_sql.as_deref(),
        if order_by_clause.is_empty() { None } else { Some(order_by_clause.as_str()) },
        limit_sql.as_deref(),
        field.is_to_many(),
    ))
}

/// Builds the `'key', expr, 'key', expr, ...` argument list for a relation's inner
/// `json_object_fn()` call.
fn build_object_columns(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    model: &Model,
    table: &ModelTable,
    select: Option<&Value>,
    include: Option<&Value>,
    alias: &str,
    qb: &mut QueryBuilder,
) -> Result<String> {
    let mut parts = Vec::new();
    let mut err = None;

    if let Some(select) = select {
        crate::visit::walk_read_fields(
            select,
            |name| !table.field_cols.contains_key(&FieldName::from(name)),
            |name, _spec| {
                if err.is_none() {
                    if let Err(e) = push_scalar(table, &FieldName::from(name), alias, &mut parts) {
                        err = Some(e);
                    }
                }
            },
            |name, spec| {
                if err.is_none() {
                    match build_relation_subquery(schema, layout, dialect, model, name, spec, alias, qb) {
                        Ok(nested_sql) => parts.push(format!("'{name}', {nested_sql}")),
                        Err(e) => err = Some(e),
                    }
                }
            },
        )
        .ok_or_else(|| EngineError::input_validation("$.select", "must be an object"))?;
    } else {
        for field_name in table.field_cols.keys() {
            push_scalar(table, field_name, alias, &mut parts)?;
        }
        if let Some(include) = include {
            crate::visit::walk_read_fields(
                include,
                |_| true,
                |_, _| {},
                |name, spec| {
                    if err.is_none() {
                        match build_relation_subquery(schema, layout, dialect, model, name, spec, alias, qb) {
                            Ok(nested_sql) => parts.push(format!("'{name}', {nested_sql}")),
                            Err(e) => err = Some(e),
                        }
                    }
                },
            )
            .ok_or_else(|| EngineError::input_validation("$.include", "must be an object"))?;
        }
    }
    if let Some(e) = err {
        return Err(e);
    }

    for ancestor in qutils::ancestor_chain(schema, model) {
        let nested_sql = build_delegate_ancestor_subquery(schema, layout, dialect, table, ancestor, alias, qb)?;
        parts.push(format!("'__delegate_{}', {nested_sql}", ancestor.name.0));
    }

    Ok(parts.join(", "))
}

fn push_scalar(table: &ModelTable, field_name: &FieldName, alias: &str, parts: &mut Vec<String>) -> Result<()> {
    let col = table.column(field_name).map_err(to_internal)?;
    parts.push(format!("'{}', {alias}.{}", field_name.0, quoted(&col.col_name.0)));
    Ok(())
}

/// Builds the correlated-subquery column that carries one delegate ancestor's own
/// scalar columns as a nested JSON object, joined to the descendant row by the id
/// columns they share (§4.7's `__delegate_Model` merge key, consumed by `result.rs`).
fn build_delegate_ancestor_subquery(
    schema: &Schema,
    layout: &Layout,
    dialect: &dyn Dialect,
    table: &ModelTable,
    ancestor: &Model,
    alias: &str,
    qb: &mut QueryBuilder,
) -> Result<String> {
    let ancestor_table = layout.table(&ancestor.name).map_err(to_internal)?;
    let child_alias = format!("{alias}_deleg_{}", ancestor.name.0);

    let mut inner_parts = Vec::new();
    for field_name in ancestor_table.field_cols.keys() {
        push_scalar(ancestor_table, field_name, &child_alias, &mut inner_parts)?;
    }
    let inner_columns_sql = inner_parts.join(", ");

    let mut correlation_parts = Vec::new();
    for id_field in &table.id_cols {
        let parent_col = table.column(id_field).map_err(to_internal)?;
        let ancestor_col = ancestor_table.column(id_field).map_err(to_internal)?;
        correlation_parts.push(format!(
            "{child_alias}.{} = {alias}.{}",
            quoted(&ancestor_col.col_name.0),
            quoted(&parent_col.col_name.0)
        ));
    }
    let _ = schema;

    Ok(dialect.build_relation_selection(
        &ancestor_table.qualified_name(dialect.kind()),
        &child_alias,
        &inner_columns_sql,
        &correlation_parts.join(" AND "),
        None,
        None,
        None,
        false,
    ))
}

struct OrderItem {
    field: FieldName,
    descending: bool,
}

fn order_by_items(order_by: Option<&Value>) -> Vec<OrderItem> {
    let entries: Vec<&Value> = match order_by {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    };
    let mut items = Vec::new();
    for entry in entries {
        if let Some(obj) = entry.as_object() {
            for (field, dir) in obj {
                items.push(OrderItem {
                    field: FieldName::from(field.as_str()),
                    descending: dir.as_str() == Some("desc"),
                });
            }
        }
    }
    items
}

fn build_order_by(table: &ModelTable, items: &[OrderItem], flip: bool) -> Result<String> {
    build_order_by_with(table, items, "t0", flip)
}

fn build_order_by_aliased(table: &ModelTable, items: &[OrderItem], alias: &str) -> Result<String> {
    build_order_by_with(table, items, alias, false)
}

fn build_order_by_with(table: &ModelTable, items: &[OrderItem], alias: &str, flip: bool) -> Result<String> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let col = table.column(&item.field).map_err(to_internal)?;
        let descending = item.descending ^ flip;
        parts.push(format!("{alias}.{} {}", quoted(&col.col_name.0), if descending { "DESC" } else { "ASC" }));
    }
    Ok(parts.join(", "))
}

/// Compiles a `where` object into a boolean SQL expression (without the leading
/// `WHERE `), binding scalar literals as parameters on `qb` and expanding relation
/// filters into `EXISTS`/`NOT EXISTS` subqueries (§4.2).
fn build_where(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, where_: &Value, alias: &str, qb: &mut QueryBuilder) -> Result<String> {
    let Some(obj) = where_.as_object() else {
        return Err(EngineError::input_validation("$.where", "must be an object"));
    };
    let mut predicates = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "AND" | "OR" => {
                let arr = value.as_array().ok_or_else(|| EngineError::input_validation("$.where", format!("{key} must be an array")))?;
                let mut parts = Vec::with_capacity(arr.len());
                for item in arr {
                    parts.push(format!("({})", build_where(schema, layout, dialect, model, item, alias, qb)?));
                }
                let joiner = if key == "AND" { " AND " } else { " OR " };
                if !parts.is_empty() {
                    predicates.push(format!("({})", parts.join(joiner)));
                }
            }
            "NOT" => {
                predicates.push(format!("NOT ({})", build_where(schema, layout, dialect, model, value, alias, qb)?));
            }
            "$expr" => {
                return Err(EngineError::not_supported(
                    "$expr filters (this client takes JSON payloads with no SQL expression builder callback surface to invoke)",
                ));
            }
            _ => {
                let field_name = FieldName::from(key.as_str());
                let field = model.field(&field_name).map_err(to_internal)?;
                if field.is_relation() {
                    predicates.push(build_relation_where(schema, layout, dialect, model, field, value, alias, qb)?);
                } else {
                    predicates.push(build_scalar_predicate(layout, model, &field_name, value, alias, qb)?);
                }
            }
        }
    }
    Ok(predicates.join(" AND "))
}

const SCALAR_FILTER_OPS: &[&str] = &["equals", "not", "in", "notIn", "lt", "lte", "gt", "gte", "contains", "startsWith", "endsWith"];

fn build_scalar_predicate(layout: &Layout, model: &Model, field_name: &FieldName, value: &Value, alias: &str, qb: &mut QueryBuilder) -> Result<String> {
    let table = layout.table(&model.name).map_err(to_internal)?;
    let col = table.column(field_name).map_err(to_internal)?;
    let col_ref = format!("{alias}.{}", quoted(&col.col_name.0));
    let insensitive = value.get("mode").and_then(Value::as_str) == Some("insensitive");
    let lhs = if insensitive { format!("LOWER({col_ref})") } else { col_ref.clone() };

    let ops: Vec<(&str, &Value)> = match value.as_object() {
        Some(obj) if obj.keys().any(|k| SCALAR_FILTER_OPS.contains(&k.as_str())) => {
            obj.iter().filter(|(k, _)| *k != "mode").map(|(k, v)| (k.as_str(), v)).collect()
        }
        _ => vec![("equals", value)],
    };

    let mut parts = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let rhs = |qb: &mut QueryBuilder, v: &Value| -> String {
            let idx = qb.add_param(col.repr.clone(), col.optional, v.clone());
            let mut text = String::new();
            if insensitive {
                text.push_str("LOWER(");
            }
            text.push_str(&param_placeholder(qb, idx));
            if insensitive {
                text.push(')');
            }
            text
        };
        let clause = match op {
            "equals" if operand.is_null() => format!("{col_ref} IS NULL"),
            "equals" => format!("{lhs} = {}", rhs(qb, operand)),
            "not" if operand.is_null() => format!("{col_ref} IS NOT NULL"),
            "not" => format!("{lhs} != {}", rhs(qb, operand)),
            "lt" => format!("{lhs} < {}", rhs(qb, operand)),
            "lte" => format!("{lhs} <= {}", rhs(qb, operand)),
            "gt" => format!("{lhs} > {}", rhs(qb, operand)),
            "gte" => format!("{lhs} >= {}", rhs(qb, operand)),
            "contains" => format!("{lhs} LIKE {}", like_param(qb, &col.repr, col.optional, operand, insensitive, "%{}%")),
            "startsWith" => format!("{lhs} LIKE {}", like_param(qb, &col.repr, col.optional, operand, insensitive, "{}%")),
            "endsWith" => format!("{lhs} LIKE {}", like_param(qb, &col.repr, col.optional, operand, insensitive, "%{}")),
            "in" | "notIn" => {
                let items = operand.as_array().ok_or_else(|| EngineError::input_validation("$.where", format!("{op} expects an array")))?;
                let placeholders: Vec<String> = items.iter().map(|v| rhs(qb, v)).collect();
                let negate = if op == "notIn" { "NOT " } else { "" };
                if placeholders.is_empty() {
                    if op == "notIn" { "1 = 1".to_owned() } else { "1 = 0".to_owned() }
                } else {
                    format!("{negate}{lhs} IN ({})", placeholders.join(", "))
                }
            }
            other => return Err(EngineError::not_supported(format!("filter operator {other:?}"))),
        };
        parts.push(clause);
    }
    Ok(parts.join(" AND "))
}

fn like_param(qb: &mut QueryBuilder, repr: &crate::layout::ColumnRepr, optional: bool, value: &Value, insensitive: bool, pattern: &str) -> String {
    let escaped = value.as_str().unwrap_or_default().replace('%', "\\%").replace('_', "\\_");
    let literal = Value::String(pattern.replace("{}", &escaped));
    let idx = qb.add_param(repr.clone(), optional, literal);
    if insensitive {
        format!("LOWER({})", param_placeholder(qb, idx))
    } else {
        param_placeholder(qb, idx)
    }
}

fn param_placeholder(qb: &QueryBuilder, idx: usize) -> String {
    match qb.sql.kind() {
        sqlx::any::AnyKind::Sqlite => format!("?{}", idx + 1),
        sqlx::any::AnyKind::Postgres => format!("${}", idx + 1),
        sqlx::any::AnyKind::MySql => "?".to_owned(),
        _ => format!("?{}", idx + 1),
    }
}

fn build_relation_where(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, field: &Field, value: &Value, parent_alias: &str, qb: &mut QueryBuilder) -> Result<String> {
    let Some(obj) = value.as_object() else {
        return Err(EngineError::input_validation("$.where", "relation filter must be an object"));
    };
    let target = qutils::target_model(schema, field).map_err(to_internal)?;
    let target_table = layout.table(&target.name).map_err(to_internal)?;
    let child_alias = format!("{parent_alias}_{}", field.name.0);
    let correlation = correlation_predicate(schema, layout, model, field, parent_alias, &child_alias)?;

    let (op, nested) = obj.iter().next().ok_or_else(|| EngineError::input_validation("$.where", "empty relation filter"))?;
    let nested_clause = if nested.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        build_where(schema, layout, dialect, target, nested, &child_alias, qb)?
    } else {
        "1 = 1".to_owned()
    };
    let table_ref = format!("{} AS {child_alias}", target_table.qualified_name(dialect.kind()));

    Ok(match op.as_str() {
        "is" => format!("EXISTS (SELECT 1 FROM {table_ref} WHERE {correlation} AND ({nested_clause}))"),
        "isNot" => format!("NOT EXISTS (SELECT 1 FROM {table_ref} WHERE {correlation} AND ({nested_clause}))"),
        "some" => format!("EXISTS (SELECT 1 FROM {table_ref} WHERE {correlation} AND ({nested_clause}))"),
        "none" => format!("NOT EXISTS (SELECT 1 FROM {table_ref} WHERE {correlation} AND ({nested_clause}))"),
        "every" => format!("NOT EXISTS (SELECT 1 FROM {table_ref} WHERE {correlation} AND NOT ({nested_clause}))"),
        other => return Err(EngineError::not_supported(format!("relation filter operator {other:?}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qorm_schema::{FieldType, Provider, ProviderType, ScalarType};
    use std::sync::Arc as StdArc;

    fn user_schema() -> Schema {
        let id = StdArc::new(Field {
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
        let name = StdArc::new(Field {
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
        let model = StdArc::new(Model {
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

    #[test]
    fn plans_a_plain_select_over_all_scalar_columns() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let plan = plan_find(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &serde_json::json!({})).unwrap();
        assert!(plan.query.sql_text.contains("SELECT"));
        assert!(plan.query.sql_text.contains("FROM \"User\" AS t0"));
        assert!(!plan.reverse_rows);
    }

    #[test]
    fn rejects_where_that_does_not_name_a_unique_key() {
        let schema = user_schema();
        let model = schema.model(&ModelName::from("User")).unwrap();
        let err = validate_unique_where(model, &serde_json::json!({"name": "a"})).unwrap_err();
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }

    #[test]
    fn negative_take_flips_order_and_sets_reverse_flag() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let args = serde_json::json!({"orderBy": {"name": "asc"}, "take": -2});
        let plan = plan_find(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &args).unwrap();
        assert!(plan.reverse_rows);
        assert!(plan.query.sql_text.contains("DESC"));
        assert!(plan.query.sql_text.contains("LIMIT 2"));
    }

    #[test]
    fn simple_equality_where_binds_one_param() {
        let schema = Arc::new(user_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let args = serde_json::json!({"where": {"name": "bob"}});
        let plan = plan_find(&schema, &layout, dialect.as_ref(), &ModelName::from("User"), &args).unwrap();
        assert_eq!(plan.query.params.len(), 1);
        assert!(plan.query.sql_text.contains("WHERE"));
    }
}
