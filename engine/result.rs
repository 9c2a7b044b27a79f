//! Post-processing applied to rows already decoded by [`crate::query::exec`]: computed
//! field evaluation, virtual field defaults, and the negative-`take` reversal the find
//! planner defers to its caller (§4.7).

use std::collections::HashMap;
use std::sync::Arc;

use qorm_schema::expr::{BinaryOp, Expr, Literal, UnaryOp};
use qorm_schema::{FieldName, Model, ModelName, Schema};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// A virtual field's computation callback (§4.7: "invoked with a shallow copy of the
/// row and a context object containing the authenticated subject"). Registered on the
/// client per `(model, field)`; fields with no registered resolver default to `null`.
pub type VirtualFieldResolver = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

#[derive(Default, Clone)]
pub struct VirtualFieldRegistry {
    resolvers: HashMap<(ModelName, FieldName), VirtualFieldResolver>,
}

impl VirtualFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, model: ModelName, field: FieldName, resolver: VirtualFieldResolver) {
        self.resolvers.insert((model, field), resolver);
    }

    fn get(&self, model: &ModelName, field: &FieldName) -> Option<&VirtualFieldResolver> {
        self.resolvers.get(&(model.clone(), field.clone()))
    }
}

/// Applies `model`'s computed and virtual fields to every row already containing its
/// scalar and relation columns, merges each delegate ancestor's own columns into the row
/// (§4.7's `__delegate_Model` merge key), and reverses row order when the plan used a
/// negative `take` (the planner flips ORDER BY/LIMIT to use the index on the correct side
/// and leaves un-reversing the final page to this layer, per §4.5 step 6).
pub fn finalize_rows(
    schema: &Schema,
    model: &Model,
    mut rows: Vec<Value>,
    reverse: bool,
    virtual_fields: &VirtualFieldRegistry,
    auth: &Value,
) -> Result<Vec<Value>> {
    for row in &mut rows {
        merge_delegate_ancestors(row);
        apply_computed_fields(schema, model, row)?;
        apply_virtual_fields(model, row, virtual_fields, auth)?;
    }
    if reverse {
        rows.reverse();
    }
    Ok(rows)
}

/// Folds every `__delegate_<Ancestor>` correlated-subquery column `find.rs` produced
/// into the row's own fields and removes the merge key, so the concrete model's row
/// carries its delegate ancestors' columns as if they were its own (§4.7).
fn merge_delegate_ancestors(row: &mut Value) {
    let Value::Object(obj) = row else {
        return;
    };
    let delegate_keys: Vec<String> = obj.keys().filter(|k| k.starts_with("__delegate_")).cloned().collect();
    for key in delegate_keys {
        if let Some(Value::Object(ancestor_fields)) = obj.remove(&key) {
            for (field, value) in ancestor_fields {
                obj.entry(field).or_insert(value);
            }
        }
    }
}

/// Computed fields carry a server-side [`Expr`] over sibling fields on the same row;
/// none of qorm's planners push them into SQL, so they are evaluated here once the row's
/// raw columns are decoded.
fn apply_computed_fields(_schema: &Schema, model: &Model, row: &mut Value) -> Result<()> {
    let Value::Object(obj) = row else {
        return Ok(());
    };
    for (name, computed) in &model.computed_fields {
        let value = eval_expr(&computed.expr, obj).map_err(|e| {
            EngineError::Internal(format!("computed field {} failed to evaluate: {e}", name.0))
        })?;
        obj.insert(name.0.clone(), value);
    }
    Ok(())
}

/// Evaluates a computed-field expression against the row's already-decoded columns.
/// Supports the subset of [`Expr`] meaningful without a relation join: literals,
/// same-row field references, the `concat` builtin, comparisons, and boolean logic.
fn eval_expr(expr: &Expr, row: &serde_json::Map<String, Value>) -> anyhow::Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(literal_to_json(lit)),
        Expr::Field { path } => {
            let [name] = path.as_slice() else {
                anyhow::bail!("computed fields may only reference same-row columns, got path {path:?}");
            };
            Ok(row.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Auth { .. } => anyhow::bail!("computed fields cannot reference auth()"),
        Expr::Call { name, args } if name == "concat" => {
            let mut out = String::new();
            for arg in args {
                match eval_expr(arg, row)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => {}
                    other => out.push_str(&other.to_string()),
                }
            }
            Ok(Value::String(out))
        }
        Expr::Call { name, .. } => anyhow::bail!("unsupported computed-field function {name:?}"),
        Expr::Binary { op, left, right } => {
            let l = eval_expr(left, row)?;
            let r = eval_expr(right, row)?;
            eval_binary(*op, l, r)
        }
        Expr::Unary { op: UnaryOp::Not, operand } => {
            let v = eval_expr(operand, row)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Expr::Array(items) => {
            let values = items.iter().map(|e| eval_expr(e, row)).collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Value::Array(values))
        }
    }
}

fn eval_binary(op: BinaryOp, l: Value, r: Value) -> anyhow::Result<Value> {
    Ok(match op {
        BinaryOp::Eq => Value::Bool(l == r),
        BinaryOp::Ne => Value::Bool(l != r),
        BinaryOp::And => Value::Bool(truthy(&l) && truthy(&r)),
        BinaryOp::Or => Value::Bool(truthy(&l) || truthy(&r)),
        BinaryOp::In => match r {
            Value::Array(items) => Value::Bool(items.contains(&l)),
            _ => anyhow::bail!("`in` requires an array right-hand side"),
        },
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                anyhow::bail!("comparison requires numeric operands");
            };
            Value::Bool(match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Lte => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::Gte => a >= b,
                _ => unreachable!(),
            })
        }
    })
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        _ => true,
    }
}

fn literal_to_json(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::from(*n),
        Literal::Float(n) => serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        Literal::String(s) => Value::String(s.clone()),
    }
}

/// Virtual fields carry no stored value; each is resolved by invoking its registered
/// computation callback with a shallow copy of the row (taken before this field, or any
/// later virtual field, is inserted) and the caller's auth context (§4.7). A virtual
/// field with no registered resolver defaults to `null`.
fn apply_virtual_fields(model: &Model, row: &mut Value, registry: &VirtualFieldRegistry, auth: &Value) -> Result<()> {
    if model.virtual_fields.is_empty() {
        return Ok(());
    }
    let shallow_copy = row.clone();
    let Value::Object(obj) = row else {
        return Ok(());
    };
    for name in model.virtual_fields.keys() {
        let value = match registry.get(&model.name, name) {
            Some(resolver) => resolver(&shallow_copy, auth)?,
            None => Value::Null,
        };
        obj.insert(name.0.clone(), value);
    }
    Ok(())
}

/// Raises [`EngineError::NotFound`] if `rows` is empty, for the `*OrThrow` family of
/// find operations.
pub fn require_one(model_name: &qorm_schema::ModelName, mut rows: Vec<Value>) -> Result<Value> {
    if rows.is_empty() {
        return Err(EngineError::not_found(model_name.0.clone()));
    }
    Ok(rows.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use qorm_schema::{ComputedField, FieldName, FieldType, ModelName, Provider, ProviderType, ScalarType, VirtualField};
    use serde_json::json;
    use std::sync::Arc;

    fn empty_schema() -> Schema {
        Schema {
            provider: Provider {
                type_: ProviderType::Sqlite,
                default_schema: None,
                schemas: None,
            },
            models: IndexMap::new(),
            enums: IndexMap::new(),
            typedefs: IndexMap::new(),
            procedures: IndexMap::new(),
        }
    }

    fn base_model() -> Model {
        Model {
            name: ModelName::from("User"),
            fields: IndexMap::new(),
            attributes: Vec::new(),
            id_fields: vec![FieldName::from("id")],
            unique_keys: IndexMap::new(),
            computed_fields: IndexMap::new(),
            virtual_fields: IndexMap::new(),
            base_model: None,
            db_table: None,
            db_schema: None,
        }
    }

    #[test]
    fn computed_field_concatenates_sibling_columns() {
        let mut model = base_model();
        model.computed_fields.insert(
            FieldName::from("fullName"),
            Arc::new(ComputedField {
                name: FieldName::from("fullName"),
                type_: FieldType::Scalar(ScalarType::String),
                expr: Expr::Call {
                    name: "concat".to_owned(),
                    args: vec![
                        Expr::Field { path: vec!["first".to_owned()] },
                        Expr::Literal(Literal::String(" ".to_owned())),
                        Expr::Field { path: vec!["last".to_owned()] },
                    ],
                },
            }),
        );
        model.virtual_fields.insert(
            FieldName::from("score"),
            Arc::new(VirtualField { name: FieldName::from("score"), type_: FieldType::Scalar(ScalarType::Int) }),
        );

        let schema = empty_schema();
        let rows = vec![json!({"first": "Ada", "last": "Lovelace"})];
        let out = finalize_rows(&schema, &model, rows, false, &VirtualFieldRegistry::new(), &Value::Null).unwrap();
        assert_eq!(out[0]["fullName"], json!("Ada Lovelace"));
        assert_eq!(out[0]["score"], Value::Null);
    }

    #[test]
    fn reverse_flag_flips_row_order() {
        let model = base_model();
        let schema = empty_schema();
        let rows = vec![json!({"id": 1}), json!({"id": 2})];
        let out = finalize_rows(&schema, &model, rows, true, &VirtualFieldRegistry::new(), &Value::Null).unwrap();
        assert_eq!(out[0]["id"], json!(2));
        assert_eq!(out[1]["id"], json!(1));
    }

    #[test]
    fn virtual_field_invokes_its_registered_resolver_with_a_row_copy_and_auth() {
        let mut model = base_model();
        model.virtual_fields.insert(
            FieldName::from("score"),
            Arc::new(VirtualField { name: FieldName::from("score"), type_: FieldType::Scalar(ScalarType::Int) }),
        );
        let schema = empty_schema();
        let mut registry = VirtualFieldRegistry::new();
        registry.register(
            model.name.clone(),
            FieldName::from("score"),
            Arc::new(|row, auth| Ok(json!(row["id"].as_i64().unwrap_or(0) + auth["bonus"].as_i64().unwrap_or(0)))),
        );
        let rows = vec![json!({"id": 41})];
        let out = finalize_rows(&schema, &model, rows, false, &registry, &json!({"bonus": 1})).unwrap();
        assert_eq!(out[0]["score"], json!(42));
    }

    #[test]
    fn delegate_ancestor_columns_are_merged_into_the_row_and_the_merge_key_is_dropped() {
        let model = base_model();
        let schema = empty_schema();
        let rows = vec![json!({"id": "v1", "__delegate_Asset": {"url": "https://example.com/v1"}})];
        let out = finalize_rows(&schema, &model, rows, false, &VirtualFieldRegistry::new(), &Value::Null).unwrap();
        assert_eq!(out[0]["url"], json!("https://example.com/v1"));
        assert!(out[0].get("__delegate_Asset").is_none());
    }

    #[test]
    fn require_one_raises_not_found_on_empty_rows() {
        let model_name = ModelName::from("User");
        let err = require_one(&model_name, Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
