//! Compiles schema-derived shape descriptors per (operation, model) and validates
//! caller payloads against them (§4.1). The "shape" compiled and cached here is a
//! per-model partition of field names into scalar/enum, relation, virtual, and computed
//! buckets — cheap to build, and everything an operation-specific check needs to decide
//! whether a payload key is legal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use qorm_schema::{FieldName, Model, ModelName, Schema};
use serde_json::Value;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Create,
    CreateMany,
    CreateManyAndReturn,
    Update,
    UpdateMany,
    UpdateManyAndReturn,
    Upsert,
    Delete,
    DeleteMany,
    Count,
    Aggregate,
    GroupBy,
    Exists,
}

impl Operation {
    fn is_write(self) -> bool {
        matches!(
            self,
            Operation::Create
                | Operation::CreateMany
                | Operation::CreateManyAndReturn
                | Operation::Update
                | Operation::UpdateMany
                | Operation::UpdateManyAndReturn
                | Operation::Upsert
                | Operation::Delete
                | Operation::DeleteMany
        )
    }

    fn has_selection(self) -> bool {
        matches!(
            self,
            Operation::FindUnique
                | Operation::FindUniqueOrThrow
                | Operation::FindFirst
                | Operation::FindFirstOrThrow
                | Operation::FindMany
                | Operation::Create
                | Operation::CreateManyAndReturn
                | Operation::Update
                | Operation::UpdateManyAndReturn
                | Operation::Upsert
                | Operation::Delete
        )
    }
}

#[derive(Debug, Default)]
struct FieldClasses {
    scalar_or_enum: HashSet<FieldName>,
    relation: HashSet<FieldName>,
    virtual_fields: HashSet<FieldName>,
    computed: HashSet<FieldName>,
}

impl FieldClasses {
    fn build(model: &Model) -> Self {
        let mut classes = FieldClasses::default();
        for field in model.fields.values() {
            if field.is_relation() {
                classes.relation.insert(field.name.clone());
            } else {
                classes.scalar_or_enum.insert(field.name.clone());
            }
        }
        classes.virtual_fields = model.virtual_fields.keys().cloned().collect();
        classes.computed = model.computed_fields.keys().cloned().collect();
        classes
    }

    fn is_known(&self, name: &str) -> bool {
        let name = FieldName::from(name);
        self.scalar_or_enum.contains(&name)
            || self.relation.contains(&name)
            || self.virtual_fields.contains(&name)
            || self.computed.contains(&name)
    }
}

const STRING_FILTER_KEYS: &[&str] = &[
    "equals", "not", "in", "notIn", "lt", "lte", "gt", "gte", "contains", "startsWith", "endsWith", "mode",
];
const SCALAR_FILTER_KEYS: &[&str] = &["equals", "not", "in", "notIn", "lt", "lte", "gt", "gte"];
const ARRAY_FILTER_KEYS: &[&str] = &["has", "hasEvery", "hasSome", "isEmpty", "equals"];
const TO_ONE_RELATION_KEYS: &[&str] = &["is", "isNot"];
const TO_MANY_RELATION_KEYS: &[&str] = &["some", "every", "none"];
const LOGICAL_KEYS: &[&str] = &["AND", "OR", "NOT", "$expr"];

pub struct Validator {
    schema: Arc<Schema>,
    cache: Mutex<HashMap<ModelName, Arc<FieldClasses>>>,
}

impl Validator {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn classes(&self, model_name: &ModelName) -> Result<Arc<FieldClasses>> {
        let mut cache = self.cache.lock().expect("validator cache poisoned");
        if let Some(existing) = cache.get(model_name) {
            return Ok(existing.clone());
        }
        let model = self
            .schema
            .model(model_name)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let built = Arc::new(FieldClasses::build(model));
        cache.insert(model_name.clone(), built.clone());
        Ok(built)
    }

    /// Validates `payload` for `operation` on `model_name`, returning it unchanged (this
    /// implementation performs structural validation only; it does not yet rewrite or
    /// default any values, so the "normalized payload" of §4.1 is the input payload
    /// itself once it passes).
    pub fn validate(&self, operation: Operation, model_name: &ModelName, payload: &Value) -> Result<Value> {
        let model = self
            .schema
            .model(model_name)
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .clone();
        let classes = self.classes(model_name)?;

        let obj = payload
            .as_object()
            .ok_or_else(|| EngineError::input_validation("$", "payload must be an object"))?;

        let mut allowed = vec!["where"];
        if operation.has_selection() {
            allowed.extend(["select", "include", "omit"]);
        }
        if matches!(
            operation,
            Operation::FindFirst | Operation::FindFirstOrThrow | Operation::FindMany
        ) {
            allowed.extend(["orderBy", "skip", "take", "distinct"]);
        }
        if operation.is_write() {
            allowed.push("data");
        }
        if matches!(operation, Operation::Upsert) {
            allowed.push("create");
        }
        if matches!(operation, Operation::CreateMany | Operation::CreateManyAndReturn) {
            allowed.push("skipDuplicates");
        }
        if matches!(
            operation,
            Operation::UpdateMany | Operation::DeleteMany
        ) {
            allowed.push("limit");
        }
        if matches!(operation, Operation::Count | Operation::Aggregate) {
            allowed.extend(["_count", "_avg", "_sum", "_min", "_max"]);
        }
        if matches!(operation, Operation::GroupBy) {
            allowed.extend(["by", "having", "_count", "_avg", "_sum", "_min", "_max"]);
        }

        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(EngineError::input_validation("$", format!("unknown key {key:?}")));
            }
        }

        if let (Some(select), Some(include)) = (obj.get("select"), obj.get("include")) {
            if !select.is_null() && !include.is_null() {
                return Err(EngineError::input_validation(
                    "$",
                    "select and include cannot be used together",
                ));
            }
        }

        if let Some(where_) = obj.get("where") {
            self.validate_where(&model, &classes, where_, "$.where")?;
        }
        if let Some(order_by) = obj.get("orderBy") {
            self.validate_order_by(&classes, order_by, "$.orderBy")?;
        }
        if let Some(select) = obj.get("select") {
            self.validate_selection(&classes, select, true, "$.select")?;
        }
        if let Some(include) = obj.get("include") {
            self.validate_selection(&classes, include, false, "$.include")?;
        }
        if let Some(data) = obj.get("data") {
            self.validate_data(&classes, data, "$.data")?;
        }

        Ok(payload.clone())
    }

    fn validate_where(&self, model: &Model, classes: &FieldClasses, where_: &Value, path: &str) -> Result<()> {
        let Some(obj) = where_.as_object() else {
            return Err(EngineError::input_validation(path, "where must be an object"));
        };
        for (key, value) in obj {
            if LOGICAL_KEYS.contains(&key.as_str()) {
                if key == "AND" || key == "OR" {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| EngineError::input_validation(path, format!("{key} must be an array")))?;
                    for (i, item) in arr.iter().enumerate() {
                        self.validate_where(model, classes, item, &format!("{path}.{key}[{i}]"))?;
                    }
                } else if key == "NOT" {
                    self.validate_where(model, classes, value, &format!("{path}.NOT"))?;
                }
                continue;
            }
            if classes.virtual_fields.contains(&FieldName::from(key.as_str())) {
                return Err(EngineError::input_validation(
                    path,
                    format!("virtual field {key:?} cannot be used in where"),
                ));
            }
            if classes.relation.contains(&FieldName::from(key.as_str())) {
                let field = model
                    .field(&FieldName::from(key.as_str()))
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                self.validate_relation_filter(field.is_to_many(), value, &format!("{path}.{key}"))?;
                continue;
            }
            if !classes.is_known(key) {
                return Err(EngineError::input_validation(path, format!("unknown field {key:?}")));
            }
        }
        Ok(())
    }

    fn validate_relation_filter(&self, is_to_many: bool, value: &Value, path: &str) -> Result<()> {
        let allowed = if is_to_many {
            TO_MANY_RELATION_KEYS
        } else {
            TO_ONE_RELATION_KEYS
        };
        let Some(obj) = value.as_object() else {
            return Err(EngineError::input_validation(path, "relation filter must be an object"));
        };
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(EngineError::input_validation(
                    path,
                    format!("relation filter operator {key:?} not allowed here"),
                ));
            }
        }
        Ok(())
    }

    fn validate_order_by(&self, classes: &FieldClasses, order_by: &Value, path: &str) -> Result<()> {
        let entries: Vec<&Value> = match order_by {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for entry in entries {
            let Some(obj) = entry.as_object() else {
                return Err(EngineError::input_validation(path, "orderBy entry must be an object"));
            };
            for key in obj.keys() {
                if classes.virtual_fields.contains(&FieldName::from(key.as_str())) {
                    return Err(EngineError::input_validation(
                        path,
                        format!("virtual field {key:?} cannot be used in orderBy"),
                    ));
                }
                if !classes.is_known(key) {
                    return Err(EngineError::input_validation(path, format!("unknown field {key:?}")));
                }
            }
        }
        Ok(())
    }

    fn validate_selection(&self, classes: &FieldClasses, selection: &Value, is_select: bool, path: &str) -> Result<()> {
        let Some(obj) = selection.as_object() else {
            return Err(EngineError::input_validation(path, "must be an object"));
        };
        for key in obj.keys() {
            if !classes.is_known(key) {
                return Err(EngineError::input_validation(path, format!("unknown field {key:?}")));
            }
            if !is_select && !classes.relation.contains(&FieldName::from(key.as_str())) {
                return Err(EngineError::input_validation(
                    path,
                    format!("{key:?} is not a relation and cannot be included"),
                ));
            }
        }
        Ok(())
    }

    fn validate_data(&self, classes: &FieldClasses, data: &Value, path: &str) -> Result<()> {
        let entries: Vec<&serde_json::Map<String, Value>> = match data {
            Value::Array(items) => items.iter().filter_map(|v| v.as_object()).collect(),
            Value::Object(obj) => vec![obj],
            _ => return Err(EngineError::input_validation(path, "data must be an object or array")),
        };
        for obj in entries {
            for key in obj.keys() {
                if classes.computed.contains(&FieldName::from(key.as_str())) {
                    return Err(EngineError::input_validation(
                        path,
                        format!("computed field {key:?} cannot appear in a write payload"),
                    ));
                }
                if !classes.is_known(key) {
                    return Err(EngineError::input_validation(path, format!("unknown field {key:?}")));
                }
            }
        }
        Ok(())
    }
}

/// Used by the dialect layer to decide which filter keys are legal for a scalar field,
/// per §4.2's per-kind dispatch.
pub fn scalar_filter_keys(scalar: qorm_schema::ScalarType, array: bool) -> &'static [&'static str] {
    if array {
        return ARRAY_FILTER_KEYS;
    }
    match scalar {
        qorm_schema::ScalarType::String => STRING_FILTER_KEYS,
        _ => SCALAR_FILTER_KEYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qorm_schema::{Field, FieldType, Provider, ProviderType, ScalarType};
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
        let email = StdArc::new(Field {
            name: FieldName::from("email"),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id: false,
            unique: true,
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
        fields.insert(email.name.clone(), email);
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
            provider: Provider {
                type_: ProviderType::Sqlite,
                default_schema: None,
                schemas: None,
            },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let v = Validator::new(Arc::new(user_schema()));
        let payload = serde_json::json!({"wat": 1});
        let err = v.validate(Operation::FindMany, &ModelName::from("User"), &payload).unwrap_err();
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }

    #[test]
    fn rejects_select_and_include_together() {
        let v = Validator::new(Arc::new(user_schema()));
        let payload = serde_json::json!({"select": {"id": true}, "include": {"id": true}});
        let err = v.validate(Operation::FindMany, &ModelName::from("User"), &payload).unwrap_err();
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }

    #[test]
    fn accepts_known_where_clause() {
        let v = Validator::new(Arc::new(user_schema()));
        let payload = serde_json::json!({"where": {"email": {"equals": "a@b.com", "mode": "insensitive"}}});
        assert!(v.validate(Operation::FindMany, &ModelName::from("User"), &payload).is_ok());
    }
}
