use indexmap::IndexMap;
use qorm_schema::{FieldName, FieldType, Model, ModelName, Schema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Concrete representation of a [`Schema`] as physical tables. Built once from a schema
/// and never mutated; the dialect layer and pusher read it to emit SQL, the executor's
/// name mapper reads it to translate logical identifiers to physical ones.
#[derive(Debug, Serialize, Deserialize)]
pub struct Layout {
    pub model_tables: HashMap<ModelName, Arc<ModelTable>>,
    pub schema: Arc<Schema>,
}

impl Layout {
    pub fn build(schema: Arc<Schema>) -> Self {
        let model_tables = schema
            .models
            .values()
            .map(|model| (model.name.clone(), Arc::new(ModelTable::build(model))))
            .collect();
        Self { model_tables, schema }
    }

    pub fn table(&self, name: &ModelName) -> anyhow::Result<&Arc<ModelTable>> {
        self.model_tables
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no table layout for model {:?}", name.0))
    }
}

/// The SQL table backing one model. Only scalar/enum columns are physical; relation
/// fields contribute no column of their own except via the foreign-key columns named in
/// `relation.fields` on the owning side, which appear here as ordinary [`FieldColumn`]s.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelTable {
    pub model_name: ModelName,
    pub table_name: Name,
    pub db_schema: Option<String>,
    pub id_cols: Vec<FieldName>,
    pub field_cols: IndexMap<FieldName, FieldColumn>,
    pub table_indexes: Vec<TableIndex>,
}

impl ModelTable {
    fn build(model: &Model) -> Self {
        // Every table in a delegate chain carries its own id column (the physical join
        // key back to its ancestor), but a non-id field inherited from a delegate base
        // lives only on that base's own table — it is read back via the
        // `__delegate_<Ancestor>` merge column (§4.7), not duplicated here.
        let field_cols = model
            .fields
            .values()
            .filter(|f| !f.is_relation() && (!f.is_inherited() || f.id))
            .map(|f| {
                let col = FieldColumn {
                    field_name: f.name.clone(),
                    col_name: Name(f.column_name().to_owned()),
                    optional: f.optional,
                    array: f.array,
                    repr: ColumnRepr::from_field_type(&f.type_),
                };
                (f.name.clone(), col)
            })
            .collect();

        let table_indexes = model
            .unique_keys
            .iter()
            .map(|(name, def)| TableIndex {
                index_name: Name(format!("unique_{}", name)),
                field_cols: def.fields.iter().map(|f| f.0.clone()).collect(),
                is_unique: true,
            })
            .collect();

        Self {
            model_name: model.name.clone(),
            table_name: Name(model.table_name().to_owned()),
            db_schema: model.db_schema.clone(),
            id_cols: model.id_fields.clone(),
            field_cols,
            table_indexes,
        }
    }

    pub fn column(&self, field: &FieldName) -> anyhow::Result<&FieldColumn> {
        self.field_cols
            .get(field)
            .ok_or_else(|| anyhow::anyhow!("no column for field {:?}", field.0))
    }

    /// The table's name, schema-qualified when `db_schema` is set and the dialect
    /// supports schemas (Postgres; §6). MySQL and SQLite have no notion of a schema
    /// distinct from the database itself, so `db_schema` is ignored there.
    pub fn qualified_name(&self, kind: sqlx::any::AnyKind) -> String {
        match (&self.db_schema, kind) {
            (Some(schema), sqlx::any::AnyKind::Postgres) => {
                format!("{}.{}", quote_identifier(schema), quote_identifier(&self.table_name.0))
            }
            _ => quote_identifier(&self.table_name.0),
        }
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// An SQL index on a table.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableIndex {
    pub index_name: Name,
    pub field_cols: Vec<String>,
    pub is_unique: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldColumn {
    pub field_name: FieldName,
    pub col_name: Name,
    pub optional: bool,
    pub array: bool,
    pub repr: ColumnRepr,
}

/// Physical storage representation of a field's declared scalar/enum type, consumed by
/// the schema pusher for DDL and by the coercion layer for decode/encode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnRepr {
    Text,
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Json,
    Bytes,
    Enum(String),
}

impl ColumnRepr {
    pub fn from_field_type(ty: &FieldType) -> Self {
        match ty {
            FieldType::Scalar(qorm_schema::ScalarType::String) => ColumnRepr::Text,
            FieldType::Scalar(qorm_schema::ScalarType::Int) => ColumnRepr::Int,
            FieldType::Scalar(qorm_schema::ScalarType::BigInt) => ColumnRepr::BigInt,
            FieldType::Scalar(qorm_schema::ScalarType::Float) => ColumnRepr::Float,
            FieldType::Scalar(qorm_schema::ScalarType::Decimal) => ColumnRepr::Decimal,
            FieldType::Scalar(qorm_schema::ScalarType::Boolean) => ColumnRepr::Boolean,
            FieldType::Scalar(qorm_schema::ScalarType::DateTime) => ColumnRepr::DateTime,
            FieldType::Scalar(qorm_schema::ScalarType::Json) => ColumnRepr::Json,
            FieldType::Scalar(qorm_schema::ScalarType::Bytes) => ColumnRepr::Bytes,
            FieldType::Enum(name) => ColumnRepr::Enum(name.clone()),
            FieldType::Relation(_) => {
                unreachable!("relation fields never produce a physical column directly")
            }
        }
    }
}

/// An SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use qorm_schema::{Field, Provider, ProviderType, ScalarType, UniqueKeyDef};

    fn sample_schema() -> Schema {
        let id_field = Arc::new(Field {
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
        let email_field = Arc::new(Field {
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
        let mut fields = IndexMap::new();
        fields.insert(id_field.name.clone(), id_field.clone());
        fields.insert(email_field.name.clone(), email_field.clone());

        let mut unique_keys = IndexMap::new();
        unique_keys.insert(
            "email".to_owned(),
            UniqueKeyDef {
                fields: vec![FieldName::from("email")],
            },
        );

        let model = Arc::new(Model {
            name: ModelName::from("User"),
            fields,
            attributes: Vec::new(),
            id_fields: vec![FieldName::from("id")],
            unique_keys,
            computed_fields: IndexMap::new(),
            virtual_fields: IndexMap::new(),
            base_model: None,
            db_table: None,
            db_schema: None,
        });

        let mut models = IndexMap::new();
        models.insert(model.name.clone(), model);

        Schema {
            provider: Provider {
                type_: ProviderType::Sqlite,
                default_schema: None,
                schemas: None,
            },
            models,
            enums: IndexMap::new(),
            typedefs: IndexMap::new(),
            procedures: IndexMap::new(),
        }
    }

    #[test]
    fn builds_one_table_per_model_with_a_unique_index() {
        let schema = Arc::new(sample_schema());
        let layout = Layout::build(schema);
        let table = layout.table(&ModelName::from("User")).unwrap();
        assert_eq!(table.table_name.0, "User");
        assert_eq!(table.id_cols, vec![FieldName::from("id")]);
        assert!(table.field_cols.contains_key(&FieldName::from("email")));
        assert_eq!(table.table_indexes.len(), 1);
        assert!(table.table_indexes[0].is_unique);
    }
}
