use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::expr::Expr;

/// In-memory description of a data model produced by an upstream schema compiler.
/// Constructed once per process and never mutated afterwards; runtime-mutable state
/// (auth subject, plugins, options) lives outside this type.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub provider: Provider,
    #[serde(with = "schema_models")]
    pub models: IndexMap<ModelName, Arc<Model>>,
    #[serde(default)]
    pub enums: IndexMap<EnumName, Vec<String>>,
    #[serde(default)]
    #[serde(with = "schema_typedefs")]
    pub typedefs: IndexMap<String, Arc<FieldType>>,
    #[serde(default)]
    #[serde(with = "schema_procedures")]
    pub procedures: IndexMap<String, Arc<Procedure>>,
}

impl Schema {
    pub fn model(&self, name: &ModelName) -> anyhow::Result<&Arc<Model>> {
        self.models
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown model {:?}", name.0))
    }

    /// Walks from `model` up through its base models to the root of the delegate chain,
    /// root first.
    pub fn delegate_chain<'s>(&'s self, model: &'s Model) -> Vec<&'s Arc<Model>> {
        let mut chain = Vec::new();
        let mut current = model.base_model.as_ref();
        while let Some(base_name) = current {
            if let Some(base) = self.models.get(base_name) {
                chain.push(base);
                current = base.base_model.as_ref();
            } else {
                break;
            }
        }
        chain.reverse();
        chain
    }

    /// True if `name` is used as a `baseModel` by some other model in the schema.
    pub fn is_delegate_base(&self, name: &ModelName) -> bool {
        self.models
            .values()
            .any(|m| m.base_model.as_ref() == Some(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelName(pub String);

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelName {
    fn from(s: &str) -> Self {
        ModelName(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldName(pub String);

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldName {
    fn from(s: &str) -> Self {
        FieldName(s.to_owned())
    }
}

pub type EnumName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Sqlite,
    Postgresql,
    Mysql,
}

/// Static half of the connection configuration. The connection factory itself is
/// runtime state, supplied when a client is constructed, not schema data.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(rename = "type")]
    pub type_: ProviderType,
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default)]
    pub schemas: Option<Vec<String>>,
}

impl Provider {
    /// `defaultSchema`/`schemas` are meaningful only for postgresql, and when present
    /// `schemas` must include both `defaultSchema` and `public`.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.type_ {
            ProviderType::Postgresql => {
                if let (Some(schemas), Some(default)) = (&self.schemas, &self.default_schema) {
                    anyhow::ensure!(
                        schemas.iter().any(|s| s == default),
                        "schemas must include defaultSchema"
                    );
                    anyhow::ensure!(
                        schemas.iter().any(|s| s == "public"),
                        "schemas must include \"public\" unless every model carries @@schema"
                    );
                }
            }
            ProviderType::Sqlite | ProviderType::Mysql => {
                anyhow::ensure!(
                    self.default_schema.is_none() && self.schemas.is_none(),
                    "defaultSchema/schemas are only valid for the postgresql provider"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: ModelName,
    #[serde(with = "model_fields")]
    pub fields: IndexMap<FieldName, Arc<Field>>,
    #[serde(default)]
    pub attributes: Vec<Attr>,
    pub id_fields: Vec<FieldName>,
    #[serde(default)]
    pub unique_keys: IndexMap<String, UniqueKeyDef>,
    #[serde(default)]
    #[serde(with = "computed_fields")]
    pub computed_fields: IndexMap<FieldName, Arc<ComputedField>>,
    #[serde(default)]
    #[serde(with = "virtual_fields")]
    pub virtual_fields: IndexMap<FieldName, Arc<VirtualField>>,
    #[serde(default)]
    pub base_model: Option<ModelName>,
    #[serde(default)]
    pub db_table: Option<String>,
    #[serde(default)]
    pub db_schema: Option<String>,
}

impl Model {
    pub fn table_name(&self) -> &str {
        self.db_table.as_deref().unwrap_or(&self.name.0)
    }

    pub fn field(&self, name: &FieldName) -> anyhow::Result<&Arc<Field>> {
        self.fields
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("model {:?} has no field {:?}", self.name.0, name.0))
    }

    /// A unique key, keyed by field set: the single-field key for `@id`/`@unique`, the
    /// named composite key for `@@unique`/`@@id`.
    pub fn unique_key_for(&self, fields: &[FieldName]) -> Option<(&str, &UniqueKeyDef)> {
        self.unique_keys
            .iter()
            .find(|(_, def)| {
                def.fields.len() == fields.len() && def.fields.iter().all(|f| fields.contains(f))
            })
            .map(|(name, def)| (name.as_str(), def))
    }

    pub fn is_id_field_set(&self, fields: &[FieldName]) -> bool {
        self.id_fields.len() == fields.len() && self.id_fields.iter().all(|f| fields.contains(f))
    }
}

/// Describes a unique constraint. A key with more than one field is a composite
/// `@@unique`/`@@id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueKeyDef {
    pub fields: Vec<FieldName>,
}

impl UniqueKeyDef {
    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: FieldName,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub array: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub id: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub updated_at: bool,
    #[serde(default)]
    pub default: Option<Expr>,
    #[serde(default)]
    pub relation: Option<RelationInfo>,
    /// Non-empty for columns that back a relation's foreign key, naming the owning
    /// relation field.
    #[serde(default)]
    pub foreign_key_for: Option<FieldName>,
    #[serde(default)]
    pub attributes: Vec<Attr>,
    /// Set on a field inherited from a delegate base model, naming that base.
    #[serde(default)]
    pub origin_model: Option<ModelName>,
    #[serde(default)]
    pub db_column: Option<String>,
}

impl Field {
    pub fn column_name(&self) -> &str {
        self.db_column.as_deref().unwrap_or(&self.name.0)
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.type_, FieldType::Relation(_))
    }

    /// A relation field that carries foreign-key columns (`relation.fields` is non-empty).
    pub fn is_owning_relation(&self) -> bool {
        self.relation
            .as_ref()
            .map(RelationInfo::is_owning)
            .unwrap_or(false)
    }

    pub fn is_to_many(&self) -> bool {
        self.is_relation() && self.array
    }

    pub fn is_inherited(&self) -> bool {
        self.origin_model.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldType {
    Scalar(ScalarType),
    Enum(EnumName),
    Relation(ModelName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScalarType {
    String,
    Int,
    BigInt,
    Float,
    Decimal,
    Boolean,
    DateTime,
    Json,
    Bytes,
}

impl ScalarType {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ScalarType::Int | ScalarType::BigInt | ScalarType::Float | ScalarType::Decimal
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationInfo {
    /// Owning-side foreign-key field names. Empty on the back-reference side.
    #[serde(default)]
    pub fields: Vec<FieldName>,
    /// Fields on the target model that `fields` point at. Empty on the back-reference side.
    #[serde(default)]
    pub references: Vec<FieldName>,
    #[serde(default)]
    pub on_delete: Option<ReferentialAction>,
    #[serde(default)]
    pub on_update: Option<ReferentialAction>,
    #[serde(default)]
    pub opposite: Option<FieldName>,
    /// Discriminator required for self-relations and for disambiguating multiple
    /// relations between the same pair of models.
    #[serde(default)]
    pub name: Option<String>,
}

impl RelationInfo {
    pub fn is_owning(&self) -> bool {
        !self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
    SetDefault,
}

/// A field computed in SQL at query time from other columns on the same row, stored
/// logically but never written by a mutation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedField {
    pub name: FieldName,
    #[serde(rename = "type")]
    pub type_: FieldType,
    pub expr: Expr,
}

/// A field materialized by a caller-supplied function after rows are read, never stored
/// and never referenceable in a filter. The function itself is runtime state.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualField {
    pub name: FieldName,
    #[serde(rename = "type")]
    pub type_: FieldType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attr {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Expr>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    pub name: String,
    pub params: Vec<ProcParam>,
    pub return_type: FieldType,
    #[serde(default)]
    pub mutation: bool,
}

impl Procedure {
    pub fn all_optional(&self) -> bool {
        self.params.iter().all(|p| p.optional)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcParam {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub array: bool,
}

/// Named type usable in `typedefs` for input/output shapes that are not themselves
/// models (e.g. a procedure's structured return type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typedef {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
}

/// Relation fields declared on `model`, excluding computed/virtual pseudo-fields, which
/// are not valid join targets for filters or `include`.
pub fn relation_fields(model: &Model) -> HashSet<&FieldName> {
    model
        .fields
        .values()
        .filter(|f| f.is_relation())
        .map(|f| &f.name)
        .collect()
}

serde_map_as_vec!(mod schema_models, IndexMap<ModelName, Arc<Model>>, name);
serde_map_as_vec!(mod model_fields, IndexMap<FieldName, Arc<Field>>, name);
serde_map_as_vec!(mod computed_fields, IndexMap<FieldName, Arc<ComputedField>>, name);
serde_map_as_vec!(mod virtual_fields, IndexMap<FieldName, Arc<VirtualField>>, name);
serde_map_as_tuples!(mod schema_typedefs, IndexMap<String, Arc<FieldType>>);
serde_map_as_vec!(mod schema_procedures, IndexMap<String, Arc<Procedure>>, name);

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_field(name: &str, ty: ScalarType) -> Arc<Field> {
        Arc::new(Field {
            name: FieldName(name.to_owned()),
            type_: FieldType::Scalar(ty),
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
        })
    }

    fn model(name: &str, fields: Vec<Arc<Field>>, id_fields: Vec<&str>) -> Model {
        Model {
            name: ModelName(name.to_owned()),
            fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
            attributes: Vec::new(),
            id_fields: id_fields.into_iter().map(FieldName::from).collect(),
            unique_keys: IndexMap::new(),
            computed_fields: IndexMap::new(),
            virtual_fields: IndexMap::new(),
            base_model: None,
            db_table: None,
            db_schema: None,
        }
    }

    #[test]
    fn table_name_defaults_to_model_name() {
        let m = model("User", vec![scalar_field("id", ScalarType::String)], vec!["id"]);
        assert_eq!(m.table_name(), "User");
    }

    #[test]
    fn table_name_honors_db_table_override() {
        let mut m = model("User", vec![scalar_field("id", ScalarType::String)], vec!["id"]);
        m.db_table = Some("users".to_owned());
        assert_eq!(m.table_name(), "users");
    }

    #[test]
    fn is_id_field_set_matches_regardless_of_order() {
        let m = model(
            "Membership",
            vec![
                scalar_field("userId", ScalarType::String),
                scalar_field("groupId", ScalarType::String),
            ],
            vec!["userId", "groupId"],
        );
        assert!(m.is_id_field_set(&[FieldName::from("groupId"), FieldName::from("userId")]));
        assert!(!m.is_id_field_set(&[FieldName::from("userId")]));
    }

    #[test]
    fn delegate_chain_walks_to_root() {
        let base = Arc::new(model("Animal", vec![scalar_field("id", ScalarType::String)], vec!["id"]));
        let mut dog = model("Dog", vec![scalar_field("id", ScalarType::String)], vec!["id"]);
        dog.base_model = Some(base.name.clone());
        let mut models = IndexMap::new();
        models.insert(base.name.clone(), base.clone());
        let dog_name = dog.name.clone();
        models.insert(dog_name.clone(), Arc::new(dog));

        let schema = Schema {
            provider: Provider {
                type_: ProviderType::Sqlite,
                default_schema: None,
                schemas: None,
            },
            models,
            enums: IndexMap::new(),
            typedefs: IndexMap::new(),
            procedures: IndexMap::new(),
        };

        let chain = schema.delegate_chain(schema.models.get(&dog_name).unwrap());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name, base.name);
        assert!(schema.is_delegate_base(&base.name));
    }

    #[test]
    fn sqlite_provider_rejects_schema_fields() {
        let provider = Provider {
            type_: ProviderType::Sqlite,
            default_schema: Some("public".to_owned()),
            schemas: None,
        };
        assert!(provider.validate().is_err());
    }
}
