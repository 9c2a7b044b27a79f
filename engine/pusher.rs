//! `$pushSchema`: synthesizes `CREATE TYPE`/`CREATE TABLE` DDL for every model and enum
//! in a schema and applies it to the configured database (§4.9).
//!
//! Modeled on the create/alter/drop table split of the schema-sync path this module is
//! adapted from: one statement per table, guarded with `IF NOT EXISTS`, plus a
//! Postgres-only enum type per declared enum. There is no migration diffing here —
//! `$pushSchema` is declarative and additive, matching the scope §4.9 describes; dropping
//! or altering an existing column is out of scope.

use qorm_schema::{FieldType, Model, ReferentialAction, Schema};

use crate::dialect::Dialect;
use crate::error::{EngineError, Result};
use crate::layout::{ColumnRepr, Layout, ModelTable};
use crate::qutils;

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The ordered list of DDL statements `$pushSchema` must run, in dependency order
/// (enum types first, then tables in an order where a table naming another as a foreign
/// key always follows it).
pub fn plan_push(schema: &Schema, layout: &Layout, dialect: &dyn Dialect) -> Result<Vec<String>> {
    let mut statements = Vec::new();
    if matches!(dialect.kind(), sqlx::any::AnyKind::Postgres) {
        for name in configured_schema_names(schema) {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(&name)));
        }
        for (name, variants) in &schema.enums {
            statements.push(create_enum_type(name, variants));
        }
    }
    for model in ordered_models(schema) {
        let table = layout.table(&model.name).map_err(|e| EngineError::Internal(e.to_string()))?;
        statements.push(create_table(schema, layout, dialect, model, table)?);
    }
    Ok(statements)
}

/// Every distinct Postgres schema this model set actually targets: the provider's
/// declared `schemas` list plus any `@@schema` a model names that isn't already in it
/// (§6 "schema-qualified for Postgres when schemas/defaultSchema is configured").
fn configured_schema_names(schema: &Schema) -> Vec<String> {
    let mut names: Vec<String> = schema.provider.schemas.clone().unwrap_or_default();
    for model in schema.models.values() {
        if let Some(db_schema) = &model.db_schema {
            if !names.contains(db_schema) {
                names.push(db_schema.clone());
            }
        }
    }
    names
}

/// Topologically orders models so that a model referencing another via an owning
/// relation's foreign key is emitted after the model it references, falling back to
/// declaration order for ties and for cycles (self-relations, mutual references) which
/// this pass does not attempt to break with deferred constraints.
fn ordered_models(schema: &Schema) -> Vec<&std::sync::Arc<Model>> {
    let mut emitted: Vec<&std::sync::Arc<Model>> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    fn visit<'s>(
        schema: &'s Schema,
        model: &'s std::sync::Arc<Model>,
        seen: &mut std::collections::HashSet<qorm_schema::ModelName>,
        emitted: &mut Vec<&'s std::sync::Arc<Model>>,
    ) {
        if !seen.insert(model.name.clone()) {
            return;
        }
        for field in model.fields.values() {
            if field.is_owning_relation() {
                if let Ok(target) = qutils::target_model(schema, field) {
                    if target.name != model.name {
                        visit(schema, target, seen, emitted);
                    }
                }
            }
        }
        emitted.push(model);
    }

    for model in schema.models.values() {
        visit(schema, model, &mut seen, &mut emitted);
    }
    emitted
}

fn create_enum_type(name: &str, variants: &[String]) -> String {
    let values = variants.iter().map(|v| format!("'{}'", v.replace('\'', "''"))).collect::<Vec<_>>().join(", ");
    format!("DO $$ BEGIN CREATE TYPE {} AS ENUM ({values}); EXCEPTION WHEN duplicate_object THEN NULL; END $$;", quoted(name))
}

fn create_table(schema: &Schema, layout: &Layout, dialect: &dyn Dialect, model: &Model, table: &ModelTable) -> Result<String> {
    let mut columns = Vec::new();
    for (field_name, col) in &table.field_cols {
        let field = model.field(field_name).map_err(|e| EngineError::Internal(e.to_string()))?;
        let mut def = format!("{} {}", quoted(&col.col_name.0), column_type_sql(dialect, &col.repr, col.array));
        if table.id_cols.len() == 1 && table.id_cols[0] == *field_name {
            def.push_str(" PRIMARY KEY");
            if is_autoincrement(field) {
                def.push_str(&autoincrement_suffix(dialect));
            }
        } else if !col.optional {
            def.push_str(" NOT NULL");
        }
        if field.unique && !field.id {
            def.push_str(" UNIQUE");
        }
        columns.push(def);
    }

    if table.id_cols.len() > 1 {
        let mut names = Vec::with_capacity(table.id_cols.len());
        for field_name in &table.id_cols {
            let col = table.column(field_name).map_err(|e| EngineError::Internal(e.to_string()))?;
            names.push(quoted(&col.col_name.0));
        }
        columns.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }

    for field in model.fields.values() {
        if !field.is_owning_relation() {
            continue;
        }
        let Some(info) = field.relation.as_ref() else { continue };
        let target = qutils::target_model(schema, field).map_err(|e| EngineError::Internal(e.to_string()))?;
        let target_table = layout.table(&target.name).map_err(|e| EngineError::Internal(e.to_string()))?;
        let mut local_names = Vec::with_capacity(info.fields.len());
        for field_name in &info.fields {
            let col = table.column(field_name).map_err(|e| EngineError::Internal(e.to_string()))?;
            local_names.push(quoted(&col.col_name.0));
        }
        let local_cols = local_names.join(", ");
        let ref_cols = info.references.iter().map(|f| quoted(f.0.as_str())).collect::<Vec<_>>().join(", ");
        let mut fk = format!("FOREIGN KEY ({local_cols}) REFERENCES {} ({ref_cols})", target_table.qualified_name(dialect.kind()));
        if let Some(action) = info.on_delete {
            fk.push_str(&format!(" ON DELETE {}", referential_action_sql(action)));
        }
        if let Some(action) = info.on_update {
            fk.push_str(&format!(" ON UPDATE {}", referential_action_sql(action)));
        }
        columns.push(fk);
    }

    for index in &table.table_indexes {
        if !index.is_unique || index.field_cols.len() <= 1 {
            continue;
        }
        let cols = index.field_cols.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ");
        columns.push(format!("UNIQUE ({cols})"));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.qualified_name(dialect.kind()),
        columns.join(", ")
    ))
}

fn is_autoincrement(field: &qorm_schema::Field) -> bool {
    matches!(
        field.default.as_ref(),
        Some(qorm_schema::expr::Expr::Call { name, .. }) if name == "autoincrement"
    )
}

fn autoincrement_suffix(dialect: &dyn Dialect) -> &'static str {
    match dialect.kind() {
        sqlx::any::AnyKind::Postgres => " GENERATED ALWAYS AS IDENTITY",
        sqlx::any::AnyKind::MySql => " AUTO_INCREMENT",
        _ => " AUTOINCREMENT",
    }
}

fn referential_action_sql(action: ReferentialAction) -> &'static str {
    match action {
        ReferentialAction::Cascade => "CASCADE",
        ReferentialAction::SetNull => "SET NULL",
        ReferentialAction::Restrict => "RESTRICT",
        ReferentialAction::NoAction => "NO ACTION",
        ReferentialAction::SetDefault => "SET DEFAULT",
    }
}

fn column_type_sql(dialect: &dyn Dialect, repr: &ColumnRepr, array: bool) -> String {
    let base = match repr {
        ColumnRepr::Text => "TEXT".to_owned(),
        ColumnRepr::Int => "INTEGER".to_owned(),
        ColumnRepr::BigInt => "BIGINT".to_owned(),
        ColumnRepr::Float => "DOUBLE PRECISION".to_owned(),
        ColumnRepr::Decimal => "NUMERIC".to_owned(),
        ColumnRepr::Boolean => "BOOLEAN".to_owned(),
        ColumnRepr::DateTime => "TIMESTAMP".to_owned(),
        ColumnRepr::Json => "TEXT".to_owned(),
        ColumnRepr::Bytes => "BLOB".to_owned(),
        ColumnRepr::Enum(name) => match dialect.kind() {
            sqlx::any::AnyKind::Postgres => quoted(name),
            _ => "TEXT".to_owned(),
        },
    };
    if array && matches!(dialect.kind(), sqlx::any::AnyKind::Postgres) {
        format!("{base}[]")
    } else if array {
        // neither SQLite nor MySQL has a native array column type; arrays are stored as
        // a JSON-encoded text column instead (the coercion layer already treats `Json`
        // this way, so scalar array columns reuse the same on-wire representation).
        "TEXT".to_owned()
    } else {
        base
    }
}

/// `$pushSchema`'s `FieldType::Relation` fields never reach [`create_table`] as columns
/// (only their owning side's foreign-key fields do); this guards that invariant so a
/// caller handing a raw, unvalidated schema still fails loudly rather than emitting a
/// bogus column.
pub fn assert_no_bare_relation_columns(model: &Model) -> Result<()> {
    for field in model.fields.values() {
        if matches!(field.type_, FieldType::Relation(_)) && field.foreign_key_for.is_some() {
            return Err(EngineError::Internal(format!(
                "field {:?} on {:?} is marked foreign_key_for but is itself a relation type",
                field.name.0, model.name.0
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use qorm_schema::{Field, FieldName, ModelName, Provider, ProviderType, RelationInfo, ScalarType};
    use std::sync::Arc;

    fn user_post_schema() -> Schema {
        let user_id = Arc::new(Field {
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
        let mut user_fields = IndexMap::new();
        user_fields.insert(user_id.name.clone(), user_id);
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

        let post_id = Arc::new(Field {
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
        let author_id = Arc::new(Field {
            name: FieldName::from("authorId"),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id: false,
            unique: false,
            updated_at: false,
            default: None,
            relation: None,
            foreign_key_for: Some(FieldName::from("author")),
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
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
                on_delete: Some(ReferentialAction::Cascade),
                on_update: None,
                opposite: None,
                name: None,
            }),
            foreign_key_for: None,
            attributes: Vec::new(),
            origin_model: None,
            db_column: None,
        });
        let mut post_fields = IndexMap::new();
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

        let mut models = IndexMap::new();
        models.insert(post.name.clone(), post);
        models.insert(user.name.clone(), user);

        Schema {
            provider: Provider { type_: ProviderType::Sqlite, default_schema: None, schemas: None },
            models,
            enums: Default::default(),
            typedefs: Default::default(),
            procedures: Default::default(),
        }
    }

    #[test]
    fn referenced_table_is_created_before_the_referencing_one() {
        let schema = user_post_schema();
        let order = ordered_models(&schema);
        let user_idx = order.iter().position(|m| m.name.0 == "User").unwrap();
        let post_idx = order.iter().position(|m| m.name.0 == "Post").unwrap();
        assert!(user_idx < post_idx);
    }

    #[test]
    fn create_table_emits_a_foreign_key_clause() {
        let schema = std::sync::Arc::new(user_post_schema());
        let layout = Layout::build(schema.clone());
        let dialect = crate::dialect::for_kind(sqlx::any::AnyKind::Sqlite);
        let statements = plan_push(&schema, &layout, dialect.as_ref()).unwrap();
        let post_stmt = statements.iter().find(|s| s.contains("\"Post\"")).unwrap();
        assert!(post_stmt.contains("FOREIGN KEY"));
        assert!(post_stmt.contains("ON DELETE CASCADE"));
    }
}
