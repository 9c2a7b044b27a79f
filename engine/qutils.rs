//! Small schema-walking helpers shared by the find planner, the mutation planner, and
//! the dialect layer: relation key-pair discovery, id-field lookup, delegate-chain
//! traversal, and join-predicate construction. None of these touch SQL text directly.

use qorm_schema::{Field, FieldName, Model, ModelName, RelationInfo, Schema};

/// The pair of (owning-side fields, referenced-side fields) for a relation, regardless
/// of which side `field` names. On the back-reference side this requires following
/// `relation.opposite` into the target model to find the owning field.
pub fn relation_key_pair<'s>(
    schema: &'s Schema,
    model: &'s Model,
    field: &'s Field,
) -> anyhow::Result<(Vec<FieldName>, Vec<FieldName>)> {
    let info = field
        .relation
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("field {:?} is not a relation", field.name.0))?;

    if info.is_owning() {
        return Ok((info.fields.clone(), info.references.clone()));
    }

    let target = target_model(schema, field)?;
    let opposite_name = info
        .opposite
        .clone()
        .or_else(|| find_opposite(model, target, info).map(|f| f.name.clone()))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "relation {:?} on {:?} has no discoverable opposite field",
                field.name.0,
                model.name.0
            )
        })?;
    let opposite = target.field(&opposite_name)?;
    let opposite_info = opposite
        .relation
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("opposite field {:?} is not a relation", opposite_name.0))?;
    Ok((opposite_info.fields.clone(), opposite_info.references.clone()))
}

fn find_opposite<'s>(owner: &Model, target: &'s Model, info: &RelationInfo) -> Option<&'s std::sync::Arc<Field>> {
    target.fields.values().find(|f| {
        f.is_relation()
            && matches!(&f.type_, qorm_schema::FieldType::Relation(n) if n == &owner.name)
            && f.relation.as_ref().and_then(|r| r.name.as_ref()) == info.name.as_ref()
    })
}

pub fn target_model<'s>(schema: &'s Schema, field: &Field) -> anyhow::Result<&'s std::sync::Arc<Model>> {
    match &field.type_ {
        qorm_schema::FieldType::Relation(name) => schema.model(name),
        _ => anyhow::bail!("field {:?} does not target a model", field.name.0),
    }
}

/// A model's id fields, following `base_model` when the concrete model inherits its id
/// from a delegate ancestor (its own `id_fields` would otherwise be empty).
pub fn effective_id_fields<'s>(schema: &'s Schema, model: &'s Model) -> anyhow::Result<&'s [FieldName]> {
    if !model.id_fields.is_empty() {
        return Ok(&model.id_fields);
    }
    let base_name = model
        .base_model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("model {:?} has no id fields and no base model", model.name.0))?;
    let base = schema.model(base_name)?;
    effective_id_fields(schema, base)
}

/// Root-first chain of delegate ancestors for `model` (excluding `model` itself).
pub fn ancestor_chain<'s>(schema: &'s Schema, model: &'s Model) -> Vec<&'s std::sync::Arc<Model>> {
    schema.delegate_chain(model)
}

/// The root delegate base's discriminator column, if `model` belongs to a delegate
/// chain whose base declares `@@delegate(field)`: the `(owning model, field)` pair
/// whose column stores the concrete descendant's model name on every create (§3).
pub fn delegate_discriminator(schema: &Schema, model: &Model) -> Option<(ModelName, FieldName)> {
    let chain = ancestor_chain(schema, model);
    let root = chain.first().copied().unwrap_or_else(|| {
        // `model` itself is the root of its own (possibly trivial) chain.
        schema.models.get(&model.name).unwrap_or_else(|| unreachable!("model not registered in its own schema"))
    });
    root.attributes.iter().find(|a| a.name == "delegate").and_then(|attr| {
        let field = attr.args.first().and_then(discriminator_field_name)?;
        Some((root.name.clone(), field))
    })
}

fn discriminator_field_name(expr: &qorm_schema::expr::Expr) -> Option<FieldName> {
    use qorm_schema::expr::{Expr, Literal};
    match expr {
        Expr::Literal(Literal::String(s)) => Some(FieldName::from(s.as_str())),
        Expr::Field { path } => path.first().map(|s| FieldName::from(s.as_str())),
        _ => None,
    }
}

/// The equi-join predicate's field pairs for joining a relation's owning side to its
/// referenced side, independent of which side `field` is declared on.
pub fn join_pairs<'s>(
    schema: &'s Schema,
    model: &'s Model,
    field: &'s Field,
) -> anyhow::Result<Vec<(FieldName, FieldName)>> {
    let (owning, referenced) = relation_key_pair(schema, model, field)?;
    anyhow::ensure!(
        owning.len() == referenced.len(),
        "relation {:?} has mismatched key arity",
        field.name.0
    );
    Ok(owning.into_iter().zip(referenced).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qorm_schema::{FieldType, Provider, ProviderType, ScalarType};
    use std::sync::Arc;

    fn scalar(name: &str) -> Arc<Field> {
        Arc::new(Field {
            name: FieldName::from(name),
            type_: FieldType::Scalar(ScalarType::String),
            array: false,
            optional: false,
            id: name == "id",
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

    fn schema_with_user_and_posts() -> Schema {
        let user_id = scalar("id");
        let post_id = scalar("id");
        let author_id = scalar("authorId");

        let posts_field = Arc::new(Field {
            name: FieldName::from("posts"),
            type_: FieldType::Relation(ModelName::from("Post")),
            array: true,
            optional: false,
            id: false,
            unique: false,
            updated_at: false,
            default: None,
            relation: Some(RelationInfo {
                fields: Vec::new(),
                references: Vec::new(),
                on_delete: None,
                on_update: None,
                opposite: Some(FieldName::from("author")),
                name: None,
            }),
            foreign_key_for: None,
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

        let mut user_fields = indexmap::IndexMap::new();
        user_fields.insert(user_id.name.clone(), user_id.clone());
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

        let mut post_fields = indexmap::IndexMap::new();
        post_fields.insert(post_id.name.clone(), post_id.clone());
        post_fields.insert(author_id.name.clone(), author_id.clone());
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
    fn back_reference_side_resolves_keys_via_opposite() {
        let schema = schema_with_user_and_posts();
        let user = schema.model(&ModelName::from("User")).unwrap();
        let posts_field = user.field(&FieldName::from("posts")).unwrap();
        let (owning, referenced) = relation_key_pair(&schema, user, posts_field).unwrap();
        assert_eq!(owning, vec![FieldName::from("authorId")]);
        assert_eq!(referenced, vec![FieldName::from("id")]);
    }

    #[test]
    fn owning_side_resolves_keys_directly() {
        let schema = schema_with_user_and_posts();
        let post = schema.model(&ModelName::from("Post")).unwrap();
        let author_field = post.field(&FieldName::from("author")).unwrap();
        let pairs = join_pairs(&schema, post, author_field).unwrap();
        assert_eq!(pairs, vec![(FieldName::from("authorId"), FieldName::from("id"))]);
    }
}
