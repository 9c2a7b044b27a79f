//! Scalar-compatibility checks used by input validation: whether a JSON value shape is
//! assignable to a field's declared type. This is deliberately shallow compared to a
//! full structural type system — schemas here are flat (scalar, enum, or relation), so
//! there is no subtyping lattice to walk, only a handful of coercions to allow.

use crate::schema::{FieldType, Model, ScalarType};
use serde_json::Value;

/// True if `value` can be assigned to a field of type `field_type` (ignoring
/// optionality/array-ness, which the caller checks separately against the JSON shape).
pub fn value_matches_scalar(value: &Value, scalar: ScalarType) -> bool {
    match scalar {
        ScalarType::String | ScalarType::DateTime | ScalarType::Decimal | ScalarType::BigInt => {
            value.is_string()
        }
        ScalarType::Int => value.as_i64().is_some() || value.as_u64().is_some(),
        ScalarType::Float => value.is_number(),
        ScalarType::Boolean => value.is_boolean(),
        ScalarType::Json => true,
        ScalarType::Bytes => value.is_string() || value.is_array(),
    }
}

pub fn value_matches_enum(value: &Value, variants: &[String]) -> bool {
    value
        .as_str()
        .map(|s| variants.iter().any(|v| v == s))
        .unwrap_or(false)
}

/// Checks a leaf value (after array/optional unwrapping) against a field's declared
/// type, dispatching to scalar or enum matching. Relation fields are never leaves in a
/// scalar-input context; callers must route nested-write payloads through relation
/// handling before reaching here.
pub fn value_matches_field_type(schema_field_type: &FieldType, value: &Value, schema: &crate::Schema) -> bool {
    match schema_field_type {
        FieldType::Scalar(s) => value_matches_scalar(value, *s),
        FieldType::Enum(name) => schema
            .enums
            .get(name)
            .map(|variants| value_matches_enum(value, variants))
            .unwrap_or(false),
        FieldType::Relation(_) => false,
    }
}

/// True if every id field of `model` appears, non-null, in `value`. Used to recognize a
/// nested-write payload as a `connect`/`where` reference versus a `create` payload.
pub fn looks_like_id_reference(model: &Model, value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    model
        .id_fields
        .iter()
        .all(|f| obj.get(&f.0).map(|v| !v.is_null()).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_and_numbers_do_not_cross_match() {
        assert!(value_matches_scalar(&json!("hi"), ScalarType::String));
        assert!(!value_matches_scalar(&json!(1), ScalarType::String));
        assert!(value_matches_scalar(&json!(1), ScalarType::Int));
        assert!(!value_matches_scalar(&json!("1"), ScalarType::Int));
    }

    #[test]
    fn json_scalar_accepts_anything() {
        assert!(value_matches_scalar(&json!({"a": 1}), ScalarType::Json));
        assert!(value_matches_scalar(&json!(null), ScalarType::Json));
    }

    #[test]
    fn enum_matching_requires_known_variant() {
        let variants = vec!["ADMIN".to_owned(), "USER".to_owned()];
        assert!(value_matches_enum(&json!("ADMIN"), &variants));
        assert!(!value_matches_enum(&json!("ROOT"), &variants));
    }
}
