//! Encodes JSON values into SQL bind parameters and decodes SQL rows back into JSON,
//! per §4.6 ("scalar values are coerced"). This is the single place that knows how a
//! [`ColumnRepr`] maps to a `sqlx::any` bind/fetch call.

use anyhow::{bail, Context, Result};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::{Arguments, Row};

use crate::layout::ColumnRepr;

/// Binds a JSON value into an in-progress parameter list, following `repr`. `value` may
/// be `Value::Null` when the column is `optional`.
pub fn encode_into(
    repr: &ColumnRepr,
    optional: bool,
    value: &serde_json::Value,
    out_args: &mut AnyArguments<'static>,
) -> Result<()> {
    if value.is_null() {
        anyhow::ensure!(optional, "cannot bind null into a non-optional column");
        out_args.add(None::<String>);
        return Ok(());
    }

    match repr {
        ColumnRepr::Text | ColumnRepr::Decimal | ColumnRepr::BigInt | ColumnRepr::DateTime => {
            let s = value
                .as_str()
                .with_context(|| format!("expected a string value for {:?}, got {value}", repr))?;
            out_args.add(s.to_owned());
        }
        ColumnRepr::Int => {
            let n = value
                .as_i64()
                .with_context(|| format!("expected an integer value, got {value}"))?;
            out_args.add(n);
        }
        ColumnRepr::Float => {
            let n = value
                .as_f64()
                .with_context(|| format!("expected a numeric value, got {value}"))?;
            out_args.add(n);
        }
        ColumnRepr::Boolean => {
            let b = value
                .as_bool()
                .with_context(|| format!("expected a boolean value, got {value}"))?;
            out_args.add(b);
        }
        ColumnRepr::Json => {
            let json_str = serde_json::to_string(value).context("failed to serialize JSON column")?;
            out_args.add(json_str);
        }
        ColumnRepr::Bytes => match value {
            serde_json::Value::String(s) => out_args.add(s.clone()),
            serde_json::Value::Array(items) => {
                let bytes: Result<Vec<u8>> = items
                    .iter()
                    .map(|v| v.as_u64().map(|n| n as u8).context("expected a byte array"))
                    .collect();
                out_args.add(bytes?);
            }
            _ => bail!("unsupported value for Bytes column: {value}"),
        },
        ColumnRepr::Enum(_) => {
            let s = value
                .as_str()
                .with_context(|| format!("expected an enum variant string, got {value}"))?;
            out_args.add(s.to_owned());
        }
    }
    Ok(())
}

/// Decodes column `idx` of `row` into JSON, following `repr`. Returns `Value::Null` when
/// the underlying column is SQL NULL.
pub fn decode_column(row: &AnyRow, idx: usize, repr: &ColumnRepr) -> Result<serde_json::Value> {
    match repr {
        ColumnRepr::Text | ColumnRepr::Decimal | ColumnRepr::BigInt | ColumnRepr::DateTime | ColumnRepr::Enum(_) => {
            Ok(row
                .try_get::<Option<String>, _>(idx)?
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null))
        }
        ColumnRepr::Int => Ok(row
            .try_get::<Option<i64>, _>(idx)?
            .map(|n| serde_json::Value::from(n))
            .unwrap_or(serde_json::Value::Null)),
        ColumnRepr::Float => Ok(row
            .try_get::<Option<f64>, _>(idx)?
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        ColumnRepr::Boolean => Ok(row
            .try_get::<Option<bool>, _>(idx)?
            .map(serde_json::Value::Bool)
            .unwrap_or(serde_json::Value::Null)),
        ColumnRepr::Json => {
            let text: Option<String> = row.try_get(idx)?;
            match text {
                Some(text) => {
                    serde_json::from_str(&text).context("failed to parse JSON column")
                }
                None => Ok(serde_json::Value::Null),
            }
        }
        ColumnRepr::Bytes => Ok(row
            .try_get::<Option<Vec<u8>>, _>(idx)?
            .map(|bytes| serde_json::Value::Array(bytes.into_iter().map(serde_json::Value::from).collect()))
            .unwrap_or(serde_json::Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_into_optional_column_is_accepted() {
        let mut args = AnyArguments::default();
        assert!(encode_into(&ColumnRepr::Text, true, &json!(null), &mut args).is_ok());
    }

    #[test]
    fn null_into_required_column_fails() {
        let mut args = AnyArguments::default();
        assert!(encode_into(&ColumnRepr::Text, false, &json!(null), &mut args).is_err());
    }

    #[test]
    fn int_column_rejects_string_value() {
        let mut args = AnyArguments::default();
        assert!(encode_into(&ColumnRepr::Int, false, &json!("1"), &mut args).is_err());
    }
}
