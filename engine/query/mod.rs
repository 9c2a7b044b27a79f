//! A single, already-bound SQL statement plus enough shape information to decode its
//! result rows back into JSON. Built by [`build::QueryBuilder`], run by [`exec`].
//!
//! Unlike the schema-parser-facing query layer this module is adapted from, every
//! bind value here is a concrete [`serde_json::Value`] known at plan time rather than a
//! lazily-evaluated expression over an opaque caller argument — the planner already has
//! the whole validated payload in memory, so there is nothing left to defer.

use crate::layout::ColumnRepr;

pub mod build;
pub mod exec;

#[derive(Debug)]
pub struct Query {
    pub sql_text: String,
    pub params: Vec<BoundParam>,
    pub output: Option<OutputExpr>,
}

/// A single bind parameter: the physical representation to encode it with, whether it
/// may be SQL NULL, and the JSON value to encode.
#[derive(Debug)]
pub struct BoundParam {
    pub repr: ColumnRepr,
    pub optional: bool,
    pub value: serde_json::Value,
}

/// Describes how to decode one result row into JSON.
#[derive(Debug)]
pub enum OutputExpr {
    /// Build a JSON object from named sub-expressions, in order.
    Object(Vec<(String, OutputExpr)>),
    /// Decode a scalar/enum column at the given zero-based index.
    Field { repr: ColumnRepr, optional: bool, col_idx: usize },
    /// A column whose text is already a JSON document (a relation aggregation blob, or
    /// a `Json`-typed scalar) — parsed verbatim rather than coerced.
    RawJson { col_idx: usize },
}
