use super::{BoundParam, OutputExpr, Query};
use crate::layout::ColumnRepr;
use crate::sql_writer::SqlWriter;

/// Accumulates SQL text and bind parameters for one statement. Call [`Self::add_param`]
/// to register a value, then immediately `sql.write_param(idx)` at the same position —
/// mirroring how `SqlWriter::write_param` takes a zero-based index.
#[derive(Debug)]
pub struct QueryBuilder {
    pub sql: SqlWriter,
    params: Vec<BoundParam>,
    output: Option<OutputExpr>,
}

impl QueryBuilder {
    pub fn new(kind: sqlx::any::AnyKind) -> Self {
        Self {
            sql: SqlWriter::new(kind),
            params: Vec::new(),
            output: None,
        }
    }

    pub fn add_param(&mut self, repr: ColumnRepr, optional: bool, value: serde_json::Value) -> usize {
        let idx = self.params.len();
        self.params.push(BoundParam { repr, optional, value });
        idx
    }

    pub fn output(&mut self, output: OutputExpr) {
        assert!(self.output.is_none(), "query output set twice");
        self.output = Some(output);
    }

    pub fn build(self) -> Query {
        Query {
            sql_text: self.sql.build(),
            params: self.params,
            output: self.output,
        }
    }
}
