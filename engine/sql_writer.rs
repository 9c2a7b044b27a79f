use anyhow::{bail, Result};
use sqlx::any::AnyKind;
use std::fmt::{self, Write};

use crate::layout;

/// Incrementally builds a single parameterized SQL statement, handling the handful of
/// places dialect syntax actually diverges: identifier quoting and parameter
/// placeholders. Everything above this layer (filters, joins, relation selection) is
/// dialect-agnostic text assembled by the planner and the `Dialect` implementations.
#[derive(Debug)]
pub struct SqlWriter {
    kind: AnyKind,
    text: String,
}

impl SqlWriter {
    pub fn new(kind: AnyKind) -> Self {
        Self {
            kind,
            text: String::new(),
        }
    }

    pub fn kind(&self) -> AnyKind {
        self.kind
    }

    pub fn write<T: WriteSql + ?Sized>(&mut self, x: &T) {
        x.write_sql(self);
    }

    pub fn write_str(&mut self, x: &str) {
        self.text.push_str(x);
    }

    /// Appends the name as a quoted identifier. MySQL uses backticks; Postgres and
    /// SQLite both accept ANSI double quotes.
    pub fn write_name(&mut self, name: &layout::Name) {
        let name = &name.0;
        let quote = if matches!(self.kind, AnyKind::MySql) {
            '`'
        } else {
            '"'
        };
        self.text.reserve(2 + name.len());
        self.text.push(quote);
        for c in name.chars() {
            if c == quote {
                self.text.push(quote);
                self.text.push(quote);
            } else {
                self.text.push(c);
            }
        }
        self.text.push(quote);
    }

    /// Appends a table's name, schema-qualified when the table carries a `db_schema`
    /// and the dialect supports one (Postgres; §6).
    pub fn write_table_name(&mut self, table: &layout::ModelTable) {
        if let (Some(schema), AnyKind::Postgres) = (&table.db_schema, self.kind) {
            self.write_name(&layout::Name(schema.clone()));
            self.text.push('.');
        }
        self.write_name(&table.table_name);
    }

    /// Appends a parameter with given **zero-based** index.
    ///
    /// Uses the dialect-correct placeholder syntax: `?n` for SQLite, `$n` for Postgres,
    /// bare `?` for MySQL (which has no positional numbering). `idx` is zero-based, but
    /// the SQL syntax is one-based, so `idx` of 0 produces `?1` (or `$1`).
    pub fn write_param(&mut self, idx: usize) {
        match self.kind {
            AnyKind::Sqlite => write!(self, "?{}", idx + 1),
            AnyKind::Postgres => write!(self, "${}", idx + 1),
            AnyKind::MySql => write!(self, "?"),
            _ => write!(self, "?{}", idx + 1),
        }
    }

    /// Appends a literal string into the SQL statement.
    pub fn write_literal_str(&mut self, value: &str) -> Result<()> {
        self.text.reserve(2 + value.len());
        self.text.push('\'');
        for c in value.chars() {
            if c == '\'' {
                self.text.push_str("''");
            } else if c == '\0' {
                bail!("cannot insert a NUL byte into a SQL literal string")
            } else {
                self.text.push(c);
            }
        }
        self.text.push('\'');
        Ok(())
    }

    /// Appends a literal float into the SQL statement.
    pub fn write_literal_f64(&mut self, value: f64) -> Result<()> {
        if value.is_finite() {
            write!(self, "{}", value);
        } else if value.is_infinite() {
            match (self.kind, value.is_sign_positive()) {
                // impossibly large values are parsed as infinity in SQLite
                (AnyKind::Sqlite, true) => self.write_str("9e999"),
                (AnyKind::Sqlite, false) => self.write_str("-9e999"),
                (_, true) => self.write_str("CAST('inf' AS double precision)"),
                (_, false) => self.write_str("CAST('-inf' AS double precision)"),
            }
        } else {
            bail!("cannot use NaN as a SQL literal")
        }
        Ok(())
    }

    /// Makes the `write!` macro work with this struct.
    pub fn write_fmt(&mut self, fmt: fmt::Arguments<'_>) {
        self.text.write_fmt(fmt).expect("formatting failed")
    }

    pub fn build(self) -> String {
        self.text
    }
}

pub trait WriteSql {
    fn write_sql(&self, writer: &mut SqlWriter);
}

impl WriteSql for str {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for String {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for layout::Name {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_name(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_params_are_numbered() {
        let mut w = SqlWriter::new(AnyKind::Sqlite);
        w.write_param(0);
        w.write_str(", ");
        w.write_param(1);
        assert_eq!(w.build(), "?1, ?2");
    }

    #[test]
    fn mysql_params_are_bare() {
        let mut w = SqlWriter::new(AnyKind::MySql);
        w.write_param(0);
        w.write_str(", ");
        w.write_param(1);
        assert_eq!(w.build(), "?, ?");
    }

    #[test]
    fn name_quoting_escapes_embedded_quote() {
        let mut w = SqlWriter::new(AnyKind::Postgres);
        w.write_name(&layout::Name("weird\"name".to_owned()));
        assert_eq!(w.build(), "\"weird\"\"name\"");
    }

    #[test]
    fn mysql_uses_backticks() {
        let mut w = SqlWriter::new(AnyKind::MySql);
        w.write_name(&layout::Name("col".to_owned()));
        assert_eq!(w.build(), "`col`");
    }

    #[test]
    fn literal_string_escapes_single_quote() {
        let mut w = SqlWriter::new(AnyKind::Sqlite);
        w.write_literal_str("O'Brien").unwrap();
        assert_eq!(w.build(), "'O''Brien'");
    }

    #[test]
    fn literal_string_rejects_nul_byte() {
        let mut w = SqlWriter::new(AnyKind::Sqlite);
        assert!(w.write_literal_str("a\0b").is_err());
    }
}
