use serde::{Deserialize, Serialize};

/// A small expression tree used for field defaults, computed-field SQL, and policy
/// conditions declared in the schema. Evaluated either by the dialect layer (defaults,
/// computed fields, compiled to SQL) or by the executor (policy conditions, evaluated
/// against the request's auth context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Expr {
    Literal(Literal),
    /// Reference to a field on the current model, or (in a policy condition) on a
    /// related model reached through `path`.
    Field {
        path: Vec<String>,
    },
    /// Reference into the request's auth context, e.g. `auth().id`.
    Auth {
        path: Vec<String>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Array(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnaryOp {
    Not,
}

impl Expr {
    pub fn literal(lit: impl Into<Literal>) -> Self {
        Expr::Literal(lit.into())
    }

    /// Names of the zero-argument built-in functions usable in a default expression:
    /// `now()`, `uuid()`, `cuid()`, `autoincrement()`, `dbgenerated()`.
    pub fn is_builtin_default_call(name: &str) -> bool {
        matches!(name, "now" | "uuid" | "cuid" | "autoincrement" | "dbgenerated")
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Float(n)
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::String(s)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_default_call_names() {
        assert!(Expr::is_builtin_default_call("now"));
        assert!(Expr::is_builtin_default_call("uuid"));
        assert!(!Expr::is_builtin_default_call("random"));
    }

    #[test]
    fn literal_conversions_round_trip_through_serde() {
        let e = Expr::literal(42i64);
        let json = serde_json::to_value(&e).unwrap();
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(e, back);
    }
}
