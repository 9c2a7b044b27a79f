use thiserror::Error;

/// The error taxonomy exposed to callers. Internal plumbing (layout construction, SQL
/// assembly) returns `anyhow::Result` and is converted to one of these variants only at
/// the client-surface boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input at {path}: {message}")]
    InputValidation { path: String, message: String },

    #[error("{model} not found")]
    NotFound { model: String },

    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// A registered plugin's `onEntityMutation` hook returned `Err`, vetoing the
    /// mutation (§4.6). Distinct from `NotSupported`: the engine is fully capable of the
    /// operation, a host-registered business rule rejected this particular row.
    #[error("mutation rejected by plugin: {0}")]
    MutationRejected(String),

    #[error("database query failed: {message}")]
    DbQuery {
        sql: String,
        params: Vec<serde_json::Value>,
        message: String,
        #[source]
        cause: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn input_validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InputValidation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(model: impl Into<String>) -> Self {
        EngineError::NotFound { model: model.into() }
    }

    pub fn not_supported(what: impl Into<String>) -> Self {
        EngineError::NotSupported(what.into())
    }

    pub fn db_query(sql: impl Into<String>, params: Vec<serde_json::Value>, cause: anyhow::Error) -> Self {
        EngineError::DbQuery {
            sql: sql.into(),
            params,
            message: cause.to_string(),
            cause,
        }
    }

    /// True for errors assertion helpers raise when an internal invariant the planner
    /// relies on does not hold — per §7, these should never be reachable from valid
    /// inputs.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_query_error_retains_the_original_cause() {
        let cause = anyhow::anyhow!("unique constraint failed");
        let err = EngineError::db_query("INSERT ...", vec![serde_json::json!(1)], cause);
        match &err {
            EngineError::DbQuery { message, .. } => assert!(message.contains("unique constraint")),
            _ => panic!("wrong variant"),
        }
    }
}
