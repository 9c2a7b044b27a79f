use std::sync::Arc;

use crate::dialect::{self, Dialect};
use crate::layout;

/// Pool-backed handle to the database. Shared by every client cloned from the same
/// root; a [`crate::ctx::DataCtx`] borrows it to open a transaction.
#[derive(Debug, Clone)]
pub struct DataConn {
    pub layout: Arc<layout::Layout>,
    pub pool: sqlx::AnyPool,
}

impl DataConn {
    pub fn new(layout: Arc<layout::Layout>, pool: sqlx::AnyPool) -> Self {
        Self { layout, pool }
    }

    pub fn kind(&self) -> sqlx::any::AnyKind {
        self.pool.any_kind()
    }

    /// Resolves the SQL dialect implementation for this connection's driver.
    pub fn dialect(&self) -> Arc<dyn Dialect> {
        dialect::for_kind(self.kind())
    }
}
