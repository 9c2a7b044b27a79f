use anyhow::{Context, Result};
use std::sync::Arc;

use crate::conn::DataConn;
use crate::layout;

/// Isolation level for an explicit or gated transaction. SQLite ignores this (it has a
/// single serializable mode); Postgres and MySQL honor it via `SET TRANSACTION
/// ISOLATION LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// A single open transaction bound to one connection, borrowed from [`DataConn`] for the
/// lifetime of one mutation or one interactive `$transaction` block.
pub struct DataCtx {
    pub layout: Arc<layout::Layout>,
    pub txn: sqlx::Transaction<'static, sqlx::Any>,
    /// Set for the duration of a mutation hook invocation so any SQL the hook itself
    /// triggers on this same context does not re-enter the mutation-hook pipeline (§4.6
    /// "Suppression"). `onDriverQuery` still applies while this is set.
    pub hooks_suppressed: bool,
}

impl DataCtx {
    pub async fn begin(conn: &DataConn) -> Result<DataCtx> {
        let txn = conn
            .pool
            .begin()
            .await
            .context("could not begin an SQL transaction")?;
        Ok(Self {
            layout: conn.layout.clone(),
            txn,
            hooks_suppressed: false,
        })
    }

    /// Begins a transaction and, for dialects that support it, sets the isolation
    /// level. SQLite has no `SET TRANSACTION ISOLATION LEVEL` statement so the request
    /// is accepted and silently ignored there, matching §4.6 ("READ COMMITTED
    /// (Postgres) / default (SQLite)").
    pub async fn begin_with_isolation(conn: &DataConn, level: IsolationLevel) -> Result<DataCtx> {
        let mut ctx = Self::begin(conn).await?;
        if !matches!(conn.kind(), sqlx::any::AnyKind::Sqlite) {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql());
            sqlx::query(&sql)
                .execute(&mut *ctx.txn)
                .await
                .context("could not set transaction isolation level")?;
        }
        Ok(ctx)
    }

    pub async fn commit(self) -> Result<()> {
        self.txn
            .commit()
            .await
            .context("could not commit SQL transaction")
    }

    pub async fn rollback(self) -> Result<()> {
        self.txn
            .rollback()
            .await
            .context("could not rollback SQL transaction")
    }
}
