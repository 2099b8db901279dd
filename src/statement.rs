//! Prepared statements.
//!
//! A prepared statement references server-side state that exists only on
//! one connection. A statement prepared on [`Db`](crate::Db) pins its pool
//! connection for the statement's lifetime; one prepared on a
//! [`Transaction`](crate::Transaction) shares the transaction's pinned
//! connection.

use std::sync::{Mutex, PoisonError};

use crate::conn::{CancelToken, Conn};
use crate::error::{Error, Result};
use crate::pool::PooledConn;
use crate::result::{QueryResult, check_one_affected, check_one_returned};
use crate::state::extended::PreparedInfo;
use crate::transaction::Transaction;
use crate::value::{Collection, Discard, ToSql};

enum StmtConn<'a> {
    /// Prepared on Db: the statement owns the borrowed connection.
    Pinned(Mutex<Option<PooledConn>>),
    /// Prepared inside a transaction: shares the transaction's connection.
    Tx(&'a Transaction),
}

/// A prepared statement.
///
/// Executes over the extended query protocol with text-format parameters.
/// Closing (or dropping) a Db-prepared statement returns its connection to
/// the pool.
pub struct Statement<'a> {
    conn: StmtConn<'a>,
    info: PreparedInfo,
    closed: bool,
}

impl<'a> Statement<'a> {
    pub(crate) fn pinned(conn: PooledConn, info: PreparedInfo) -> Statement<'static> {
        Statement {
            conn: StmtConn::Pinned(Mutex::new(Some(conn))),
            info,
            closed: false,
        }
    }

    pub(crate) fn on_transaction(tx: &'a Transaction, info: PreparedInfo) -> Statement<'a> {
        Statement {
            conn: StmtConn::Tx(tx),
            info,
            closed: false,
        }
    }

    /// Number of parameters the statement expects.
    pub fn param_count(&self) -> usize {
        self.info.param_oids.len()
    }

    /// Names of the result columns (empty if the statement returns no rows).
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.info.columns.iter().map(|c| c.name.as_str())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Conn) -> Result<T>) -> Result<T> {
        match &self.conn {
            StmtConn::Pinned(slot) => {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                let guard = slot
                    .as_mut()
                    .ok_or_else(|| Error::InvalidUsage("statement is closed".into()))?;
                f(guard)
            }
            StmtConn::Tx(tx) => tx.with_conn(f),
        }
    }

    /// Execute the statement, discarding any rows.
    pub fn exec(&self, params: &[&dyn ToSql]) -> Result<QueryResult> {
        self.with_conn(|conn| conn.execute_prepared(&self.info, params, &mut Discard))
    }

    /// Execute the statement; it must affect exactly one row.
    pub fn exec_one(&self, params: &[&dyn ToSql]) -> Result<QueryResult> {
        check_one_affected(self.exec(params)?)
    }

    /// Execute the statement, streaming rows into `dst`.
    pub fn query<C: Collection + ?Sized>(
        &self,
        dst: &mut C,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        self.with_conn(|conn| conn.execute_prepared(&self.info, params, dst))
    }

    /// Execute the statement; it must return exactly one row.
    pub fn query_one<C: Collection + ?Sized>(
        &self,
        dst: &mut C,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        check_one_returned(self.query(dst, params)?)
    }

    /// A token for out-of-band cancellation of this statement's queries.
    pub fn cancel_token(&self) -> Result<Option<CancelToken>> {
        self.with_conn(|conn| Ok(conn.cancel_token()))
    }

    /// Close the statement on the server. For a Db-prepared statement this
    /// releases the pinned connection back to the pool.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        match &mut self.conn {
            StmtConn::Pinned(slot) => {
                let taken = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let mut guard =
                    taken.ok_or_else(|| Error::InvalidUsage("statement is closed".into()))?;
                let result = guard.close_statement(&self.info.name);
                let ok = match &result {
                    Ok(()) => true,
                    Err(e) => !e.is_fatal(),
                };
                guard.mark_ok(ok);
                result
            }
            StmtConn::Tx(tx) => tx.with_conn(|conn| conn.close_statement(&self.info.name)),
        }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match &mut self.conn {
            StmtConn::Pinned(slot) => {
                let taken = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(mut guard) = taken {
                    let ok = guard.close_statement(&self.info.name).is_ok();
                    guard.mark_ok(ok);
                }
            }
            StmtConn::Tx(tx) => {
                let _ = tx.with_conn(|conn| conn.close_statement(&self.info.name));
            }
        }
    }
}
