//! Explicit transactions pinned to one connection.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use crate::conn::{CancelToken, Conn};
use crate::error::{Error, Result};
use crate::pool::{Pool, PooledConn};
use crate::result::{QueryResult, check_one_affected, check_one_returned};
use crate::statement::Statement;
use crate::value::{Collection, Discard, ToSql, interpolate};

/// An explicit transaction.
///
/// Holds one pool connection from `BEGIN` until [`Transaction::commit`] or
/// [`Transaction::rollback`]; every operation dispatched through it (and
/// through statements prepared on it) uses that connection. Dropping an
/// unterminated transaction closes the connection, which implicitly rolls
/// back.
pub struct Transaction {
    conn: Mutex<Option<PooledConn>>,
}

impl Transaction {
    pub(crate) fn begin(pool: &Arc<Pool>) -> Result<Self> {
        let mut guard = pool.checkout()?;
        if let Err(e) = guard.simple_query("BEGIN", &mut Discard) {
            guard.mark_ok(!e.is_fatal());
            return Err(e);
        }
        Ok(Self {
            conn: Mutex::new(Some(guard)),
        })
    }

    /// Run `f` on the pinned connection.
    ///
    /// The connection stays pinned regardless of errors; only the terminal
    /// operations release it.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Conn) -> Result<T>) -> Result<T> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = slot
            .as_mut()
            .ok_or_else(|| Error::InvalidUsage("transaction already terminated".into()))?;
        f(guard)
    }

    fn finish(self, sql: &str) -> Result<()> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = slot
            .take()
            .ok_or_else(|| Error::InvalidUsage("transaction already terminated".into()))?;
        let result = guard.simple_query(sql, &mut Discard);
        let ok = match &result {
            Ok(_) => true,
            Err(e) => !e.is_fatal(),
        };
        guard.mark_ok(ok);
        drop(guard); // releases the connection to the pool
        result.map(|_| ())
    }

    /// Commit and release the connection.
    pub fn commit(self) -> Result<()> {
        self.finish("COMMIT")
    }

    /// Roll back and release the connection.
    pub fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    /// Execute a query on the transaction's connection, discarding rows.
    pub fn exec(&self, query: &str, params: &[&dyn ToSql]) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.simple_query(&sql, &mut Discard))
    }

    /// Execute a query that must affect exactly one row.
    pub fn exec_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<QueryResult> {
        check_one_affected(self.exec(query, params)?)
    }

    /// Execute a query, streaming rows into `dst`.
    pub fn query<C: Collection + ?Sized>(
        &self,
        dst: &mut C,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.simple_query(&sql, dst))
    }

    /// Execute a query that must return exactly one row.
    pub fn query_one<C: Collection + ?Sized>(
        &self,
        dst: &mut C,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        check_one_returned(self.query(dst, query, params)?)
    }

    /// Prepare a statement on the transaction's connection.
    ///
    /// The statement shares the pinned connection and must be dropped (or
    /// closed) before the transaction terminates.
    pub fn prepare(&self, query: &str) -> Result<Statement<'_>> {
        let info = self.with_conn(|conn| conn.prepare(query))?;
        Ok(Statement::on_transaction(self, info))
    }

    /// Run `COPY … FROM STDIN` inside the transaction.
    pub fn copy_from<R: Read>(
        &self,
        src: &mut R,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.copy_from(src, &sql))
    }

    /// Run `COPY … TO STDOUT` inside the transaction.
    pub fn copy_to<W: Write>(
        &self,
        dst: &mut W,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.copy_to(dst, &sql))
    }

    /// A token for out-of-band cancellation of this transaction's queries.
    pub fn cancel_token(&self) -> Result<Option<CancelToken>> {
        self.with_conn(|conn| Ok(conn.cancel_token()))
    }
}

// The pinned connection is released by PooledConn's own drop; it arrives at
// the pool with ok = false and is closed, which implicitly rolls back.
