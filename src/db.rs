//! The `Db` session façade: borrow-per-operation query execution on top of
//! the pool.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::pool::Pool;
use crate::result::{QueryResult, check_one_affected, check_one_returned};
use crate::statement::Statement;
use crate::transaction::Transaction;
use crate::value::{Collection, Discard, ToSql, interpolate};

/// A PostgreSQL database handle backed by a connection pool.
///
/// Every operation borrows one connection for its duration and returns it
/// afterwards; use [`Db::begin`] to pin a connection across operations.
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Db {
    pool: Arc<Pool>,
}

impl Db {
    /// Create a handle. Connections are established lazily on first use.
    pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        Ok(Self {
            pool: Arc::new(Pool::new(opts.try_into()?)),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Close the pool: drains idle connections and rejects new operations.
    pub fn close(&self) {
        self.pool.close_all();
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut crate::conn::Conn) -> Result<T>) -> Result<T> {
        let mut guard = self.pool.checkout()?;
        let result = f(&mut guard);
        let ok = match &result {
            Ok(_) => true,
            // Server errors leave the connection usable after draining
            Err(e) => !e.is_fatal(),
        };
        guard.mark_ok(ok);
        result
    }

    /// Execute a query, discarding any rows.
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

    /// Prepare a statement. The statement pins one pool connection until it
    /// is closed or dropped.
    pub fn prepare(&self, query: &str) -> Result<Statement<'_>> {
        let mut guard = self.pool.checkout()?;
        match guard.prepare(query) {
            Ok(info) => {
                guard.mark_ok(true);
                Ok(Statement::pinned(guard, info))
            }
            Err(e) => {
                guard.mark_ok(!e.is_fatal());
                Err(e)
            }
        }
    }

    /// Start a transaction: issues `BEGIN` on a freshly borrowed connection
    /// and pins it until commit or rollback.
    pub fn begin(&self) -> Result<Transaction> {
        Transaction::begin(&self.pool)
    }

    /// Run `COPY … FROM STDIN`, streaming `src` to the server.
    pub fn copy_from<R: Read>(
        &self,
        src: &mut R,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.copy_from(src, &sql))
    }

    /// Run `COPY … TO STDOUT`, streaming the server's output into `dst`.
    pub fn copy_to<W: Write>(
        &self,
        dst: &mut W,
        query: &str,
        params: &[&dyn ToSql],
    ) -> Result<QueryResult> {
        let sql = interpolate(query, params)?;
        self.with_conn(|conn| conn.copy_to(dst, &sql))
    }
}
