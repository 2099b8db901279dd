//! A synchronous PostgreSQL client library.
//!
//! # Features
//!
//! - **v3 wire protocol in text format**: simple query, extended query,
//!   COPY IN/OUT, out-of-band cancellation
//! - **Sans-I/O state machines**: protocol logic is separated from I/O
//! - **Bounded FIFO connection pool** with blocking acquisition, acquire
//!   timeouts, and health tracking
//! - **Typed values**: placeholder interpolation (`?` and `$N`) with proper
//!   quoting, and destination-driven row loading
//!
//! # Example
//!
//! ```no_run
//! use pgtext::{Db, Opts, load_into};
//!
//! fn main() -> pgtext::Result<()> {
//!     let db = Db::connect(Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     })?;
//!
//!     db.exec("CREATE TEMP TABLE words (word text, len int)", &[])?;
//!     db.exec("INSERT INTO words VALUES (?, ?)", &[&"hello", &5_i32])?;
//!
//!     let mut rows: Vec<(String, i32)> = Vec::new();
//!     db.query(&mut rows, "SELECT word, len FROM words", &[])?;
//!
//!     let mut count = 0_i64;
//!     db.query_one(&mut load_into(&mut count), "SELECT count(*) FROM words", &[])?;
//!
//!     let tx = db.begin()?;
//!     tx.exec("UPDATE words SET len = len + 1", &[])?;
//!     tx.commit()?;
//!
//!     db.close();
//!     Ok(())
//! }
//! ```

pub mod conn;
pub mod db;
pub mod error;
pub mod opts;
pub mod pool;
pub mod protocol;
pub mod result;
pub mod state;
pub mod statement;
pub mod stream;
pub mod transaction;
pub mod value;

pub use conn::{CancelToken, Conn};
pub use db::Db;
pub use error::{Error, Result, ServerError};
pub use opts::{Network, Opts, SslMode};
pub use pool::{Pool, PooledConn};
pub use protocol::types::TransactionStatus;
pub use result::QueryResult;
pub use statement::Statement;
pub use transaction::Transaction;
pub use value::{
    Collection, Discard, FromSql, Ints, Json, LoadInto, Loader, Strings, ToSql, Value, load_into,
};
