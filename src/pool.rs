//! Bounded FIFO connection pool.
//!
//! Invariants: `idle + borrowed + dialing = live <= capacity` at all times;
//! idle connections are reused oldest-first; blocked waiters are served in
//! arrival order. A connection released broken, or in any non-idle
//! transaction state, is closed instead of reused.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::debug;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::types::TransactionStatus;

/// Bounded pool of PostgreSQL connections.
pub struct Pool {
    opts: Opts,
    capacity: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    idle: VecDeque<Conn>,
    /// idle + borrowed + connections currently being established
    live: usize,
    waiters: VecDeque<Arc<Waiter>>,
    closed: bool,
}

struct Waiter {
    slot: Mutex<WaitSlot>,
    cond: Condvar,
}

enum WaitSlot {
    Waiting,
    /// Handed an idle connection directly
    Granted(Box<Conn>),
    /// Granted capacity to establish a fresh connection
    Permit,
    Closed,
    /// The waiter timed out and left
    Abandoned,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pool {
    /// Create a pool; connections are established lazily.
    pub fn new(opts: Opts) -> Self {
        let capacity = opts.pool_size.max(1);
        Self {
            capacity,
            opts,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Maximum number of live connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle connections right now.
    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle.len()
    }

    /// Number of live connections (idle + borrowed + being established).
    pub fn live_count(&self) -> usize {
        lock(&self.state).live
    }

    /// Borrow a connection, blocking up to the configured acquire timeout.
    ///
    /// Reuses the oldest idle connection, establishes a new one while
    /// `live < capacity`, and otherwise queues behind earlier waiters.
    pub fn get(&self) -> Result<Conn> {
        let waiter = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Error::PoolClosed);
            }

            // Waiters that timed out stay queued until skipped; drop them so
            // they don't make newcomers queue behind nobody.
            state
                .waiters
                .retain(|w| !matches!(*lock(&w.slot), WaitSlot::Abandoned));

            if state.waiters.is_empty() {
                if let Some(conn) = state.idle.pop_front() {
                    return Ok(conn);
                }
                if state.live < self.capacity {
                    state.live += 1;
                    drop(state);
                    return self.establish();
                }
            }

            let waiter = Arc::new(Waiter {
                slot: Mutex::new(WaitSlot::Waiting),
                cond: Condvar::new(),
            });
            state.waiters.push_back(Arc::clone(&waiter));
            waiter
        };

        self.wait_for_grant(&waiter)
    }

    fn wait_for_grant(&self, waiter: &Waiter) -> Result<Conn> {
        let deadline = self.opts.acquire_timeout.map(|t| Instant::now() + t);
        let mut slot = lock(&waiter.slot);
        loop {
            match std::mem::replace(&mut *slot, WaitSlot::Waiting) {
                WaitSlot::Granted(conn) => return Ok(*conn),
                WaitSlot::Permit => {
                    drop(slot);
                    return self.establish();
                }
                WaitSlot::Closed => return Err(Error::PoolClosed),
                WaitSlot::Waiting | WaitSlot::Abandoned => {}
            }

            slot = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *slot = WaitSlot::Abandoned;
                        return Err(Error::PoolTimeout);
                    }
                    waiter
                        .cond
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => waiter
                    .cond
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Dial a new connection; `live` was already reserved by the caller.
    fn establish(&self) -> Result<Conn> {
        match Conn::connect(self.opts.clone()) {
            Ok(conn) => {
                debug!("pool: established new connection");
                Ok(conn)
            }
            Err(e) => {
                lock(&self.state).live -= 1;
                // The freed capacity may unblock the next waiter
                self.grant_capacity();
                Err(e)
            }
        }
    }

    /// Hand freed capacity to the oldest live waiter as a dial permit.
    fn grant_capacity(&self) {
        let mut state = lock(&self.state);
        if state.closed || state.live >= self.capacity {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            let mut slot = lock(&waiter.slot);
            if matches!(*slot, WaitSlot::Waiting) {
                *slot = WaitSlot::Permit;
                state.live += 1;
                waiter.cond.notify_one();
                return;
            }
        }
    }

    /// Return a borrowed connection.
    ///
    /// `ok` reports whether the last operation left the connection in a
    /// known-good state. Broken connections, connections inside a
    /// transaction block, and returns after `close_all` are closed.
    pub fn put(&self, conn: Conn, ok: bool) {
        let reusable =
            ok && !conn.is_broken() && conn.transaction_status() == TransactionStatus::Idle;

        let mut state = lock(&self.state);
        if !reusable || state.closed {
            state.live -= 1;
            drop(state);
            debug!("pool: closing connection on release");
            drop(conn); // sends Terminate
            self.grant_capacity();
            return;
        }

        // Strict FIFO: the oldest live waiter gets the connection directly;
        // abandoned waiters are skipped.
        while let Some(waiter) = state.waiters.pop_front() {
            let mut slot = lock(&waiter.slot);
            if matches!(*slot, WaitSlot::Waiting) {
                *slot = WaitSlot::Granted(Box::new(conn));
                waiter.cond.notify_one();
                return;
            }
        }
        state.idle.push_back(conn);
    }

    /// Close every idle connection, fail all waiters with a pool-closed
    /// error, and reject further acquisitions.
    pub fn close_all(&self) {
        let (idle, waiters) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.live -= state.idle.len();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        for waiter in waiters {
            let mut slot = lock(&waiter.slot);
            if matches!(*slot, WaitSlot::Waiting) {
                *slot = WaitSlot::Closed;
                waiter.cond.notify_one();
            }
        }
        debug!("pool: closed, dropping {} idle connections", idle.len());
        drop(idle);
    }

    /// Borrow a connection wrapped in a guard that returns it on scope exit.
    ///
    /// The guard releases with `ok = false` unless [`PooledConn::mark_ok`]
    /// is called, so panics and early returns close the connection instead
    /// of recycling it in an unknown state.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledConn> {
        let conn = self.get()?;
        Ok(PooledConn {
            pool: Arc::clone(self),
            conn: Some(conn),
            ok: false,
        })
    }
}

/// A borrowed connection tied to its pool; released on drop.
pub struct PooledConn {
    pool: Arc<Pool>,
    conn: Option<Conn>,
    ok: bool,
}

impl PooledConn {
    /// Record whether the connection is in a known-good state for reuse.
    pub fn mark_ok(&mut self, ok: bool) {
        self.ok = ok;
    }
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("connection already released")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, self.ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_opts() -> Opts {
        Opts {
            host: String::new(), // dialing fails immediately
            user: "postgres".into(),
            pool_size: 2,
            ..Opts::default()
        }
    }

    #[test]
    fn dial_failure_releases_capacity() {
        let pool = Pool::new(unreachable_opts());
        for _ in 0..5 {
            assert!(pool.get().is_err());
        }
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn closed_pool_rejects_acquisition() {
        let pool = Pool::new(unreachable_opts());
        pool.close_all();
        assert!(matches!(pool.get(), Err(Error::PoolClosed)));
        // Idempotent
        pool.close_all();
        assert!(matches!(pool.get(), Err(Error::PoolClosed)));
    }

    #[test]
    fn capacity_is_at_least_one() {
        let pool = Pool::new(Opts {
            pool_size: 0,
            ..unreachable_opts()
        });
        assert_eq!(pool.capacity(), 1);
    }
}
