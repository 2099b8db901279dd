//! A single PostgreSQL connection.
//!
//! Owns the socket and drives the sans-I/O state machines against it. One
//! logical operation at a time: every method takes `&mut self` and runs its
//! exchange to ReadyForQuery before returning.

use std::io::{Read, Write};

use log::debug;

use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{
    BackendKeyData, CloseComplete, CommandComplete, DataRow, ErrorResponse, ReadyForQuery,
    RowDescription, is_async_type, msg_type,
};
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::BufferSet;
use crate::state::action::Action;
use crate::state::connection::ConnectionStateMachine;
use crate::state::extended::{ExecuteStateMachine, PrepareStateMachine, PreparedInfo};
use crate::state::simple_query::{QueryHandler, SimpleQueryStateMachine};
use crate::stream::Stream;
use crate::value::{Collection, ToSql};

/// CopyData frames sent during copy-in are bounded to this payload size.
const COPY_CHUNK_SIZE: usize = 8192;

/// A single PostgreSQL connection.
pub struct Conn {
    stream: Stream,
    buffer_set: BufferSet,
    write_buffer: Vec<u8>,
    opts: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    is_broken: bool,
    next_stmt_id: u64,
}

impl Conn {
    /// Connect and run the startup/authentication handshake.
    pub fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let mut stream = Stream::connect(&opts)?;

        if opts.ssl_mode != SslMode::Disable {
            stream = Self::negotiate_ssl(stream, &opts)?;
        }

        let mut buffer_set = BufferSet::new();
        let mut machine = ConnectionStateMachine::new(opts.clone());

        match machine.start() {
            Action::WritePacket(data) => stream.send(data)?,
            _ => return Err(Error::Protocol("unexpected initial startup action".into())),
        }

        loop {
            stream.read_message(&mut buffer_set)?;
            match machine.step(&buffer_set)? {
                Action::NeedPacket => {}
                Action::WritePacket(data) => stream.send(data)?,
                Action::Finished => break,
                Action::CopyInStarted => {
                    return Err(Error::Protocol("unexpected copy mode during startup".into()));
                }
            }
        }

        debug!(
            "connected to {:?} database {:?} as {:?}",
            opts.host, opts.database, opts.user
        );

        Ok(Self {
            stream,
            buffer_set,
            write_buffer: Vec::with_capacity(8192),
            backend_key: machine.backend_key().copied(),
            server_params: machine.server_params().to_vec(),
            transaction_status: machine.transaction_status(),
            opts,
            is_broken: false,
            next_stmt_id: 0,
        })
    }

    fn negotiate_ssl(mut stream: Stream, opts: &Opts) -> Result<Stream> {
        let mut buf = Vec::new();
        frontend::ssl_request(&mut buf);
        stream.send(&buf)?;

        match stream.read_byte()? {
            b'S' => {
                #[cfg(feature = "tls")]
                {
                    stream.upgrade_tls(&opts.host)
                }
                #[cfg(not(feature = "tls"))]
                Err(Error::InvalidUsage(
                    "server accepted SSL but the tls feature is not enabled".into(),
                ))
            }
            b'N' => {
                if opts.ssl_mode == SslMode::Require {
                    return Err(Error::Auth("SSL required but not supported by server".into()));
                }
                Ok(stream)
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSL response: {}",
                other
            ))),
        }
    }

    /// Server parameters reported during startup (and updated since).
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get a specific server parameter.
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The current transaction status byte from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if currently in a transaction block.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// True once a framing, socket, or fatal server error occurred; the pool
    /// closes broken connections on release.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    /// A token for out-of-band cancellation of this connection's queries.
    ///
    /// `None` if the server did not send BackendKeyData.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|key| CancelToken {
            opts: self.opts.clone(),
            pid: key.process_id(),
            secret: key.secret(),
        })
    }

    fn mark_broken_on_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.is_broken = true;
            }
        }
        result
    }

    fn apply_param_changes(&mut self, changes: &[(String, String)]) {
        for (name, value) in changes {
            if let Some(entry) = self.server_params.iter_mut().find(|(n, _)| n == name) {
                entry.1 = value.clone();
            } else {
                self.server_params.push((name.clone(), value.clone()));
            }
        }
    }

    /// Run a simple query, streaming rows into `dst`.
    pub fn simple_query<C: Collection + ?Sized>(
        &mut self,
        sql: &str,
        dst: &mut C,
    ) -> Result<QueryResult> {
        let result = self.simple_query_inner(sql, dst, None);
        self.mark_broken_on_fatal(result)
    }

    /// Run a `COPY … FROM STDIN` query, pumping `src` into CopyData frames.
    pub fn copy_from(&mut self, src: &mut dyn Read, sql: &str) -> Result<QueryResult> {
        let result = self.simple_query_inner(sql, &mut crate::value::Discard, Some(src));
        self.mark_broken_on_fatal(result)
    }

    /// Run a `COPY … TO STDOUT` query, streaming CopyData frames into `dst`.
    pub fn copy_to(&mut self, dst: &mut dyn Write, sql: &str) -> Result<QueryResult> {
        let mut handler = CopyOutHandler { dst, affected: 0 };
        let mut machine = SimpleQueryStateMachine::new(&mut handler);
        let run = self.drive_simple(sql, &mut machine, None).and_then(|()| {
            self.transaction_status = machine.transaction_status();
            let changes = machine.param_changes().to_vec();
            self.apply_param_changes(&changes);
            match machine.take_error() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        });
        drop(machine);
        let result = run.map(|()| QueryResult::new(handler.affected, 0));
        self.mark_broken_on_fatal(result)
    }

    fn simple_query_inner<C: Collection + ?Sized>(
        &mut self,
        sql: &str,
        dst: &mut C,
        copy_src: Option<&mut dyn Read>,
    ) -> Result<QueryResult> {
        let mut handler = LoaderHandler::new(dst);
        let mut machine = SimpleQueryStateMachine::new(&mut handler);
        self.drive_simple(sql, &mut machine, copy_src)?;

        self.transaction_status = machine.transaction_status();
        let changes = machine.param_changes().to_vec();
        self.apply_param_changes(&changes);
        if let Some(err) = machine.take_error() {
            return Err(err);
        }
        drop(machine);
        Ok(QueryResult::new(handler.affected, handler.returned))
    }

    fn drive_simple<H: QueryHandler>(
        &mut self,
        sql: &str,
        machine: &mut SimpleQueryStateMachine<H>,
        mut copy_src: Option<&mut dyn Read>,
    ) -> Result<()> {
        match machine.start(sql) {
            Action::WritePacket(data) => self.stream.send(data)?,
            _ => return Err(Error::Protocol("unexpected query start action".into())),
        }

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            match machine.step(&self.buffer_set)? {
                Action::NeedPacket => {}
                Action::WritePacket(data) => self.stream.send(data)?,
                Action::CopyInStarted => match copy_src.as_deref_mut() {
                    Some(src) => self.pump_copy_in(src)?,
                    None => {
                        // Not a copy operation; refuse so the server aborts
                        self.write_buffer.clear();
                        frontend::copy_fail(
                            &mut self.write_buffer,
                            "COPY FROM STDIN requires copy_from",
                        );
                        self.stream.send(&self.write_buffer)?;
                    }
                },
                Action::Finished => return Ok(()),
            }
        }
    }

    fn pump_copy_in(&mut self, src: &mut dyn Read) -> Result<()> {
        let mut chunk = [0u8; COPY_CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            match src.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    self.write_buffer.clear();
                    frontend::copy_data(&mut self.write_buffer, &chunk[..n]);
                    self.stream.write_all(&self.write_buffer)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The server answers CopyFail with an ErrorResponse,
                    // which the machine surfaces after draining.
                    self.write_buffer.clear();
                    frontend::copy_fail(&mut self.write_buffer, &e.to_string());
                    self.stream.send(&self.write_buffer)?;
                    return Ok(());
                }
            }
        }
        self.write_buffer.clear();
        frontend::copy_done(&mut self.write_buffer);
        self.stream.send(&self.write_buffer)?;
        debug!("copy-in finished, {} bytes", total);
        Ok(())
    }

    /// Prepare a statement; the returned description is only valid on this
    /// connection.
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedInfo> {
        let result = self.prepare_inner(sql);
        self.mark_broken_on_fatal(result)
    }

    fn prepare_inner(&mut self, sql: &str) -> Result<PreparedInfo> {
        let name = format!("pgtext_s{}", self.next_stmt_id);
        self.next_stmt_id += 1;

        let mut machine = PrepareStateMachine::new(name);
        match machine.start(sql) {
            Action::WritePacket(data) => self.stream.send(data)?,
            _ => return Err(Error::Protocol("unexpected prepare start action".into())),
        }

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            match machine.step(&self.buffer_set)? {
                Action::NeedPacket => {}
                Action::WritePacket(data) => self.stream.send(data)?,
                Action::Finished => break,
                Action::CopyInStarted => {
                    return Err(Error::Protocol("unexpected copy mode while preparing".into()));
                }
            }
        }

        self.transaction_status = machine.transaction_status();
        if let Some(err) = machine.take_error() {
            return Err(err);
        }
        Ok(machine.into_info())
    }

    /// Execute a prepared statement with text-format parameters.
    pub fn execute_prepared<C: Collection + ?Sized>(
        &mut self,
        info: &PreparedInfo,
        params: &[&dyn ToSql],
        dst: &mut C,
    ) -> Result<QueryResult> {
        let result = self.execute_prepared_inner(info, params, dst);
        self.mark_broken_on_fatal(result)
    }

    fn execute_prepared_inner<C: Collection + ?Sized>(
        &mut self,
        info: &PreparedInfo,
        params: &[&dyn ToSql],
        dst: &mut C,
    ) -> Result<QueryResult> {
        if params.len() != info.param_oids.len() {
            return Err(Error::Encode(format!(
                "statement {:?} expects {} parameters, got {}",
                info.name,
                info.param_oids.len(),
                params.len()
            )));
        }

        // Encoding failures happen before any wire I/O
        let mut encoded = Vec::with_capacity(params.len());
        for param in params {
            encoded.push(param.to_text()?.map(String::into_bytes));
        }

        let mut handler = LoaderHandler::new(dst);
        handler.columns = info.columns.iter().map(|c| c.name.clone()).collect();

        let mut machine = ExecuteStateMachine::new(&mut handler);
        match machine.start(&info.name, &encoded) {
            Action::WritePacket(data) => self.stream.send(data)?,
            _ => return Err(Error::Protocol("unexpected execute start action".into())),
        }

        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            match machine.step(&self.buffer_set)? {
                Action::NeedPacket => {}
                Action::WritePacket(data) => self.stream.send(data)?,
                Action::Finished => break,
                Action::CopyInStarted => {
                    return Err(Error::Protocol(
                        "COPY is not supported through prepared statements".into(),
                    ));
                }
            }
        }

        self.transaction_status = machine.transaction_status();
        if let Some(err) = machine.take_error() {
            return Err(err);
        }
        drop(machine);
        Ok(QueryResult::new(handler.affected, handler.returned))
    }

    /// Close a prepared statement on the server.
    pub fn close_statement(&mut self, name: &str) -> Result<()> {
        let result = self.close_statement_inner(name);
        self.mark_broken_on_fatal(result)
    }

    fn close_statement_inner(&mut self, name: &str) -> Result<()> {
        self.write_buffer.clear();
        frontend::close_statement(&mut self.write_buffer, name);
        frontend::sync(&mut self.write_buffer);
        self.stream.send(&self.write_buffer)?;

        let mut pending: Option<Error> = None;
        loop {
            self.stream.read_message(&mut self.buffer_set)?;
            let type_byte = self.buffer_set.type_byte;
            match type_byte {
                msg_type::CLOSE_COMPLETE => {
                    CloseComplete::parse(&self.buffer_set.read_buffer)?;
                }
                msg_type::ERROR_RESPONSE => {
                    let error = ErrorResponse::parse(&self.buffer_set.read_buffer)?.into_error();
                    pending.get_or_insert(error);
                }
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&self.buffer_set.read_buffer)?;
                    self.transaction_status = ready.transaction_status().unwrap_or_default();
                    break;
                }
                other if is_async_type(other) => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message while closing statement: '{}'",
                        other as char
                    )));
                }
            }
        }

        match pending {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the connection gracefully with a Terminate message.
    pub fn close(mut self) -> Result<()> {
        self.write_buffer.clear();
        frontend::terminate(&mut self.write_buffer);
        self.stream.send(&self.write_buffer)
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        // Best-effort Terminate; errors are irrelevant at this point
        self.write_buffer.clear();
        frontend::terminate(&mut self.write_buffer);
        let _ = self.stream.send(&self.write_buffer);
    }
}

/// Out-of-band cancellation token: process id and secret learned at startup.
///
/// `cancel` opens a new socket, sends CancelRequest, and closes it; the
/// in-flight connection is unaffected and should still be drained.
#[derive(Debug, Clone)]
pub struct CancelToken {
    opts: Opts,
    pid: u32,
    secret: u32,
}

impl CancelToken {
    /// The backend process id this token targets.
    pub fn process_id(&self) -> u32 {
        self.pid
    }

    /// Send a best-effort CancelRequest.
    pub fn cancel(&self) -> Result<()> {
        let mut stream = Stream::connect(&self.opts)?;
        let mut buf = Vec::new();
        frontend::cancel_request(&mut buf, self.pid, self.secret);
        stream.send(&buf)
    }
}

/// Bridges protocol row events into a [`Collection`] destination.
struct LoaderHandler<'a, C: Collection + ?Sized> {
    dst: &'a mut C,
    columns: Vec<String>,
    affected: u64,
    returned: u64,
}

impl<'a, C: Collection + ?Sized> LoaderHandler<'a, C> {
    fn new(dst: &'a mut C) -> Self {
        Self {
            dst,
            columns: Vec::new(),
            affected: 0,
            returned: 0,
        }
    }
}

impl<C: Collection + ?Sized> QueryHandler for LoaderHandler<'_, C> {
    fn columns(&mut self, desc: &RowDescription<'_>) -> Result<()> {
        self.columns = desc.fields().iter().map(|f| f.name.to_string()).collect();
        Ok(())
    }

    fn row(&mut self, row: &DataRow<'_>) -> Result<()> {
        self.returned += 1;
        let columns = std::mem::take(&mut self.columns);
        let loader = self.dst.begin_row();
        let mut result = Ok(());
        for (idx, cell) in row.iter().enumerate() {
            let name = columns.get(idx).map(String::as_str).unwrap_or("");
            if let Err(e) = loader.load(idx, name, cell) {
                result = Err(e);
                break;
            }
        }
        self.columns = columns;
        result
    }

    fn command_complete(&mut self, complete: &CommandComplete<'_>) -> Result<()> {
        // Multi-statement queries: the last tag wins
        self.affected = complete.rows_affected();
        Ok(())
    }
}

/// Streams copy-out frames into a writer.
struct CopyOutHandler<'a> {
    dst: &'a mut dyn Write,
    affected: u64,
}

impl QueryHandler for CopyOutHandler<'_> {
    fn row(&mut self, _row: &DataRow<'_>) -> Result<()> {
        Err(Error::Protocol("unexpected DataRow during COPY TO".into()))
    }

    fn command_complete(&mut self, complete: &CommandComplete<'_>) -> Result<()> {
        self.affected = complete.rows_affected();
        Ok(())
    }

    fn copy_out_data(&mut self, data: &[u8]) -> Result<()> {
        self.dst.write_all(data).map_err(Error::Io)
    }
}
