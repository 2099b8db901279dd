//! Extended query protocol state machines.
//!
//! Prepare sends Parse + Describe(Statement) + Sync and collects parameter
//! OIDs plus result column descriptors. Execute sends Bind + Execute + Sync
//! with text-format parameters and streams rows into a [`QueryHandler`].

use crate::error::{Error, Result};
use crate::protocol::backend::{
    BindComplete, CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse, NoData,
    ParameterDescription, ParseComplete, ReadyForQuery, RowDescription, is_async_type, msg_type,
};
use crate::protocol::frontend;
use crate::protocol::types::{Oid, TransactionStatus};

use super::BufferSet;
use super::action::Action;
use super::simple_query::QueryHandler;

/// One result column of a prepared statement.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: Oid,
}

/// Server-side state of a prepared statement, bound to one connection.
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    /// Wire protocol statement name, unique per connection
    pub name: String,
    /// Parameter type OIDs reported by Describe
    pub param_oids: Vec<Oid>,
    /// Result column descriptors (empty if the statement returns no rows)
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepareState {
    Initial,
    WaitingParse,
    WaitingParamDesc,
    WaitingRowDesc,
    WaitingReady,
    Finished,
}

/// State machine for preparing a statement.
pub struct PrepareStateMachine {
    state: PrepareState,
    name: String,
    write_buffer: Vec<u8>,
    param_oids: Vec<Oid>,
    columns: Vec<Column>,
    transaction_status: TransactionStatus,
    pending_error: Option<Error>,
}

impl PrepareStateMachine {
    /// Create a new prepare state machine for the given statement name.
    pub fn new(name: String) -> Self {
        Self {
            state: PrepareState::Initial,
            name,
            write_buffer: Vec::new(),
            param_oids: Vec::new(),
            columns: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            pending_error: None,
        }
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// The error stored while draining, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.pending_error.take()
    }

    /// The prepared statement description, after a successful run.
    pub fn into_info(self) -> PreparedInfo {
        PreparedInfo {
            name: self.name,
            param_oids: self.param_oids,
            columns: self.columns,
        }
    }

    /// Start preparing: sends Parse + Describe(Statement) + Sync.
    pub fn start(&mut self, query: &str) -> Action<'_> {
        self.write_buffer.clear();
        frontend::parse(&mut self.write_buffer, &self.name, query, &[]);
        frontend::describe_statement(&mut self.write_buffer, &self.name);
        frontend::sync(&mut self.write_buffer);
        self.state = PrepareState::WaitingParse;
        Action::WritePacket(&self.write_buffer)
    }

    fn fail(&mut self, error: Error) -> Result<Action<'_>> {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
        self.state = PrepareState::WaitingReady;
        Ok(Action::NeedPacket)
    }

    /// Process a message from the server.
    pub fn step(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        if is_async_type(type_byte) {
            return Ok(Action::NeedPacket);
        }
        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(payload)?.into_error();
            return self.fail(error);
        }

        match (self.state, type_byte) {
            (PrepareState::WaitingParse, msg_type::PARSE_COMPLETE) => {
                ParseComplete::parse(payload)?;
                self.state = PrepareState::WaitingParamDesc;
                Ok(Action::NeedPacket)
            }
            (PrepareState::WaitingParamDesc, msg_type::PARAMETER_DESCRIPTION) => {
                self.param_oids = ParameterDescription::parse(payload)?.into_oids();
                self.state = PrepareState::WaitingRowDesc;
                Ok(Action::NeedPacket)
            }
            (PrepareState::WaitingRowDesc, msg_type::ROW_DESCRIPTION) => {
                let desc = RowDescription::parse(payload)?;
                self.columns = desc
                    .fields()
                    .iter()
                    .map(|f| Column {
                        name: f.name.to_string(),
                        type_oid: f.type_oid,
                    })
                    .collect();
                self.state = PrepareState::WaitingReady;
                Ok(Action::NeedPacket)
            }
            (PrepareState::WaitingRowDesc, msg_type::NO_DATA) => {
                NoData::parse(payload)?;
                self.state = PrepareState::WaitingReady;
                Ok(Action::NeedPacket)
            }
            (PrepareState::WaitingReady, msg_type::READY_FOR_QUERY) => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = PrepareState::Finished;
                Ok(Action::Finished)
            }
            // Draining after an error
            (PrepareState::WaitingReady, _) => Ok(Action::NeedPacket),
            (state, other) => Err(Error::Protocol(format!(
                "unexpected message '{}' while preparing in {:?}",
                other as char, state
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecuteState {
    Initial,
    WaitingBind,
    ProcessingRows,
    WaitingReady,
    Finished,
}

/// State machine for executing a prepared statement.
pub struct ExecuteStateMachine<'h, H> {
    state: ExecuteState,
    handler: &'h mut H,
    write_buffer: Vec<u8>,
    transaction_status: TransactionStatus,
    pending_error: Option<Error>,
}

impl<'h, H: QueryHandler> ExecuteStateMachine<'h, H> {
    /// Create a new execute state machine.
    pub fn new(handler: &'h mut H) -> Self {
        Self {
            state: ExecuteState::Initial,
            handler,
            write_buffer: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            pending_error: None,
        }
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// The error stored while draining, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.pending_error.take()
    }

    /// Start execution: sends Bind + Execute + Sync on the unnamed portal.
    pub fn start(&mut self, statement: &str, params: &[Option<Vec<u8>>]) -> Action<'_> {
        self.write_buffer.clear();
        frontend::bind(&mut self.write_buffer, "", statement, params);
        frontend::execute(&mut self.write_buffer, "", 0);
        frontend::sync(&mut self.write_buffer);
        self.state = ExecuteState::WaitingBind;
        Action::WritePacket(&self.write_buffer)
    }

    fn fail(&mut self, error: Error) -> Result<Action<'_>> {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
        self.state = ExecuteState::WaitingReady;
        Ok(Action::NeedPacket)
    }

    /// Process a message from the server.
    pub fn step(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        if is_async_type(type_byte) {
            return Ok(Action::NeedPacket);
        }
        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(payload)?.into_error();
            return self.fail(error);
        }

        match (self.state, type_byte) {
            (ExecuteState::WaitingBind, msg_type::BIND_COMPLETE) => {
                BindComplete::parse(payload)?;
                self.state = ExecuteState::ProcessingRows;
                Ok(Action::NeedPacket)
            }
            (ExecuteState::ProcessingRows, msg_type::DATA_ROW) => {
                let row = DataRow::parse(payload)?;
                if let Err(e) = self.handler.row(&row) {
                    return self.fail(e);
                }
                Ok(Action::NeedPacket)
            }
            (ExecuteState::ProcessingRows, msg_type::COMMAND_COMPLETE) => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.command_complete(&complete) {
                    return self.fail(e);
                }
                self.state = ExecuteState::WaitingReady;
                Ok(Action::NeedPacket)
            }
            (ExecuteState::ProcessingRows, msg_type::EMPTY_QUERY_RESPONSE) => {
                EmptyQueryResponse::parse(payload)?;
                self.state = ExecuteState::WaitingReady;
                Ok(Action::NeedPacket)
            }
            (ExecuteState::WaitingReady, msg_type::READY_FOR_QUERY) => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = ExecuteState::Finished;
                Ok(Action::Finished)
            }
            // Draining after an error
            (ExecuteState::WaitingReady, _) => Ok(Action::NeedPacket),
            (state, other) => Err(Error::Protocol(format!(
                "unexpected message '{}' while executing in {:?}",
                other as char, state
            ))),
        }
    }
}
