//! Simple query protocol state machine.
//!
//! Drives a Query message to ReadyForQuery, streaming rows into a
//! [`QueryHandler`] and handling COPY mode transitions. When the server
//! reports an error (or the handler fails to decode a row) the machine
//! keeps draining messages until ReadyForQuery and surfaces the error
//! afterwards, leaving the connection usable.

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, CopyData, CopyInResponse, CopyOutResponse, DataRow, EmptyQueryResponse,
    ErrorResponse, NoticeResponse, ParameterStatus, ReadyForQuery, RowDescription, is_async_type,
    msg_type,
};
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;

use super::BufferSet;
use super::action::Action;

/// Handler for query results.
pub trait QueryHandler {
    /// Called when column descriptions are received (simple protocol only).
    fn columns(&mut self, desc: &RowDescription<'_>) -> Result<()> {
        let _ = desc;
        Ok(())
    }

    /// Called for each data row.
    fn row(&mut self, row: &DataRow<'_>) -> Result<()>;

    /// Called when a command completes.
    fn command_complete(&mut self, complete: &CommandComplete<'_>) -> Result<()> {
        let _ = complete;
        Ok(())
    }

    /// Called for each CopyData frame while the server is in copy-out mode.
    fn copy_out_data(&mut self, data: &[u8]) -> Result<()> {
        let _ = data;
        Ok(())
    }
}

impl<H: QueryHandler + ?Sized> QueryHandler for &mut H {
    fn columns(&mut self, desc: &RowDescription<'_>) -> Result<()> {
        (**self).columns(desc)
    }

    fn row(&mut self, row: &DataRow<'_>) -> Result<()> {
        (**self).row(row)
    }

    fn command_complete(&mut self, complete: &CommandComplete<'_>) -> Result<()> {
        (**self).command_complete(complete)
    }

    fn copy_out_data(&mut self, data: &[u8]) -> Result<()> {
        (**self).copy_out_data(data)
    }
}

/// Simple query state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Initial state - need to send query
    Initial,
    /// Waiting for the next result (or ReadyForQuery)
    WaitingResponse,
    /// Streaming rows of one result set
    ProcessingRows,
    /// Streaming CopyData frames from the server
    CopyOut,
    /// Draining to ReadyForQuery (after error or final CommandComplete)
    WaitingReady,
    /// Finished
    Finished,
}

/// Simple query protocol state machine.
pub struct SimpleQueryStateMachine<H> {
    state: State,
    handler: H,
    write_buffer: Vec<u8>,
    transaction_status: TransactionStatus,
    pending_error: Option<Error>,
    param_changes: Vec<(String, String)>,
}

impl<H: QueryHandler> SimpleQueryStateMachine<H> {
    /// Create a new simple query state machine.
    pub fn new(handler: H) -> Self {
        Self {
            state: State::Initial,
            handler,
            write_buffer: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            pending_error: None,
            param_changes: Vec::new(),
        }
    }

    /// Get the handler back.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// The error stored while draining, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.pending_error.take()
    }

    /// Server parameter changes reported during the exchange.
    pub fn param_changes(&self) -> &[(String, String)] {
        &self.param_changes
    }

    /// Start the query.
    pub fn start(&mut self, query: &str) -> Action<'_> {
        self.write_buffer.clear();
        frontend::query(&mut self.write_buffer, query);
        self.state = State::WaitingResponse;
        Action::WritePacket(&self.write_buffer)
    }

    /// Record an error and drain the remaining messages to ReadyForQuery.
    fn fail(&mut self, error: Error) -> Result<Action<'_>> {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
        self.state = State::WaitingReady;
        Ok(Action::NeedPacket)
    }

    fn finish(&mut self, payload: &[u8]) -> Result<Action<'_>> {
        let ready = ReadyForQuery::parse(payload)?;
        self.transaction_status = ready.transaction_status().unwrap_or_default();
        self.state = State::Finished;
        Ok(Action::Finished)
    }

    /// Process a message from the server.
    pub fn step(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        let type_byte = buffer_set.type_byte;
        let payload = &buffer_set.read_buffer;

        if is_async_type(type_byte) {
            self.handle_async_message(type_byte, payload)?;
            return Ok(Action::NeedPacket);
        }

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(payload)?.into_error();
            return self.fail(error);
        }

        match self.state {
            State::WaitingResponse => self.handle_response(type_byte, payload),
            State::ProcessingRows => self.handle_rows(type_byte, payload),
            State::CopyOut => self.handle_copy_out(type_byte, payload),
            State::WaitingReady => {
                // Drain everything up to ReadyForQuery
                if type_byte == msg_type::READY_FOR_QUERY {
                    self.finish(payload)
                } else {
                    Ok(Action::NeedPacket)
                }
            }
            State::Initial | State::Finished => Err(Error::Protocol(format!(
                "unexpected message '{}' in state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn handle_response(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action<'_>> {
        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(payload)?;
                if let Err(e) = self.handler.columns(&desc) {
                    return self.fail(e);
                }
                self.state = State::ProcessingRows;
                Ok(Action::NeedPacket)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.command_complete(&complete) {
                    return self.fail(e);
                }
                // More commands may follow in a multi-statement query
                Ok(Action::NeedPacket)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                EmptyQueryResponse::parse(payload)?;
                Ok(Action::NeedPacket)
            }
            msg_type::COPY_IN_RESPONSE => {
                CopyInResponse::parse(payload)?;
                // The caller pumps CopyData/CopyDone; afterwards the server
                // reports CommandComplete like a regular command.
                Ok(Action::CopyInStarted)
            }
            msg_type::COPY_OUT_RESPONSE => {
                CopyOutResponse::parse(payload)?;
                self.state = State::CopyOut;
                Ok(Action::NeedPacket)
            }
            msg_type::READY_FOR_QUERY => self.finish(payload),
            other => Err(Error::Protocol(format!(
                "unexpected message in query response: '{}'",
                other as char
            ))),
        }
    }

    fn handle_rows(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action<'_>> {
        match type_byte {
            msg_type::DATA_ROW => {
                let row = DataRow::parse(payload)?;
                if let Err(e) = self.handler.row(&row) {
                    return self.fail(e);
                }
                Ok(Action::NeedPacket)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                if let Err(e) = self.handler.command_complete(&complete) {
                    return self.fail(e);
                }
                // More commands may follow
                self.state = State::WaitingResponse;
                Ok(Action::NeedPacket)
            }
            msg_type::READY_FOR_QUERY => self.finish(payload),
            other => Err(Error::Protocol(format!(
                "unexpected message in row processing: '{}'",
                other as char
            ))),
        }
    }

    fn handle_copy_out(&mut self, type_byte: u8, payload: &[u8]) -> Result<Action<'_>> {
        match type_byte {
            msg_type::COPY_DATA => {
                let data = CopyData::parse(payload)?;
                if let Err(e) = self.handler.copy_out_data(data.data) {
                    return self.fail(e);
                }
                Ok(Action::NeedPacket)
            }
            msg_type::COPY_DONE => {
                self.state = State::WaitingResponse;
                Ok(Action::NeedPacket)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message in copy-out: '{}'",
                other as char
            ))),
        }
    }

    fn handle_async_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        match type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(payload)?;
                debug!("server notice: {}", notice.0);
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                self.param_changes
                    .push((param.name.to_string(), param.value.to_string()));
            }
            _ => {} // NotificationResponse: tolerated and dropped
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        columns: Vec<String>,
        rows: Vec<Vec<Option<Vec<u8>>>>,
        tags: Vec<String>,
        copy_out: Vec<u8>,
    }

    impl QueryHandler for Recorder {
        fn columns(&mut self, desc: &RowDescription<'_>) -> Result<()> {
            self.columns = desc.fields().iter().map(|f| f.name.to_string()).collect();
            Ok(())
        }

        fn row(&mut self, row: &DataRow<'_>) -> Result<()> {
            self.rows
                .push(row.iter().map(|v| v.map(|b| b.to_vec())).collect());
            Ok(())
        }

        fn command_complete(&mut self, complete: &CommandComplete<'_>) -> Result<()> {
            self.tags.push(complete.tag.to_string());
            Ok(())
        }

        fn copy_out_data(&mut self, data: &[u8]) -> Result<()> {
            self.copy_out.extend_from_slice(data);
            Ok(())
        }
    }

    fn msg(type_byte: u8, payload: &[u8]) -> BufferSet {
        BufferSet {
            type_byte,
            read_buffer: payload.to_vec(),
        }
    }

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut payload = (names.len() as u16).to_be_bytes().to_vec();
        for name in names {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes());
            payload.extend_from_slice(&0_i16.to_be_bytes());
            payload.extend_from_slice(&25_u32.to_be_bytes());
            payload.extend_from_slice(&(-1_i16).to_be_bytes());
            payload.extend_from_slice(&(-1_i32).to_be_bytes());
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        payload
    }

    fn data_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = (cells.len() as u16).to_be_bytes().to_vec();
        for cell in cells {
            match cell {
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
            }
        }
        payload
    }

    #[test]
    fn select_flow() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        let Action::WritePacket(data) = m.start("SELECT a") else {
            panic!("expected write");
        };
        assert_eq!(data[0], b'Q');

        m.step(&msg(b'T', &row_description(&["a"]))).unwrap();
        m.step(&msg(b'D', &data_row(&[Some(b"1")]))).unwrap();
        m.step(&msg(b'D', &data_row(&[None]))).unwrap();
        m.step(&msg(b'C', b"SELECT 2\0")).unwrap();
        assert!(matches!(m.step(&msg(b'Z', b"I")).unwrap(), Action::Finished));

        let handler = m.into_handler();
        assert_eq!(handler.columns, vec!["a"]);
        assert_eq!(handler.rows, vec![vec![Some(b"1".to_vec())], vec![None]]);
        assert_eq!(handler.tags, vec!["SELECT 2"]);
    }

    #[test]
    fn multi_statement_tags_accumulate() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        m.start("INSERT ...; UPDATE ...");
        m.step(&msg(b'C', b"INSERT 0 1\0")).unwrap();
        m.step(&msg(b'C', b"UPDATE 3\0")).unwrap();
        m.step(&msg(b'Z', b"I")).unwrap();
        assert_eq!(m.into_handler().tags, vec!["INSERT 0 1", "UPDATE 3"]);
    }

    #[test]
    fn error_drains_to_ready() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        m.start("SELECT boom");

        m.step(&msg(b'E', b"SERROR\0C42601\0Msyntax error\0\0"))
            .unwrap();
        // Server may keep sending result messages; they are drained
        m.step(&msg(b'D', &data_row(&[Some(b"zz")]))).unwrap();
        m.step(&msg(b'C', b"SELECT 1\0")).unwrap();
        assert!(matches!(m.step(&msg(b'Z', b"E")).unwrap(), Action::Finished));

        let err = m.take_error().unwrap();
        assert_eq!(err.sqlstate(), Some("42601"));
        assert_eq!(m.transaction_status(), TransactionStatus::Failed);
        assert!(m.into_handler().rows.is_empty());
    }

    #[test]
    fn handler_error_drains_to_ready() {
        struct Failing;
        impl QueryHandler for Failing {
            fn row(&mut self, _row: &DataRow<'_>) -> Result<()> {
                Err(Error::Decode("bad cell".into()))
            }
        }

        let mut m = SimpleQueryStateMachine::new(Failing);
        m.start("SELECT a");
        m.step(&msg(b'T', &row_description(&["a"]))).unwrap();
        m.step(&msg(b'D', &data_row(&[Some(b"1")]))).unwrap();
        m.step(&msg(b'D', &data_row(&[Some(b"2")]))).unwrap();
        m.step(&msg(b'C', b"SELECT 2\0")).unwrap();
        m.step(&msg(b'Z', b"I")).unwrap();
        assert!(matches!(m.take_error(), Some(Error::Decode(_))));
    }

    #[test]
    fn copy_out_flow() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        m.start("COPY t TO STDOUT");

        let mut copy_out_resp = vec![0u8];
        copy_out_resp.extend_from_slice(&1_u16.to_be_bytes());
        copy_out_resp.extend_from_slice(&0_u16.to_be_bytes());
        m.step(&msg(b'H', &copy_out_resp)).unwrap();
        m.step(&msg(b'd', b"foo\t1\n")).unwrap();
        m.step(&msg(b'd', b"bar\t2\n")).unwrap();
        m.step(&msg(b'c', b"")).unwrap();
        m.step(&msg(b'C', b"COPY 2\0")).unwrap();
        m.step(&msg(b'Z', b"I")).unwrap();

        let handler = m.into_handler();
        assert_eq!(handler.copy_out, b"foo\t1\nbar\t2\n");
        assert_eq!(handler.tags, vec!["COPY 2"]);
    }

    #[test]
    fn copy_in_signals_caller() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        m.start("COPY t FROM STDIN");

        let mut copy_in_resp = vec![0u8];
        copy_in_resp.extend_from_slice(&1_u16.to_be_bytes());
        copy_in_resp.extend_from_slice(&0_u16.to_be_bytes());
        assert!(matches!(
            m.step(&msg(b'G', &copy_in_resp)).unwrap(),
            Action::CopyInStarted
        ));

        // After the caller sends CopyDone the normal loop resumes
        m.step(&msg(b'C', b"COPY 4\0")).unwrap();
        m.step(&msg(b'Z', b"I")).unwrap();
        assert_eq!(m.into_handler().tags, vec!["COPY 4"]);
    }

    #[test]
    fn notices_are_skipped() {
        let mut m = SimpleQueryStateMachine::new(Recorder::default());
        m.start("SELECT 1");
        m.step(&msg(b'N', b"SNOTICE\0Mhello\0\0")).unwrap();
        m.step(&msg(b'S', b"TimeZone\0UTC\0")).unwrap();
        m.step(&msg(b'C', b"SELECT 0\0")).unwrap();
        m.step(&msg(b'Z', b"I")).unwrap();
        assert_eq!(
            m.param_changes(),
            &[("TimeZone".to_string(), "UTC".to_string())]
        );
    }
}
