//! Connection startup and authentication state machine.
//!
//! Drives the startup handshake: StartupMessage, the authentication
//! sub-protocol (cleartext and MD5 password), then ParameterStatus and
//! BackendKeyData absorption until ReadyForQuery.

use log::debug;

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, NoticeResponse, ParameterStatus,
    ReadyForQuery, is_async_type, msg_type,
};
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;

use super::BufferSet;
use super::action::Action;

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingAuth,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
pub struct ConnectionStateMachine {
    state: State,
    options: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    write_buffer: Vec<u8>,
}

impl ConnectionStateMachine {
    /// Create a new connection state machine.
    pub fn new(options: Opts) -> Self {
        Self {
            state: State::WaitingAuth,
            options,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            write_buffer: Vec::new(),
        }
    }

    /// Get the backend key data (for cancellation).
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get server parameters reported during startup.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get the transaction status from the final ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start the connection process: returns the StartupMessage to send.
    pub fn start(&mut self) -> Action<'_> {
        self.write_buffer.clear();

        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.options.user), ("client_encoding", "UTF8")];

        if let Some(ref db) = self.options.database {
            params.push(("database", db));
        }
        if let Some(ref app) = self.options.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.options.params {
            params.push((name, value));
        }

        frontend::startup(&mut self.write_buffer, &params);
        Action::WritePacket(&self.write_buffer)
    }

    /// Process a message from the server.
    pub fn step(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        let type_byte = buffer_set.type_byte;

        if is_async_type(type_byte) {
            self.handle_async_message(type_byte, &buffer_set.read_buffer)?;
            return Ok(Action::NeedPacket);
        }

        // Any ErrorResponse during startup is fatal
        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?;
            self.state = State::Failed;
            return Err(error.into_error());
        }

        match self.state {
            State::WaitingAuth => self.handle_auth_message(buffer_set),
            State::WaitingAuthResult => self.handle_auth_result(buffer_set),
            State::WaitingReady => self.handle_ready_message(buffer_set),
            State::Ready | State::Failed => Err(Error::Protocol(format!(
                "unexpected message '{}' in state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn expect_auth_message(buffer_set: &BufferSet) -> Result<AuthenticationMessage> {
        if buffer_set.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected Authentication message, got '{}'",
                buffer_set.type_byte as char
            )));
        }
        AuthenticationMessage::parse(&buffer_set.read_buffer)
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("password required but not provided".into()))
    }

    fn handle_auth_message(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        match Self::expect_auth_message(buffer_set)? {
            AuthenticationMessage::Ok => {
                self.state = State::WaitingReady;
                Ok(Action::NeedPacket)
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.password()?.to_string();
                self.write_buffer.clear();
                frontend::password(&mut self.write_buffer, &password);
                self.state = State::WaitingAuthResult;
                Ok(Action::WritePacket(&self.write_buffer))
            }
            AuthenticationMessage::Md5Password { salt } => {
                let response = frontend::md5_response(&self.options.user, self.password()?, &salt);
                self.write_buffer.clear();
                frontend::password(&mut self.write_buffer, &response);
                self.state = State::WaitingAuthResult;
                Ok(Action::WritePacket(&self.write_buffer))
            }
            AuthenticationMessage::Unsupported(code) => Err(Error::Auth(format!(
                "unsupported authentication method: {}",
                code
            ))),
        }
    }

    fn handle_auth_result(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        match Self::expect_auth_message(buffer_set)? {
            AuthenticationMessage::Ok => {
                self.state = State::WaitingReady;
                Ok(Action::NeedPacket)
            }
            other => Err(Error::Auth(format!(
                "unexpected authentication result: {:?}",
                other
            ))),
        }
    }

    fn handle_ready_message(&mut self, buffer_set: &BufferSet) -> Result<Action<'_>> {
        let payload = &buffer_set.read_buffer;

        match buffer_set.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_key = Some(*key);
                Ok(Action::NeedPacket)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = State::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }

    fn handle_async_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        match type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = NoticeResponse::parse(payload)?;
                debug!("server notice during startup: {}", notice.0);
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                if let Some(entry) = self.server_params.iter_mut().find(|(n, _)| n == param.name) {
                    entry.1 = param.value.to_string();
                } else {
                    self.server_params
                        .push((param.name.to_string(), param.value.to_string()));
                }
            }
            _ => {} // NotificationResponse: tolerated and dropped
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new(Opts {
            user: "alice".into(),
            password: Some("secret".into()),
            database: Some("db".into()),
            ..Opts::default()
        })
    }

    fn msg(type_byte: u8, payload: &[u8]) -> BufferSet {
        BufferSet {
            type_byte,
            read_buffer: payload.to_vec(),
        }
    }

    #[test]
    fn startup_message_carries_user_and_database() {
        let mut m = machine();
        let Action::WritePacket(data) = m.start() else {
            panic!("expected WritePacket");
        };
        let text = String::from_utf8_lossy(data);
        assert!(text.contains("user\0alice\0"));
        assert!(text.contains("database\0db\0"));
        assert_eq!(&data[4..8], &196608_i32.to_be_bytes());
    }

    #[test]
    fn cleartext_auth_flow() {
        let mut m = machine();
        m.start();

        let step = m.step(&msg(b'R', &3_i32.to_be_bytes())).unwrap();
        let Action::WritePacket(data) = step else {
            panic!("expected password message");
        };
        assert_eq!(data[0], b'p');
        assert_eq!(&data[5..], b"secret\0");

        assert!(matches!(
            m.step(&msg(b'R', &0_i32.to_be_bytes())).unwrap(),
            Action::NeedPacket
        ));

        let mut key = Vec::new();
        key.extend_from_slice(&7_u32.to_be_bytes());
        key.extend_from_slice(&9_u32.to_be_bytes());
        m.step(&msg(b'K', &key)).unwrap();
        assert_eq!(m.backend_key().unwrap().process_id(), 7);

        assert!(matches!(m.step(&msg(b'Z', b"I")).unwrap(), Action::Finished));
        assert_eq!(m.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn md5_auth_flow() {
        let mut m = machine();
        m.start();

        let mut payload = 5_i32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let step = m.step(&msg(b'R', &payload)).unwrap();
        let Action::WritePacket(data) = step else {
            panic!("expected password message");
        };
        let sent = std::str::from_utf8(&data[5..data.len() - 1]).unwrap();
        assert_eq!(sent, frontend::md5_response("alice", "secret", &[1, 2, 3, 4]));
    }

    #[test]
    fn unknown_auth_method_rejected() {
        let mut m = machine();
        m.start();
        let err = m.step(&msg(b'R', &10_i32.to_be_bytes())).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn error_response_aborts_startup() {
        let mut m = machine();
        m.start();
        let err = m
            .step(&msg(b'E', b"SFATAL\0C28P01\0Mpassword authentication failed\0\0"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn parameter_status_absorbed() {
        let mut m = machine();
        m.start();
        m.step(&msg(b'R', &0_i32.to_be_bytes())).unwrap();
        m.step(&msg(b'S', b"server_version\017.0\0")).unwrap();
        assert_eq!(
            m.server_params(),
            &[("server_version".to_string(), "17.0".to_string())]
        );
    }
}
