//! Scripted in-process PostgreSQL server for integration tests.
//!
//! Each accepted connection runs the test's handler on its own thread with
//! a [`Session`] exposing message-level helpers. Tests assert on what the
//! driver sent and script what the server answers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pgtext::Opts;

pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

pub struct MockServer {
    port: u16,
}

impl MockServer {
    /// Start a server; `handler` runs once per accepted connection with the
    /// zero-based connection index.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &mut Session) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let handler = Arc::new(handler);

        thread::spawn(move || {
            for (index, incoming) in listener.incoming().enumerate() {
                let Ok(stream) = incoming else { break };
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    let mut session = Session::new(stream);
                    handler(index, &mut session);
                });
            }
        });

        Self { port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Options pointing at this server, tuned for fast test failures.
    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".into(),
            port: self.port,
            user: "postgres".into(),
            database: Some("test".into()),
            dial_timeout: Some(Duration::from_secs(5)),
            acquire_timeout: Some(Duration::from_secs(2)),
            ..Opts::default()
        }
    }
}

/// Server side of one connection.
pub struct Session {
    stream: TcpStream,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set session read timeout");
        Self { stream }
    }

    // === reading ===

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf)
    }

    /// Read one startup-family frame (no type byte): returns (code, rest).
    pub fn read_startup_frame(&mut self) -> (i32, Vec<u8>) {
        let mut len = [0u8; 4];
        self.read_exact(&mut len).expect("startup frame length");
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload).expect("startup frame payload");
        let code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        (code, payload[4..].to_vec())
    }

    /// Expect a StartupMessage; answers an SSLRequest with 'N' first if one
    /// arrives. Returns the startup parameters.
    pub fn expect_startup(&mut self) -> HashMap<String, String> {
        let (code, rest) = self.read_startup_frame();
        if code == SSL_REQUEST_CODE {
            self.stream.write_all(b"N").expect("ssl refusal");
            return self.expect_startup();
        }
        assert_eq!(code, PROTOCOL_VERSION, "unexpected protocol version");

        let mut params = HashMap::new();
        let mut data = &rest[..];
        while !data.is_empty() && data[0] != 0 {
            let (name, next) = read_cstr(data);
            let (value, next) = read_cstr(next);
            params.insert(name, value);
            data = next;
        }
        params
    }

    /// Read one typed message: (type byte, payload).
    pub fn read_message(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 5];
        self.read_exact(&mut header)?;
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        self.read_exact(&mut payload)?;
        Ok((header[0], payload))
    }

    /// Read a message and assert its type byte.
    pub fn expect_message(&mut self, expected: u8) -> Vec<u8> {
        let (type_byte, payload) = self.read_message().expect("read message");
        assert_eq!(
            type_byte as char, expected as char,
            "unexpected message type"
        );
        payload
    }

    /// Expect a Query message and return its SQL text.
    pub fn expect_query(&mut self) -> String {
        let payload = self.expect_message(b'Q');
        let (sql, _) = read_cstr(&payload);
        sql
    }

    /// Expect a PasswordMessage and return its contents.
    pub fn expect_password(&mut self) -> String {
        let payload = self.expect_message(b'p');
        let (password, _) = read_cstr(&payload);
        password
    }

    // === writing ===

    pub fn send(&mut self, type_byte: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(type_byte);
        frame.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).expect("send message");
    }

    /// AuthenticationOk + ParameterStatus + BackendKeyData + ReadyForQuery.
    pub fn auth_ok(&mut self) {
        self.auth_ok_with_key(4242, 987_654);
    }

    pub fn auth_ok_with_key(&mut self, pid: u32, secret: u32) {
        self.send(b'R', &0_i32.to_be_bytes());
        self.parameter_status("server_version", "17.0");
        let mut key = Vec::new();
        key.extend_from_slice(&pid.to_be_bytes());
        key.extend_from_slice(&secret.to_be_bytes());
        self.send(b'K', &key);
        self.ready(b'I');
    }

    /// The common preamble: read startup, authenticate trust-style.
    pub fn handshake(&mut self) -> HashMap<String, String> {
        let params = self.expect_startup();
        self.auth_ok();
        params
    }

    /// Request authentication with the given code (3 = cleartext, 5 = MD5).
    pub fn auth_request(&mut self, code: i32, extra: &[u8]) {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(extra);
        self.send(b'R', &payload);
    }

    pub fn parameter_status(&mut self, name: &str, value: &str) {
        let mut payload = Vec::new();
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.send(b'S', &payload);
    }

    pub fn ready(&mut self, status: u8) {
        self.send(b'Z', &[status]);
    }

    pub fn row_description(&mut self, columns: &[&str]) {
        let mut payload = (columns.len() as u16).to_be_bytes().to_vec();
        for name in columns {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0_u32.to_be_bytes()); // table oid
            payload.extend_from_slice(&0_i16.to_be_bytes()); // column id
            payload.extend_from_slice(&25_u32.to_be_bytes()); // type oid (text)
            payload.extend_from_slice(&(-1_i16).to_be_bytes()); // type size
            payload.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
            payload.extend_from_slice(&0_u16.to_be_bytes()); // text format
        }
        self.send(b'T', &payload);
    }

    pub fn data_row(&mut self, cells: &[Option<&[u8]>]) {
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
        self.send(b'D', &payload);
    }

    pub fn command_complete(&mut self, tag: &str) {
        let mut payload = tag.as_bytes().to_vec();
        payload.push(0);
        self.send(b'C', &payload);
    }

    pub fn error_response(&mut self, code: &str, message: &str) {
        self.error_response_severity("ERROR", code, message);
    }

    pub fn error_response_severity(&mut self, severity: &str, code: &str, message: &str) {
        let mut payload = Vec::new();
        for (field, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        self.send(b'E', &payload);
    }

    pub fn notice(&mut self, message: &str) {
        let mut payload = Vec::new();
        for (field, value) in [(b'S', "NOTICE"), (b'C', "00000"), (b'M', message)] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        self.send(b'N', &payload);
    }

    pub fn copy_in_response(&mut self, columns: u16) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&columns.to_be_bytes());
        for _ in 0..columns {
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        self.send(b'G', &payload);
    }

    pub fn copy_out_response(&mut self, columns: u16) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&columns.to_be_bytes());
        for _ in 0..columns {
            payload.extend_from_slice(&0_u16.to_be_bytes());
        }
        self.send(b'H', &payload);
    }

    /// Collect CopyData payloads until CopyDone (or CopyFail, which returns
    /// an error with the client's message).
    pub fn collect_copy_in(&mut self) -> Result<Vec<u8>, String> {
        let mut collected = Vec::new();
        loop {
            let (type_byte, payload) = self.read_message().expect("copy message");
            match type_byte {
                b'd' => collected.extend_from_slice(&payload),
                b'c' => return Ok(collected),
                b'f' => {
                    let (message, _) = read_cstr(&payload);
                    return Err(message);
                }
                other => panic!("unexpected message during copy-in: {}", other as char),
            }
        }
    }

    /// Serve a Parse + Describe + Sync exchange for a statement returning
    /// the given columns, and return the statement name the driver chose.
    pub fn serve_prepare(&mut self, param_oids: &[u32], columns: &[&str]) -> String {
        let parse = self.expect_message(b'P');
        let (name, _) = read_cstr(&parse);
        self.expect_message(b'D');
        self.expect_message(b'S');

        self.send(b'1', b""); // ParseComplete
        let mut param_desc = (param_oids.len() as u16).to_be_bytes().to_vec();
        for oid in param_oids {
            param_desc.extend_from_slice(&oid.to_be_bytes());
        }
        self.send(b't', &param_desc);
        if columns.is_empty() {
            self.send(b'n', b""); // NoData
        } else {
            self.row_description(columns);
        }
        self.ready(b'I');
        name
    }

    /// Serve a Bind + Execute + Sync exchange, returning the bound
    /// text-format parameters (None = NULL).
    pub fn read_bind(&mut self) -> Vec<Option<Vec<u8>>> {
        let bind = self.expect_message(b'B');
        self.expect_message(b'E');
        self.expect_message(b'S');

        // portal name, statement name
        let (_, rest) = read_cstr_bytes(&bind);
        let (_, rest) = read_cstr_bytes(rest);
        // parameter format codes
        let format_count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2 + format_count * 2..];
        // parameter values
        let param_count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let mut rest = &rest[2..];
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
            rest = &rest[4..];
            if len < 0 {
                params.push(None);
            } else {
                params.push(Some(rest[..len as usize].to_vec()));
                rest = &rest[len as usize..];
            }
        }
        self.send(b'2', b""); // BindComplete
        params
    }

    /// Serve a Close(Statement) + Sync exchange.
    pub fn serve_close_statement(&mut self) {
        self.expect_message(b'C');
        self.expect_message(b'S');
        self.send(b'3', b""); // CloseComplete
        self.ready(b'I');
    }

    /// Read the Terminate message ending a graceful close, if any.
    pub fn expect_terminate(&mut self) {
        if let Ok((type_byte, _)) = self.read_message() {
            assert_eq!(type_byte, b'X', "expected Terminate");
        }
    }
}

fn read_cstr(data: &[u8]) -> (String, &[u8]) {
    let (bytes, rest) = read_cstr_bytes(data);
    (String::from_utf8(bytes.to_vec()).expect("utf-8 cstr"), rest)
}

fn read_cstr_bytes(data: &[u8]) -> (&[u8], &[u8]) {
    let pos = data.iter().position(|&b| b == 0).expect("NUL terminator");
    (&data[..pos], &data[pos + 1..])
}
