//! Frontend (client → server) message writers.
//!
//! Each writer appends one complete frame to the caller's buffer, so a
//! whole exchange (say Parse, Describe, Sync) can be batched into a single
//! socket write. Functions are named after the message they emit.

use md5::{Digest, Md5};

use crate::protocol::codec::FrameWriter;
use crate::protocol::types::Oid;

/// Version 3.0 of the frontend/backend protocol.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic number opening an SSLRequest.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic number opening a CancelRequest.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// StartupMessage: protocol version plus NUL-delimited parameter pairs.
///
/// The server expects at least `user`; `database`, `client_encoding` and
/// friends ride along in the same list.
pub fn startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut frame = FrameWriter::untagged(buf);
    frame.put_i32(PROTOCOL_VERSION);
    for (name, value) in params {
        frame.put_cstr(name);
        frame.put_cstr(value);
    }
    frame.put_u8(0); // end of parameter list
    frame.seal();
}

/// SSLRequest: sent in place of the startup message when TLS is wanted.
/// The server answers with a bare `S` or `N` byte.
pub fn ssl_request(buf: &mut Vec<u8>) {
    let mut frame = FrameWriter::untagged(buf);
    frame.put_i32(SSL_REQUEST_CODE);
    frame.seal();
}

/// CancelRequest: fired on a throwaway connection to interrupt a query
/// running elsewhere; the server hangs up without replying.
pub fn cancel_request(buf: &mut Vec<u8>, pid: u32, secret: u32) {
    let mut frame = FrameWriter::untagged(buf);
    frame.put_i32(CANCEL_REQUEST_CODE);
    frame.put_i32(pid as i32);
    frame.put_i32(secret as i32);
    frame.seal();
}

/// Terminate: polite goodbye before closing the socket.
pub fn terminate(buf: &mut Vec<u8>) {
    FrameWriter::tagged(buf, b'X').seal();
}

/// PasswordMessage carrying a cleartext or MD5-hashed password.
pub fn password(buf: &mut Vec<u8>, response: &str) {
    let mut frame = FrameWriter::tagged(buf, b'p');
    frame.put_cstr(response);
    frame.seal();
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// The response to an MD5 authentication challenge:
/// `"md5" + md5(md5(password ‖ user) ‖ salt)` in lowercase hex.
pub fn md5_response(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let credentials = md5_hex(&[password.as_bytes(), user.as_bytes()]);
    format!("md5{}", md5_hex(&[credentials.as_bytes(), salt]))
}

/// Query: the simple-protocol entry point. Multiple semicolon-separated
/// statements may share one message.
pub fn query(buf: &mut Vec<u8>, sql: &str) {
    let mut frame = FrameWriter::tagged(buf, b'Q');
    frame.put_cstr(sql);
    frame.seal();
}

/// Parse: create a named prepared statement. An empty `param_oids` slice
/// leaves parameter type inference to the server.
pub fn parse(buf: &mut Vec<u8>, statement: &str, sql: &str, param_oids: &[Oid]) {
    let mut frame = FrameWriter::tagged(buf, b'P');
    frame.put_cstr(statement);
    frame.put_cstr(sql);
    frame.put_i16(param_oids.len() as i16);
    for &oid in param_oids {
        frame.put_i32(oid as i32);
    }
    frame.seal();
}

/// Describe(`S`): ask for a statement's parameter and row descriptions.
pub fn describe_statement(buf: &mut Vec<u8>, statement: &str) {
    let mut frame = FrameWriter::tagged(buf, b'D');
    frame.put_u8(b'S');
    frame.put_cstr(statement);
    frame.seal();
}

/// Bind: attach text-format parameters to a portal.
///
/// Zero parameter and result format codes are written, which selects the
/// text format for both directions. `None` binds SQL NULL (length -1).
pub fn bind(buf: &mut Vec<u8>, portal: &str, statement: &str, params: &[Option<Vec<u8>>]) {
    let mut frame = FrameWriter::tagged(buf, b'B');
    frame.put_cstr(portal);
    frame.put_cstr(statement);

    frame.put_i16(0); // parameter format codes: none, default to text

    frame.put_i16(params.len() as i16);
    for param in params {
        match param {
            Some(text) => {
                frame.put_i32(text.len() as i32);
                frame.put_bytes(text);
            }
            None => frame.put_i32(-1),
        }
    }

    frame.put_i16(0); // result format codes: none, default to text
    frame.seal();
}

/// Execute: run a portal. A `max_rows` of zero means "until completion".
pub fn execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut frame = FrameWriter::tagged(buf, b'E');
    frame.put_cstr(portal);
    frame.put_i32(max_rows as i32);
    frame.seal();
}

/// Close(`S`): release a prepared statement on the server.
pub fn close_statement(buf: &mut Vec<u8>, statement: &str) {
    let mut frame = FrameWriter::tagged(buf, b'C');
    frame.put_u8(b'S');
    frame.put_cstr(statement);
    frame.seal();
}

/// Sync: close out an extended-protocol exchange; the server replies with
/// ReadyForQuery once everything queued so far has been processed.
pub fn sync(buf: &mut Vec<u8>) {
    FrameWriter::tagged(buf, b'S').seal();
}

/// CopyData: one chunk of copy-in payload.
pub fn copy_data(buf: &mut Vec<u8>, chunk: &[u8]) {
    let mut frame = FrameWriter::tagged(buf, b'd');
    frame.put_bytes(chunk);
    frame.seal();
}

/// CopyDone: the copy-in stream ended normally.
pub fn copy_done(buf: &mut Vec<u8>) {
    FrameWriter::tagged(buf, b'c').seal();
}

/// CopyFail: abort copy-in; the server responds with an ErrorResponse.
pub fn copy_fail(buf: &mut Vec<u8>, reason: &str) {
    let mut frame = FrameWriter::tagged(buf, b'f');
    frame.put_cstr(reason);
    frame.seal();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode the length field of the frame starting at byte `at`.
    fn frame_len(buf: &[u8], at: usize) -> usize {
        i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize
    }

    #[test]
    fn startup_frame_layout() {
        let mut buf = Vec::new();
        startup(&mut buf, &[("user", "alice"), ("database", "orders")]);

        // Tagless: the length counts the whole frame
        assert_eq!(frame_len(&buf, 0), buf.len());
        assert_eq!(&buf[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0alice\0database\0orders\0\0");
    }

    #[test]
    fn ssl_and_cancel_requests() {
        let mut buf = Vec::new();
        ssl_request(&mut buf);
        assert_eq!(buf, [0, 0, 0, 8, 4, 210, 22, 47]);

        buf.clear();
        cancel_request(&mut buf, 7, 1);
        assert_eq!(frame_len(&buf, 0), 16);
        assert_eq!(&buf[4..8], &CANCEL_REQUEST_CODE.to_be_bytes());
        assert_eq!(&buf[8..12], &7_u32.to_be_bytes());
        assert_eq!(&buf[12..16], &1_u32.to_be_bytes());
    }

    #[test]
    fn empty_body_frames() {
        for (writer, tag) in [
            (terminate as fn(&mut Vec<u8>), b'X'),
            (sync, b'S'),
            (copy_done, b'c'),
        ] {
            let mut buf = Vec::new();
            writer(&mut buf);
            assert_eq!(buf, [tag, 0, 0, 0, 4], "tag {:?}", tag as char);
        }
    }

    #[test]
    fn md5_response_shape() {
        let response = md5_response("alice", "hunter2", &[1, 2, 3, 4]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 35);
        assert!(response[3..].bytes().all(|b| b.is_ascii_hexdigit()));

        // Stable for fixed inputs, distinct per salt
        assert_eq!(response, md5_response("alice", "hunter2", &[1, 2, 3, 4]));
        assert_ne!(response, md5_response("alice", "hunter2", &[4, 3, 2, 1]));
    }

    #[test]
    fn query_and_password_frames() {
        let mut buf = Vec::new();
        query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], b'Q');
        assert_eq!(frame_len(&buf, 1), buf.len() - 1);
        assert_eq!(&buf[5..], b"SELECT 1\0");

        buf.clear();
        password(&mut buf, "hunter2");
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..], b"hunter2\0");
    }

    #[test]
    fn parse_and_describe_frames() {
        let mut buf = Vec::new();
        parse(&mut buf, "s1", "SELECT $1", &[23]);
        assert_eq!(buf[0], b'P');
        assert_eq!(frame_len(&buf, 1), buf.len() - 1);
        assert_eq!(&buf[5..18], b"s1\0SELECT $1\0");
        assert_eq!(&buf[18..20], &1_i16.to_be_bytes());
        assert_eq!(&buf[20..24], &23_i32.to_be_bytes());

        buf.clear();
        describe_statement(&mut buf, "s1");
        assert_eq!(buf[0], b'D');
        assert_eq!(&buf[5..], b"Ss1\0");
    }

    #[test]
    fn bind_frame_with_text_and_null_params() {
        let mut buf = Vec::new();
        bind(&mut buf, "", "s1", &[Some(b"42".to_vec()), None]);

        assert_eq!(buf[0], b'B');
        assert_eq!(frame_len(&buf, 1), buf.len() - 1);

        let body = &buf[5..];
        assert_eq!(&body[..4], b"\0s1\0"); // unnamed portal + statement name
        assert_eq!(&body[4..6], &0_i16.to_be_bytes()); // no param format codes
        assert_eq!(&body[6..8], &2_i16.to_be_bytes()); // two parameters
        assert_eq!(&body[8..14], &[0, 0, 0, 2, b'4', b'2']);
        assert_eq!(&body[14..18], &(-1_i32).to_be_bytes()); // NULL
        assert_eq!(&body[18..20], &0_i16.to_be_bytes()); // no result format codes
    }

    #[test]
    fn execute_and_close_frames() {
        let mut buf = Vec::new();
        execute(&mut buf, "", 0);
        assert_eq!(buf[0], b'E');
        assert_eq!(frame_len(&buf, 1), 9); // empty portal name + max_rows

        buf.clear();
        close_statement(&mut buf, "s1");
        assert_eq!(buf[0], b'C');
        assert_eq!(&buf[5..], b"Ss1\0");
    }

    #[test]
    fn copy_frames() {
        let mut buf = Vec::new();
        copy_data(&mut buf, b"a\t1\n");
        assert_eq!(buf[0], b'd');
        assert_eq!(frame_len(&buf, 1), 8);
        assert_eq!(&buf[5..], b"a\t1\n");

        buf.clear();
        copy_fail(&mut buf, "reader gave up");
        assert_eq!(buf[0], b'f');
        assert_eq!(&buf[5..], b"reader gave up\0");
    }
}
