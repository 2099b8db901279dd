//! Out-of-band query cancellation.

mod common;

use std::sync::mpsc;
use std::sync::Mutex;

use common::{CANCEL_REQUEST_CODE, MockServer};
use pgtext::Db;

#[test]
fn cancel_token_sends_cancel_request_on_a_new_socket() {
    let (sender, receiver) = mpsc::channel::<(u32, u32)>();
    let sender = Mutex::new(sender);

    let server = MockServer::start(move |index, session| {
        if index == 0 {
            session.expect_startup();
            session.auth_ok_with_key(1234, 5678);

            // Keep serving so the transaction stays open
            assert_eq!(session.expect_query(), "BEGIN");
            session.command_complete("BEGIN");
            session.ready(b'T');

            assert_eq!(session.expect_query(), "ROLLBACK");
            session.command_complete("ROLLBACK");
            session.ready(b'I');
            return;
        }

        // The cancellation arrives out-of-band on a fresh connection
        let (code, rest) = session.read_startup_frame();
        assert_eq!(code, CANCEL_REQUEST_CODE);
        let pid = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let secret = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        sender.lock().unwrap().send((pid, secret)).unwrap();
        // Per protocol the server just closes the socket
    });

    let db = Db::connect(server.opts()).unwrap();
    let tx = db.begin().unwrap();

    let token = tx
        .cancel_token()
        .unwrap()
        .expect("BackendKeyData was sent at startup");
    assert_eq!(token.process_id(), 1234);
    token.cancel().unwrap();

    let (pid, secret) = receiver
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap();
    assert_eq!((pid, secret), (1234, 5678));

    // Cancellation does not disturb the pinned connection
    tx.rollback().unwrap();
}
