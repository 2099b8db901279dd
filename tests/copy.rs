//! COPY IN/OUT streaming against a scripted server.

mod common;

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use common::MockServer;
use pgtext::{Db, Error};

#[test]
fn copy_from_streams_reader_to_server() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let server = MockServer::start(move |_, session| {
        session.handshake();
        assert_eq!(session.expect_query(), "COPY words FROM STDIN");
        session.copy_in_response(2);

        let data = session.collect_copy_in().expect("copy data");
        sink.lock().unwrap().extend_from_slice(&data);

        session.command_complete("COPY 4");
        session.ready(b'I');
    });

    let data = "hello\t5\nworld\t5\nfoo\t3\nbar\t3\n";
    let db = Db::connect(server.opts()).unwrap();
    let res = db
        .copy_from(&mut Cursor::new(data), "COPY words FROM STDIN", &[])
        .unwrap();

    assert_eq!(res.affected(), 4);
    assert_eq!(*received.lock().unwrap(), data.as_bytes());
}

#[test]
fn copy_from_chunks_large_payloads() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let server = MockServer::start(move |_, session| {
        session.handshake();
        session.expect_query();
        session.copy_in_response(1);
        let data = session.collect_copy_in().expect("copy data");
        sink.lock().unwrap().extend_from_slice(&data);
        session.command_complete("COPY 100000");
        session.ready(b'I');
    });

    // Large enough to require many CopyData frames
    let mut data = Vec::new();
    for i in 0..100_000 {
        data.extend_from_slice(format!("{}\n", i).as_bytes());
    }

    let db = Db::connect(server.opts()).unwrap();
    let res = db
        .copy_from(&mut Cursor::new(&data), "COPY nums FROM STDIN", &[])
        .unwrap();

    assert_eq!(res.affected(), 100_000);
    assert_eq!(*received.lock().unwrap(), data);
}

#[test]
fn copy_to_streams_server_to_writer() {
    let data = "hello\t5\nworld\t5\n";
    let server = MockServer::start(move |_, session| {
        session.handshake();
        assert_eq!(session.expect_query(), "COPY words TO STDOUT");
        session.copy_out_response(2);
        session.send(b'd', b"hello\t5\n");
        session.send(b'd', b"world\t5\n");
        session.send(b'c', b""); // CopyDone
        session.command_complete("COPY 2");
        session.ready(b'I');
    });

    let db = Db::connect(server.opts()).unwrap();
    let mut out = Vec::new();
    let res = db.copy_to(&mut out, "COPY words TO STDOUT", &[]).unwrap();

    assert_eq!(res.affected(), 2);
    assert_eq!(out, data.as_bytes());
}

#[test]
fn copy_round_trip_is_byte_exact() {
    let server = MockServer::start(|_, session| {
        session.handshake();

        // COPY TO: serve fixed bytes
        session.expect_query();
        session.copy_out_response(1);
        session.send(b'd', b"a\t1\nb\t2\n");
        session.send(b'c', b"");
        session.command_complete("COPY 2");
        session.ready(b'I');

        // COPY FROM: echo expectations
        session.expect_query();
        session.copy_in_response(1);
        let data = session.collect_copy_in().expect("copy data");
        assert_eq!(data, b"a\t1\nb\t2\n");
        session.command_complete("COPY 2");
        session.ready(b'I');
    });

    let db = Db::connect(server.opts()).unwrap();

    let mut buffer = Vec::new();
    db.copy_to(&mut buffer, "COPY src TO STDOUT", &[]).unwrap();

    let res = db
        .copy_from(&mut Cursor::new(&buffer), "COPY dst FROM STDIN", &[])
        .unwrap();
    assert_eq!(res.affected(), 2);
}

#[test]
fn copy_from_reader_failure_sends_copy_fail() {
    let server = MockServer::start(|_, session| {
        session.handshake();
        session.expect_query();
        session.copy_in_response(1);

        let err = session.collect_copy_in().expect_err("client aborts");
        assert!(err.contains("broken reader"));

        session.error_response("57014", "COPY from stdin failed");
        session.ready(b'I');
    });

    struct BrokenReader;
    impl std::io::Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("broken reader"))
        }
    }

    let db = Db::connect(server.opts()).unwrap();
    let err = db
        .copy_from(&mut BrokenReader, "COPY t FROM STDIN", &[])
        .unwrap_err();
    assert_eq!(err.sqlstate(), Some("57014"));
    assert!(!err.is_fatal());
}

#[test]
fn copy_error_from_server_is_surfaced() {
    let server = MockServer::start(|_, session| {
        session.handshake();
        session.expect_query();
        session.error_response("42P01", "relation \"missing\" does not exist");
        session.ready(b'I');
    });

    let db = Db::connect(server.opts()).unwrap();
    let err = db
        .copy_from(
            &mut Cursor::new(b"x\n"),
            "COPY missing FROM STDIN",
            &[],
        )
        .unwrap_err();
    assert!(matches!(err, Error::Server(_)));
    assert_eq!(err.sqlstate(), Some("42P01"));
}
