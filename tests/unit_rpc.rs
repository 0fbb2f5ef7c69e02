//! RPC surface behavior over an in-process connection pair.

mod common;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use crated::daemon::serve_connection;
use crated::rpc::{dispatch, Payload, Request, Response};
use crated::ErrorKind;

#[test]
fn the_full_surface_dispatches() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);

    assert!(dispatch(&engine, Request::Create { name: "/a".into() }).is_success());
    assert!(dispatch(
        &engine,
        Request::SetProperty {
            name: "/a".into(),
            key: "command".into(),
            value: "/bin/true".into(),
        }
    )
    .is_success());
    assert!(dispatch(
        &engine,
        Request::GetProperty { name: "/a".into(), key: "command".into() }
    )
    .is_success());
    assert!(dispatch(
        &engine,
        Request::GetData { name: "/a".into(), key: "state".into(), index: None }
    )
    .is_success());
    assert!(dispatch(&engine, Request::ListContainers).is_success());
    assert!(dispatch(&engine, Request::ListProperties).is_success());
    assert!(dispatch(&engine, Request::ListVolumeProperties).is_success());
    assert!(dispatch(&engine, Request::GetVersion).is_success());
    assert!(dispatch(&engine, Request::Stop { name: "/a".into(), timeout_ms: Some(100) })
        .is_success());
    assert!(dispatch(&engine, Request::Destroy { name: "/a".into() }).is_success());
}

#[test]
fn every_error_kind_serializes_with_its_wire_value() {
    for (kind, value) in [
        (ErrorKind::Success, 0u8),
        (ErrorKind::InvalidValue, 2),
        (ErrorKind::Permission, 5),
        (ErrorKind::NotFound, 6),
        (ErrorKind::Exists, 7),
        (ErrorKind::Busy, 8),
        (ErrorKind::NotSupported, 9),
        (ErrorKind::Timeout, 11),
        (ErrorKind::Aborted, 12),
    ] {
        assert_eq!(kind.wire_value(), value);
    }
}

#[test]
fn responses_round_trip_over_a_socket_pair() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = common::scratch_engine(&tmp);

    let (client, server) = UnixStream::pair().unwrap();
    let handle = std::thread::spawn(move || serve_connection(&engine, server));

    let mut writer = client.try_clone().unwrap();
    for request in [
        Request::Create { name: "/a".into() },
        Request::GetData { name: "/a".into(), key: "absolute_name".into(), index: None },
        Request::Start { name: "/missing".into() },
    ] {
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        writer.write_all(line.as_bytes()).unwrap();
    }
    drop(writer);

    let mut reader = BufReader::new(client);
    let mut responses: Vec<Response> = Vec::new();
    for _ in 0..3 {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        responses.push(serde_json::from_str(&line).unwrap());
    }
    drop(reader);
    handle.join().unwrap();

    assert_eq!(responses.len(), 3);
    assert!(responses[0].is_success());
    assert_eq!(responses[1].payload, Payload::Value("/a".into()));
    assert_eq!(responses[2].error, ErrorKind::NotFound);
    assert_eq!(responses[2].error_code, ErrorKind::NotFound.wire_value());
}
