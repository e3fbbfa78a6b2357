//! Replays literal wire scenarios against a loopback fake server, covering
//! PING/PONG, DB switching, server errors, must-succeed init failures, and
//! transaction commit/abort.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use respipe::{Command, ConnectionState, Engine, ErrorEvent, Opts, Reply, Transaction};

/// Serves one request/response turn per entry: waits to receive exactly
/// `request.len()` bytes, then writes `response`, before moving to the
/// next turn.
fn fake_server(turns: Vec<(Vec<u8>, Vec<u8>)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        for (request, response) in turns {
            let mut received = 0;
            let mut buf = [0_u8; 1024];
            while received < request.len() {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => received += n,
                }
            }
            if stream.write_all(&response).is_err() {
                return;
            }
            let _ = stream.flush();
        }
    });
    addr
}

fn opts_for(addr: SocketAddr) -> Opts {
    Opts {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..Opts::default()
    }
}

/// Scenario 1: basic PING/PONG.
#[test]
fn ping_pong_resolves_to_status() {
    let addr = fake_server(vec![
        (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        (b"*1\r\n$4\r\nPING\r\n".to_vec(), b"+PONG\r\n".to_vec()),
    ]);
    let engine = Engine::connect(opts_for(addr)).unwrap();
    let reply = engine.execute_raw(Command::new("PING")).unwrap();
    assert_eq!(engine.wait(&reply).unwrap(), Reply::Status(b"PONG".to_vec()));
}

/// Scenario 2: a `db`-targeted command triggers a synthetic `SELECT` first,
/// and the caller only ever sees the real command's reply.
#[test]
fn db_switch_injects_synthetic_select() {
    let addr = fake_server(vec![
        (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        (
            b"*2\r\n$6\r\nSELECT\r\n$1\r\n3\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec(),
            b"+OK\r\n$5\r\nhello\r\n".to_vec(),
        ),
    ]);
    let engine = Engine::connect(opts_for(addr)).unwrap();
    let reply = engine.execute_bytes(Command::new("GET").arg("k").db(3)).unwrap();
    assert_eq!(engine.wait(&reply).unwrap(), b"hello".to_vec());
}

/// Scenario 3: a server error fails only the one caller's future, fires a
/// non-fatal error event, and leaves the connection open.
#[test]
fn server_error_is_non_fatal() {
    let addr = fake_server(vec![
        (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        (
            b"*2\r\n$4\r\nINCR\r\n$3\r\nkey\r\n".to_vec(),
            b"-ERR value is not an integer or out of range\r\n".to_vec(),
        ),
    ]);
    let events: Arc<Mutex<Vec<ErrorEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_cb = Arc::clone(&events);
    let engine = Engine::connect_with(
        opts_for(addr),
        Some(Arc::new(move |event: ErrorEvent| {
            events_cb.lock().unwrap().push(event);
        })),
        None,
    )
    .unwrap();

    let reply = engine.execute_int(Command::new("INCR").arg("key")).unwrap();
    let err = engine.wait(&reply).unwrap_err();
    assert!(matches!(err, respipe::Error::Server(_)));

    assert_eq!(engine.state().get(), ConnectionState::Open);
    let seen = events.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].is_fatal);
}

/// Scenario 4: a must-succeed `AUTH` failure during init closes the
/// connection and fails the connect call itself.
#[test]
fn must_succeed_auth_failure_closes_connection() {
    let addr = fake_server(vec![(
        b"*2\r\n$4\r\nAUTH\r\n$9\r\nsecretpwd\r\n".to_vec(),
        b"-WRONGPASS invalid password\r\n".to_vec(),
    )]);
    let opts = Opts {
        password: Some("secretpwd".to_string()),
        ..opts_for(addr)
    };
    let err = Engine::connect(opts).unwrap_err();
    assert!(matches!(err, respipe::Error::Server(_)));
}

/// Scenario 5: a transaction commit fans `EXEC`'s array reply out to the
/// buffered futures and resolves the transaction future to `true`.
#[test]
fn transaction_commit_resolves_buffered_futures() {
    let addr = fake_server(vec![
        (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        (
            concat_bytes(&[
                b"*1\r\n$5\r\nMULTI\r\n",
                b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
                b"*2\r\n$4\r\nINCR\r\n$1\r\na\r\n",
                b"*1\r\n$4\r\nEXEC\r\n",
            ]),
            b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n+OK\r\n:2\r\n".to_vec(),
        ),
    ]);
    let engine = Engine::connect(opts_for(addr)).unwrap();
    let tx = Transaction::new(Arc::clone(&engine)).unwrap();
    let set_reply = tx.queue_bool(Command::new("SET").arg("a").arg("1").expect_reply("OK"));
    let incr_reply = tx.queue_int(Command::new("INCR").arg("a"));
    let exec_reply = tx.execute().unwrap();

    assert!(engine.wait(&exec_reply).unwrap());
    assert!(engine.wait(&set_reply).unwrap());
    assert_eq!(engine.wait(&incr_reply).unwrap(), 2);
}

/// Scenario 6: a nil `EXEC` (a watched precondition failed) cancels every
/// buffered future and resolves the transaction future to `false`.
#[test]
fn transaction_abort_cancels_buffered_futures() {
    let addr = fake_server(vec![
        (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        (
            concat_bytes(&[
                b"*2\r\n$5\r\nWATCH\r\n$1\r\na\r\n",
                b"*1\r\n$5\r\nMULTI\r\n",
                b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
                b"*1\r\n$4\r\nEXEC\r\n",
            ]),
            b"+OK\r\n+OK\r\n+QUEUED\r\n*-1\r\n".to_vec(),
        ),
    ]);
    let engine = Engine::connect(opts_for(addr)).unwrap();
    let tx = Transaction::new(Arc::clone(&engine)).unwrap();
    let _watch = tx.watch("a");
    let set_reply = tx.queue_bool(Command::new("SET").arg("a").arg("1").expect_reply("OK"));
    let exec_reply = tx.execute().unwrap();

    assert!(!engine.wait(&exec_reply).unwrap());
    assert!(matches!(engine.wait(&set_reply), Err(respipe::Error::Cancelled)));
}

fn concat_bytes(parts: &[&[u8]]) -> Vec<u8> {
    parts.iter().flat_map(|p| p.iter().copied()).collect()
}
