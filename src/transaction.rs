//! `MULTI`/`EXEC` transactions with optional `WATCH` preconditions.
//!
//! A `Transaction` buffers commands locally instead of submitting them to
//! the engine one at a time. `execute` builds the whole wire sequence at
//! once — preconditions, `MULTI`, one synthetic queue-ack per buffered
//! command, then `EXEC` — and hands it to the engine as a single atomic
//! batch via `submit_composite`, so nothing else can interleave between a
//! transaction's `MULTI` and its `EXEC`.
//!
//! `EXEC` always terminates the sequence; a transaction is never
//! discarded on the wire with `DISCARD` unless the caller calls
//! `discard()` before `execute()` runs, because deciding to send `DISCARD`
//! instead would require blocking the write path on a precondition's
//! reply before the batch is fully written, which the writer must never
//! do.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::{Command, Completion, Message, Sink};

/// A buffered `MULTI`/`EXEC` transaction against one `Engine`.
///
/// Only one `Transaction` may be active per engine at a time; nesting is
/// rejected with `Error::Lifecycle`.
pub struct Transaction {
    parent: Arc<Engine>,
    preconditions: Mutex<Vec<Arc<Message>>>,
    buffered: Mutex<Vec<Arc<Message>>>,
    finished: bool,
}

impl Transaction {
    pub fn new(parent: Arc<Engine>) -> Result<Self> {
        if parent.tx_active().swap(true, Ordering::AcqRel) {
            return Err(Error::Lifecycle(
                "a transaction is already active on this connection".to_string(),
            ));
        }
        Ok(Self {
            parent,
            preconditions: Mutex::new(Vec::new()),
            buffered: Mutex::new(Vec::new()),
            finished: false,
        })
    }

    /// Registers a `WATCH key` precondition, sent ahead of `MULTI`. Returns
    /// a completion for the `WATCH` reply itself (ordinarily `OK`).
    pub fn watch(&self, key: impl Into<Vec<u8>>) -> Arc<Completion<bool>> {
        let completion = Completion::new();
        let msg = Message::new(
            Command::new("WATCH").arg(key).expect_reply("OK"),
            Sink::Bool(Arc::clone(&completion)),
        );
        self.preconditions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(msg);
        completion
    }

    pub fn queue_bool(&self, cmd: Command) -> Arc<Completion<bool>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Bool(Arc::clone(&completion))));
        completion
    }

    pub fn queue_int(&self, cmd: Command) -> Arc<Completion<i64>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Int(Arc::clone(&completion))));
        completion
    }

    pub fn queue_bytes(&self, cmd: Command) -> Arc<Completion<Vec<u8>>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Bytes(Arc::clone(&completion))));
        completion
    }

    pub fn queue_str(&self, cmd: Command) -> Arc<Completion<String>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Str(Arc::clone(&completion))));
        completion
    }

    pub fn queue_opt_bytes(&self, cmd: Command) -> Arc<Completion<Option<Vec<u8>>>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::OptBytes(Arc::clone(&completion))));
        completion
    }

    pub fn queue_array_bytes(&self, cmd: Command) -> Arc<Completion<Vec<Option<Vec<u8>>>>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::ArrayBytes(Arc::clone(&completion))));
        completion
    }

    pub fn queue_pairs(&self, cmd: Command) -> Arc<Completion<Vec<(Vec<u8>, Vec<u8>)>>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Pairs(Arc::clone(&completion))));
        completion
    }

    pub fn queue_raw(&self, cmd: Command) -> Arc<Completion<crate::protocol::Reply>> {
        let completion = Completion::new();
        self.buffer(Message::new(cmd, Sink::Raw(Arc::clone(&completion))));
        completion
    }

    fn buffer(&self, msg: Arc<Message>) {
        self.buffered.lock().unwrap_or_else(|p| p.into_inner()).push(msg);
    }

    /// Fails every buffered and precondition message with `Error::Cancelled`
    /// and releases the transaction slot without sending anything.
    pub fn discard(mut self) {
        self.discard_inner();
        self.finished = true;
    }

    fn discard_inner(&self) {
        for msg in self.preconditions.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            msg.fail(Error::Cancelled);
        }
        for msg in self.buffered.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            msg.fail(Error::Cancelled);
        }
        self.parent.tx_active().store(false, Ordering::Release);
    }

    /// Builds the full wire sequence and submits it to the parent engine as
    /// one atomic batch. Returns a completion that resolves to `true` if
    /// `EXEC` committed, `false` if it aborted (nil reply, e.g. a watched
    /// key changed).
    ///
    /// DB-select reconciliation happens here, against a local tracker
    /// seeded from the parent's current DB, rather than through
    /// `write_one`'s generic per-message reconciliation: once `MULTI` is on
    /// the wire every reply until `EXEC` is `QUEUED`, not the command's own
    /// reply, so a reconciling `SELECT` placed after `MULTI` needs its own
    /// `QUEUED`-shaped expectation and its own slot in `EXEC`'s array.
    pub fn execute(mut self) -> Result<Arc<Completion<bool>>> {
        let preconditions = std::mem::take(
            &mut *self.preconditions.lock().unwrap_or_else(|p| p.into_inner()),
        );
        let buffered = std::mem::take(
            &mut *self.buffered.lock().unwrap_or_else(|p| p.into_inner()),
        );

        let multi = Message::new(
            Command::new("MULTI").expect_reply("OK").must_succeed(),
            Sink::Ignore,
        );

        let mut wire = Vec::with_capacity(preconditions.len() + buffered.len() + 2);
        wire.extend(preconditions);
        wire.push(multi);

        let mut current_db = self.parent.current_db();
        let mut exec_slots = Vec::with_capacity(buffered.len());
        for msg in &buffered {
            if let Some(target) = msg.db {
                if current_db != Some(target) {
                    let select = Message::new(
                        Command::new("SELECT").arg(target.to_string()).expect_reply("QUEUED"),
                        Sink::Ignore,
                    );
                    wire.push(select);
                    exec_slots.push(None);
                    current_db = Some(target);
                }
            }
            let wire_entry = Message::new(
                Command {
                    name: msg.command.clone(),
                    args: msg.args.clone(),
                    db: None,
                    expected: Some(b"QUEUED".to_vec()),
                    flags: msg.flags,
                }
                .must_succeed(),
                Sink::Ignore,
            );
            wire.push(wire_entry);
            exec_slots.push(Some(Arc::clone(msg)));
        }

        let completion = Completion::new();
        let exec = Message::new(
            Command::new("EXEC"),
            Sink::TxExec {
                completion: Arc::clone(&completion),
                buffered: exec_slots,
            },
        );
        wire.push(exec);

        let result = self.parent.submit_composite(wire);
        self.parent.tx_active().store(false, Ordering::Release);
        self.finished = true;
        result?;
        Ok(completion)
    }
}

impl Drop for Transaction {
    /// A transaction dropped without calling `discard()` or `execute()`
    /// releases the active-transaction slot and cancels anything buffered,
    /// the same as an explicit `discard()`.
    fn drop(&mut self) {
        if !self.finished {
            self.discard_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::Opts;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn fake_server(turns: Vec<(Vec<u8>, Vec<u8>)>) -> std::net::SocketAddr {
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

    fn connect(addr: std::net::SocketAddr) -> Arc<Engine> {
        let opts = Opts {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Opts::default()
        };
        Engine::connect(opts).unwrap()
    }

    #[test]
    fn second_transaction_is_rejected_while_first_active() {
        let addr = fake_server(vec![(
            b"*1\r\n$4\r\nINFO\r\n".to_vec(),
            b"+PONG\r\n".to_vec(),
        )]);
        let engine = connect(addr);
        let first = Transaction::new(Arc::clone(&engine)).unwrap();
        let err = Transaction::new(Arc::clone(&engine)).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        first.discard();
        let _ = Transaction::new(engine).unwrap();
    }

    #[test]
    fn commit_fans_out_exec_array_to_buffered_sinks() {
        let addr = fake_server(vec![
            (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
            (
                b"*1\r\n$5\r\nMULTI\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*1\r\n$4\r\nEXEC\r\n"
                    .to_vec(),
                b"+OK\r\n+QUEUED\r\n*1\r\n+OK\r\n".to_vec(),
            ),
        ]);
        let engine = connect(addr);
        let tx = Transaction::new(Arc::clone(&engine)).unwrap();
        let set_reply = tx.queue_bool(Command::new("SET").arg("k").arg("v").expect_reply("OK"));
        let exec_reply = tx.execute().unwrap();
        assert!(engine.wait(&exec_reply).unwrap());
        assert!(engine.wait(&set_reply).unwrap());
    }

    #[test]
    fn db_mismatch_inside_transaction_is_queued_not_ok() {
        let addr = fake_server(vec![
            (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
            (
                concat_bytes(&[
                    b"*1\r\n$5\r\nMULTI\r\n",
                    b"*2\r\n$6\r\nSELECT\r\n$1\r\n5\r\n",
                    b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
                    b"*1\r\n$4\r\nEXEC\r\n",
                ]),
                b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n+OK\r\n+OK\r\n".to_vec(),
            ),
        ]);
        let engine = connect(addr);
        let tx = Transaction::new(Arc::clone(&engine)).unwrap();
        let set_reply = tx.queue_bool(
            Command::new("SET").arg("k").arg("v").expect_reply("OK").db(5),
        );
        let exec_reply = tx.execute().unwrap();

        assert!(engine.wait(&exec_reply).unwrap());
        assert!(engine.wait(&set_reply).unwrap());
        assert_eq!(engine.state().get(), crate::state::ConnectionState::Open);
    }

    fn concat_bytes(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn nil_exec_aborts_and_cancels_buffered_commands() {
        let addr = fake_server(vec![
            (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
            (
                b"*2\r\n$5\r\nWATCH\r\n$1\r\nk\r\n*1\r\n$5\r\nMULTI\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*1\r\n$4\r\nEXEC\r\n"
                    .to_vec(),
                b"+OK\r\n+OK\r\n+QUEUED\r\n*-1\r\n".to_vec(),
            ),
        ]);
        let engine = connect(addr);
        let tx = Transaction::new(Arc::clone(&engine)).unwrap();
        let _watch = tx.watch("k");
        let set_reply = tx.queue_bool(Command::new("SET").arg("k").arg("v").expect_reply("OK"));
        let exec_reply = tx.execute().unwrap();
        assert!(!engine.wait(&exec_reply).unwrap());
        assert!(matches!(engine.wait(&set_reply), Err(Error::Cancelled)));
    }
}
