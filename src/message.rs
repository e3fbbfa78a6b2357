//! Request messages and result sinks.
//!
//! A `Message` is the engine's view of one in-flight command: the bytes to
//! write, the database it targets, and a lifecycle state that may only move
//! forward (`NotSent -> Sent -> Complete`, or `NotSent -> Cancelled`) via
//! compare-and-swap. A `Sink` is the caller's view: a closed sum type keyed
//! by the shape of reply it expects, each variant owning a one-shot
//! `Completion` the caller can block on or poll.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result, ServerError};
use crate::protocol::Reply;

/// Flags that modify how a message is scheduled, independent of its
/// expected reply shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// A failed reply for this message tears down the whole connection
    /// instead of just failing this message's sink.
    pub must_succeed: bool,
    /// Bypasses the held gate during the init handshake, same as
    /// `queue_jump` bypasses it for ordinary traffic.
    pub during_init: bool,
    /// Bypasses the held gate and is written ahead of messages already
    /// queued ahead of it is *not* implied — queue-jump only means "do not
    /// wait for the engine to become unheld"; FIFO order within `unsent` is
    /// otherwise preserved.
    pub queue_jump: bool,
}

/// A command plus its targeting/scheduling metadata, not yet bound to a
/// result sink. Built with a small fluent, chainable builder API.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: Vec<u8>,
    pub args: Vec<Vec<u8>>,
    pub db: Option<i64>,
    pub expected: Option<Vec<u8>>,
    pub flags: Flags,
}

impl Command {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            db: None,
            expected: None,
            flags: Flags::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn db(mut self, db: i64) -> Self {
        self.db = Some(db);
        self
    }

    pub fn expect_reply(mut self, literal: impl Into<Vec<u8>>) -> Self {
        self.expected = Some(literal.into());
        self
    }

    pub fn must_succeed(mut self) -> Self {
        self.flags.must_succeed = true;
        self
    }

    pub fn during_init(mut self) -> Self {
        self.flags.during_init = true;
        self
    }

    pub fn queue_jump(mut self) -> Self {
        self.flags.queue_jump = true;
        self
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotSent = 0,
    Sent = 1,
    Complete = 2,
    Cancelled = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LifecycleState::Sent,
            2 => LifecycleState::Complete,
            3 => LifecycleState::Cancelled,
            _ => LifecycleState::NotSent,
        }
    }
}

/// One-shot future/promise pair: a `Mutex<Option<Result<T>>>` guarded by a
/// `Condvar`, rather than anything trait-object based.
pub struct Completion<T> {
    state: Mutex<Option<Result<T>>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn fulfill(&self, value: Result<T>) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(value);
            self.cv.notify_all();
        }
    }

    pub fn try_take(&self) -> Option<Result<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    /// Blocks until fulfilled, or until `timeout` elapses (if given), in
    /// which case `Error::Timeout(None)` is returned. The caller is
    /// expected to attach detail via `Engine::wait` if configured to do so.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(value) = guard.take() {
                return value;
            }
            match timeout {
                None => {
                    guard = self
                        .cv
                        .wait(guard)
                        .unwrap_or_else(|p| p.into_inner());
                }
                Some(d) => {
                    let (next_guard, wait_result) = self
                        .cv
                        .wait_timeout(guard, d)
                        .unwrap_or_else(|p| p.into_inner());
                    guard = next_guard;
                    if wait_result.timed_out() && guard.is_none() {
                        return Err(Error::Timeout(None));
                    }
                }
            }
        }
    }
}

/// Closed sum type over the shapes a caller may ask a reply to be decoded
/// as. Each variant owns the `Completion` its caller is waiting on.
pub enum Sink {
    Bool(Arc<Completion<bool>>),
    Int(Arc<Completion<i64>>),
    Bytes(Arc<Completion<Vec<u8>>>),
    Str(Arc<Completion<String>>),
    OptBytes(Arc<Completion<Option<Vec<u8>>>>),
    OptStr(Arc<Completion<Option<String>>>),
    OptInt(Arc<Completion<Option<i64>>>),
    OptDouble(Arc<Completion<Option<f64>>>),
    ArrayBytes(Arc<Completion<Vec<Option<Vec<u8>>>>>),
    Pairs(Arc<Completion<Vec<(Vec<u8>, Vec<u8>)>>>),
    Raw(Arc<Completion<Reply>>),
    /// No caller is waiting; used for internal wire-protocol bookkeeping
    /// messages (synthetic `SELECT`, `MULTI`, transaction queue acks).
    Ignore,
    /// `EXEC`'s sink: on a successful array reply, fans each element out to
    /// the corresponding buffered message's own sink; on a nil reply (the
    /// optimistic-concurrency abort case), fails every buffered message
    /// with `Error::Cancelled`. A `None` slot stands for a `SELECT` that
    /// `Transaction::execute` injected between `MULTI` and a buffered
    /// command to reconcile a `db` switch — it still occupies one reply
    /// slot in `EXEC`'s array, but no caller is waiting on it.
    TxExec {
        completion: Arc<Completion<bool>>,
        buffered: Vec<Option<Arc<Message>>>,
    },
}

impl Sink {
    pub fn complete(self, reply: Reply) {
        match (self, reply) {
            (Sink::TxExec { completion, buffered }, Reply::Array(Some(items))) => {
                if items.len() == buffered.len() {
                    for (slot, item) in buffered.into_iter().zip(items) {
                        if let Some(msg) = slot {
                            let substituted = substitute_expected(&msg, item);
                            msg.complete_with(substituted);
                        }
                    }
                    completion.fulfill(Ok(true));
                } else {
                    let err = Error::Protocol(format!(
                        "EXEC returned {} replies for {} queued commands",
                        items.len(),
                        buffered.len()
                    ));
                    for slot in buffered.into_iter().flatten() {
                        slot.fail(Error::Cancelled);
                    }
                    completion.fulfill(Err(err));
                }
            }
            (Sink::TxExec { completion, buffered }, Reply::Bulk(None))
            | (Sink::TxExec { completion, buffered }, Reply::Array(None)) => {
                for slot in buffered.into_iter().flatten() {
                    slot.fail(Error::Cancelled);
                }
                completion.fulfill(Ok(false));
            }
            (Sink::TxExec { completion, buffered }, Reply::Cancelled) => {
                for slot in buffered.into_iter().flatten() {
                    slot.fail(Error::Cancelled);
                }
                completion.fulfill(Err(Error::Cancelled));
            }
            (Sink::TxExec { completion, buffered }, Reply::Error(text)) => {
                for slot in buffered.into_iter().flatten() {
                    slot.fail(Error::Cancelled);
                }
                completion.fulfill(Err(Error::Server(ServerError::parse(&text))));
            }
            (Sink::TxExec { completion, .. }, other) => {
                completion.fulfill(Err(Error::Protocol(format!(
                    "unexpected EXEC reply shape: {other:?}"
                ))));
            }
            (sink, Reply::Cancelled) => sink.fail(Error::Cancelled),
            (sink, Reply::Error(text)) => sink.fail(Error::Server(ServerError::parse(&text))),
            (Sink::Ignore, _) => {}
            (Sink::Raw(c), reply) => c.fulfill(Ok(reply)),
            (Sink::Bool(c), Reply::Pass) => c.fulfill(Ok(true)),
            (Sink::Bool(c), Reply::Integer(0)) => c.fulfill(Ok(false)),
            (Sink::Bool(c), Reply::Integer(1)) => c.fulfill(Ok(true)),
            (Sink::Bool(c), Reply::Integer(n)) => {
                c.fulfill(Err(Error::Protocol(format!("integer {n} out of bool range"))));
            }
            (Sink::Int(c), Reply::Integer(n)) => c.fulfill(Ok(n)),
            (Sink::Bytes(c), Reply::Bulk(Some(b))) => c.fulfill(Ok(b)),
            (Sink::Bytes(c), Reply::Bulk(None)) => {
                c.fulfill(Err(Error::Protocol("unexpected nil bulk reply".to_string())));
            }
            (Sink::Str(c), Reply::Bulk(Some(b))) => c.fulfill(decode_utf8(&b)),
            (Sink::OptBytes(c), Reply::Bulk(b)) => c.fulfill(Ok(b)),
            (Sink::OptStr(c), Reply::Bulk(None)) => c.fulfill(Ok(None)),
            (Sink::OptStr(c), Reply::Bulk(Some(b))) => c.fulfill(decode_utf8(&b).map(Some)),
            (Sink::OptInt(c), Reply::Bulk(None)) => c.fulfill(Ok(None)),
            (Sink::OptInt(c), Reply::Integer(n)) => c.fulfill(Ok(Some(n))),
            (Sink::OptInt(c), Reply::Bulk(Some(b))) => c.fulfill(decode_i64(&b).map(Some)),
            (Sink::OptDouble(c), Reply::Bulk(None)) => c.fulfill(Ok(None)),
            (Sink::OptDouble(c), Reply::Bulk(Some(b))) => c.fulfill(decode_f64(&b).map(Some)),
            (Sink::ArrayBytes(c), Reply::Array(None)) => c.fulfill(Ok(Vec::new())),
            (Sink::ArrayBytes(c), Reply::Array(Some(items))) => {
                c.fulfill(decode_bulk_array(items));
            }
            (Sink::Pairs(c), Reply::Array(None)) => c.fulfill(Ok(Vec::new())),
            (Sink::Pairs(c), Reply::Array(Some(items))) => c.fulfill(decode_pairs(items)),
            (sink, reply) => {
                sink.fail(Error::Protocol(format!(
                    "reply shape mismatch for sink: {reply:?}"
                )));
            }
        }
    }

    pub fn fail(self, err: Error) {
        match self {
            Sink::Bool(c) => c.fulfill(Err(err)),
            Sink::Int(c) => c.fulfill(Err(err)),
            Sink::Bytes(c) => c.fulfill(Err(err)),
            Sink::Str(c) => c.fulfill(Err(err)),
            Sink::OptBytes(c) => c.fulfill(Err(err)),
            Sink::OptStr(c) => c.fulfill(Err(err)),
            Sink::OptInt(c) => c.fulfill(Err(err)),
            Sink::OptDouble(c) => c.fulfill(Err(err)),
            Sink::ArrayBytes(c) => c.fulfill(Err(err)),
            Sink::Pairs(c) => c.fulfill(Err(err)),
            Sink::Raw(c) => c.fulfill(Err(err)),
            Sink::Ignore => {}
            Sink::TxExec { completion, buffered } => {
                for slot in buffered.into_iter().flatten() {
                    slot.fail(Error::Cancelled);
                }
                completion.fulfill(Err(err));
            }
        }
    }
}

/// Applies a message's `expected` literal to a decoded reply: a matching
/// `Status` becomes the synthetic `Pass`, a mismatched one becomes an
/// `Error` carrying the actual status text. Used both for ordinary
/// wire-matched replies and for `EXEC`'s per-element fan-out, which
/// bypasses the ordinary dispatch path.
pub(crate) fn substitute_expected(msg: &Message, reply: Reply) -> Reply {
    if let (Some(expected), Reply::Status(actual)) = (&msg.expected, &reply) {
        if actual == expected {
            return Reply::Pass;
        }
        return Reply::Error(String::from_utf8_lossy(actual).into_owned());
    }
    reply
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    simdutf8::basic::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| Error::Protocol("invalid utf-8 in bulk reply".to_string()))
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    decode_utf8(bytes)?
        .parse()
        .map_err(|_| Error::Protocol("bulk reply is not an integer".to_string()))
}

fn decode_f64(bytes: &[u8]) -> Result<f64> {
    decode_utf8(bytes)?
        .parse()
        .map_err(|_| Error::Protocol("bulk reply is not a double".to_string()))
}

fn decode_bulk_array(items: Vec<Reply>) -> Result<Vec<Option<Vec<u8>>>> {
    items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(b) => Ok(b),
            other => Err(Error::Protocol(format!(
                "expected bulk array element, got {other:?}"
            ))),
        })
        .collect()
}

fn decode_pairs(items: Vec<Reply>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if items.len() % 2 != 0 {
        return Err(Error::Protocol(
            "expected an even-length array for pairs".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        let (Reply::Bulk(Some(k)), Reply::Bulk(Some(v))) = (k, v) else {
            return Err(Error::Protocol(
                "expected bulk key/value elements in pairs array".to_string(),
            ));
        };
        out.push((k, v));
    }
    Ok(out)
}

/// One in-flight (or not-yet-sent) command.
pub struct Message {
    pub command: Vec<u8>,
    pub args: Vec<Vec<u8>>,
    pub db: Option<i64>,
    pub expected: Option<Vec<u8>>,
    pub flags: Flags,
    state: AtomicU8,
    sink: Mutex<Option<Sink>>,
}

impl Message {
    pub fn new(command: Command, sink: Sink) -> Arc<Self> {
        Arc::new(Self {
            command: command.name,
            args: command.args,
            db: command.db,
            expected: command.expected,
            flags: command.flags,
            state: AtomicU8::new(LifecycleState::NotSent as u8),
            sink: Mutex::new(Some(sink)),
        })
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn try_mark_sent(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::NotSent as u8,
                LifecycleState::Sent as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::NotSent as u8,
                LifecycleState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_complete(&self) {
        self.state.store(LifecycleState::Complete as u8, Ordering::Release);
    }

    /// Completes this message with a decoded reply, consuming the sink.
    /// A no-op if the sink was already taken (double-completion, which
    /// should not happen but must not panic if it does).
    pub fn complete_with(&self, reply: Reply) {
        let taken = self.sink.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(sink) = taken {
            sink.complete(reply);
            self.mark_complete();
        }
    }

    /// Fails this message with a synthetic error, bypassing reply decoding.
    pub fn fail(&self, err: Error) {
        let taken = self.sink.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(sink) = taken {
            sink.fail(err);
            self.mark_complete();
        }
    }

    /// Short human-readable form for logs and timeout detail: the command
    /// name plus up to four arguments.
    pub fn summary(&self) -> String {
        let mut s = String::from_utf8_lossy(&self.command).into_owned();
        for arg in self.args.iter().take(4) {
            s.push(' ');
            s.push_str(&String::from_utf8_lossy(arg));
        }
        if self.args.len() > 4 {
            s.push_str(" ...");
        }
        s
    }
}
