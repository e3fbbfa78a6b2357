//! The connection engine: lifecycle, send path, receive path, completion
//! dispatch.

use std::io::{BufWriter, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer_pool::BufferPool;
use crate::error::{Error, Result};
use crate::handshake::{self, ServerInfo};
use crate::message::{Command, Completion, Message, Sink};
use crate::pending::{self, PendingQueues};
use crate::protocol::{self, FrameReader, Reply};
use crate::stats::{Counters, DbUsage, StatsSnapshot};
use crate::state::{ConnectionState, ConnectionStateCell};
use crate::workers::WorkerPool;
use crate::Opts;

const WORKER_THREADS: usize = 4;

pub type ErrorCallback = Arc<dyn Fn(ErrorEvent) + Send + Sync>;
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Delivered to a registered error callback for both per-message server
/// errors (`is_fatal: false`) and connection-ending failures (`is_fatal:
/// true`).
#[derive(Debug)]
pub struct ErrorEvent {
    pub error: Error,
    pub is_fatal: bool,
}

/// Commands whose successful completion invalidates the tracked current
/// database, forcing a `SELECT` before the next targeted command.
fn invalidates_current_db(command: &[u8]) -> bool {
    matches!(
        command.to_ascii_uppercase().as_slice(),
        b"EVAL" | b"EVALSHA" | b"DISCARD" | b"EXEC"
    )
}

pub struct Engine {
    write_half: Mutex<BufWriter<TcpStream>>,
    pending: PendingQueues,
    current_db: Mutex<Option<i64>>,
    state: ConnectionStateCell,
    counters: Counters,
    db_usage: DbUsage,
    pending_writers: AtomicUsize,
    held: AtomicBool,
    abort: AtomicBool,
    tx_active: AtomicBool,
    workers: WorkerPool,
    opts: Opts,
    server_info: Mutex<ServerInfo>,
    on_error: Option<ErrorCallback>,
    on_closed: Option<ClosedCallback>,
    closed_once: AtomicBool,
    quit_on_close: bool,
}

impl Engine {
    pub fn connect(opts: Opts) -> Result<Arc<Self>> {
        Self::connect_with(opts, None, None)
    }

    pub fn connect_with(
        opts: Opts,
        on_error: Option<ErrorCallback>,
        on_closed: Option<ClosedCallback>,
    ) -> Result<Arc<Self>> {
        opts.validate()?;
        let stream = TcpStream::connect((opts.host.as_str(), opts.port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(opts.io_timeout)?;
        stream.set_write_timeout(opts.io_timeout)?;
        let read_half = stream.try_clone()?;

        let engine = Arc::new(Self {
            write_half: Mutex::new(BufWriter::new(stream)),
            pending: PendingQueues::new(),
            current_db: Mutex::new(Some(0)),
            state: ConnectionStateCell::new(),
            counters: Counters::default(),
            db_usage: DbUsage::default(),
            pending_writers: AtomicUsize::new(0),
            held: AtomicBool::new(true),
            abort: AtomicBool::new(false),
            tx_active: AtomicBool::new(false),
            workers: WorkerPool::new(WORKER_THREADS, false)?,
            opts,
            server_info: Mutex::new(ServerInfo::default()),
            on_error,
            on_closed,
            closed_once: AtomicBool::new(false),
            quit_on_close: true,
        });

        engine.state.transition(ConnectionState::New, ConnectionState::Opening);

        let reader_engine = Arc::clone(&engine);
        thread_spawn_reader(reader_engine, read_half)?;

        handshake::run(&engine)?;
        engine.held.store(false, Ordering::Release);
        engine.kick_writer()?;
        Ok(engine)
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }

    pub fn state(&self) -> &ConnectionStateCell {
        &self.state
    }

    pub fn server_info(&self) -> ServerInfo {
        self.server_info.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn set_server_info(&self, info: ServerInfo) {
        *self.server_info.lock().unwrap_or_else(|p| p.into_inner()) = info;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.counters.snapshot(
            self.pending.unsent_len(),
            self.pending.sent_len(),
            self.db_usage.snapshot(),
        )
    }

    /// Blocks on a completion, applying the engine's `sync_timeout` and, on
    /// timeout, attaching the oldest in-flight command's summary if
    /// `include_detail_in_timeouts` is set.
    pub fn wait<T>(&self, completion: &Completion<T>) -> Result<T> {
        match completion.wait(Some(self.opts.sync_timeout)) {
            Err(Error::Timeout(_)) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let detail = if self.opts.include_detail_in_timeouts {
                    self.pending.oldest_sent_summary()
                } else {
                    None
                };
                Err(Error::Timeout(detail))
            }
            other => other,
        }
    }

    pub fn cancel_unsent(&self) -> usize {
        let drained = self.pending.drain_unsent();
        let mut cancelled = 0;
        for msg in drained {
            let _ = msg.try_cancel();
            self.counters.messages_cancelled.fetch_add(1, Ordering::Relaxed);
            msg.fail(Error::Cancelled);
            cancelled += 1;
        }
        cancelled
    }

    pub fn close(&self, abort: bool) -> Result<()> {
        if abort {
            self.abort.store(true, Ordering::Release);
            self.shutdown(Error::Closed("connection aborted".to_string()));
            return Ok(());
        }
        match self.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => return Ok(()),
            ConnectionState::Open => {}
            _ => {
                return Err(Error::Lifecycle(
                    "cannot close a connection that has not finished opening".to_string(),
                ));
            }
        }
        if !self.state.transition(ConnectionState::Open, ConnectionState::Closing) {
            return Ok(());
        }
        if self.quit_on_close {
            let completion = Completion::new();
            let msg = Message::new(Command::new("QUIT"), Sink::Raw(Arc::clone(&completion)));
            let _ = self.submit(msg);
            let _ = completion.wait(Some(self.opts.sync_timeout));
        }
        // Give any other in-flight `sent` replies (queued ahead of or
        // alongside `QUIT`) a chance to drain before tearing the connection
        // down, rather than failing them with a synthetic closed error the
        // moment `QUIT`'s own reply lands.
        self.pending.wait_sent_drained(self.opts.sync_timeout);
        self.shutdown(Error::Closed("connection closed".to_string()));
        Ok(())
    }

    pub fn execute_raw(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<Reply>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Raw(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_bool(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<bool>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Bool(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_int(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<i64>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Int(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_bytes(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<Vec<u8>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Bytes(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_str(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<String>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Str(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_opt_bytes(
        self: &Arc<Self>,
        cmd: Command,
    ) -> Result<Arc<Completion<Option<Vec<u8>>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::OptBytes(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_opt_str(
        self: &Arc<Self>,
        cmd: Command,
    ) -> Result<Arc<Completion<Option<String>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::OptStr(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_opt_int(self: &Arc<Self>, cmd: Command) -> Result<Arc<Completion<Option<i64>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::OptInt(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_opt_double(
        self: &Arc<Self>,
        cmd: Command,
    ) -> Result<Arc<Completion<Option<f64>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::OptDouble(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_array_bytes(
        self: &Arc<Self>,
        cmd: Command,
    ) -> Result<Arc<Completion<Vec<Option<Vec<u8>>>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::ArrayBytes(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub fn execute_pairs(
        self: &Arc<Self>,
        cmd: Command,
    ) -> Result<Arc<Completion<Vec<(Vec<u8>, Vec<u8>)>>>> {
        let completion = Completion::new();
        self.submit(Message::new(cmd, Sink::Pairs(Arc::clone(&completion))))?;
        Ok(completion)
    }

    pub(crate) fn submit_during_init(&self, msg: Arc<Message>) -> Result<()> {
        self.submit(msg)
    }

    pub(crate) fn force_close_during_init(&self, cause: &Error) {
        let _ = cause;
        self.shutdown(Error::Closed("init handshake failed".to_string()));
    }

    pub(crate) fn tx_active(&self) -> &AtomicBool {
        &self.tx_active
    }

    /// The database the engine believes the connection is currently
    /// selected against, or `None` if unknown (e.g. right after an `EXEC`).
    /// Used by `Transaction::execute` to reconcile `SELECT`s of its own
    /// inside the `MULTI`/`EXEC` wire sequence, since the generic
    /// per-message reconciliation in `write_one` assumes an `OK` reply and
    /// cannot be reused once `MULTI` has put the connection in queuing mode.
    pub(crate) fn current_db(&self) -> Option<i64> {
        *self.current_db.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn submit_composite(&self, wire: Vec<Arc<Message>>) -> Result<()> {
        if matches!(self.state.get(), ConnectionState::Closed | ConnectionState::Closing) {
            return Err(Error::Lifecycle("enqueue after close".to_string()));
        }
        self.pending.push_unsent_batch(wire);
        self.kick_writer()
    }

    fn submit(&self, msg: Arc<Message>) -> Result<()> {
        if self.abort.load(Ordering::Acquire) && msg.command.as_slice() != b"QUIT" {
            msg.fail(Error::Closed("connection aborted".to_string()));
            return Ok(());
        }
        if matches!(self.state.get(), ConnectionState::Closed) && !msg.flags.during_init {
            return Err(Error::Lifecycle("enqueue after close".to_string()));
        }
        if let Some(max) = self.opts.max_unsent {
            if !msg.flags.during_init && self.pending.unsent_len() >= max {
                return Err(Error::Lifecycle(format!(
                    "unsent queue length exceeds max_unsent ({max})"
                )));
            }
        }
        let held = self.held.load(Ordering::Acquire)
            && !msg.flags.during_init
            && !msg.flags.queue_jump;
        self.pending.push_unsent(msg);
        if held {
            return Ok(());
        }
        self.kick_writer()
    }

    fn kick_writer(&self) -> Result<()> {
        self.pending_writers.fetch_add(1, Ordering::AcqRel);
        let outcome = self.drain_and_write();
        let remaining = self.pending_writers.fetch_sub(1, Ordering::AcqRel) - 1;
        outcome?;
        if remaining == 0 {
            let mut sock = self.write_half.lock().unwrap_or_else(|p| p.into_inner());
            sock.flush()?;
        }
        Ok(())
    }

    fn drain_and_write(&self) -> Result<()> {
        let mut sock = self.write_half.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(next) = self.pending.pop_unsent() {
            self.write_one(&mut sock, &next)?;
        }
        Ok(())
    }

    fn write_one(&self, sock: &mut BufWriter<TcpStream>, msg: &Arc<Message>) -> Result<()> {
        if !msg.try_mark_sent() {
            return Ok(());
        }
        if self.abort.load(Ordering::Acquire) && msg.command.as_slice() != b"QUIT" {
            msg.fail(Error::Closed("connection aborted".to_string()));
            return Ok(());
        }

        if let Some(target) = msg.db {
            let needs_select = {
                let current = self.current_db.lock().unwrap_or_else(|p| p.into_inner());
                *current != Some(target)
            };
            if needs_select {
                let select = Message::new(
                    Command::new("SELECT")
                        .arg(target.to_string())
                        .expect_reply("OK")
                        .must_succeed(),
                    Sink::Ignore,
                );
                let _ = select.try_mark_sent();
                self.encode_and_write(sock, &select)?;
                self.pending.record_sent(select);
                *self.current_db.lock().unwrap_or_else(|p| p.into_inner()) = Some(target);
                self.db_usage.record(target);
            }
        }

        if msg.flags.queue_jump {
            self.counters.queue_jumpers.fetch_add(1, Ordering::Relaxed);
        }
        self.encode_and_write(sock, msg)?;
        self.pending.record_sent(Arc::clone(msg));
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);

        if invalidates_current_db(&msg.command) {
            *self.current_db.lock().unwrap_or_else(|p| p.into_inner()) = None;
        }
        Ok(())
    }

    fn encode_and_write(&self, sock: &mut BufWriter<TcpStream>, msg: &Message) -> Result<()> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(1 + msg.args.len());
        args.push(&msg.command);
        args.extend(msg.args.iter().map(Vec::as_slice));
        let mut buf = Vec::with_capacity(32);
        protocol::encode_command(&mut buf, &args);
        protocol::write_frame(sock, &buf)
    }

    fn fire_error(&self, error: Error, is_fatal: bool) {
        tracing::warn!(%error, is_fatal, "connection error event");
        if let Some(cb) = &self.on_error {
            cb(ErrorEvent { error, is_fatal });
        }
    }

    fn fire_closed(&self) {
        if !self.closed_once.swap(true, Ordering::AcqRel) {
            tracing::info!("connection closed");
            if let Some(cb) = &self.on_closed {
                cb();
            }
        }
    }

    fn shutdown(&self, cause: Error) {
        if !self.state.force_closed() {
            return;
        }
        let text = cause.to_string();
        for msg in self.pending.drain_sent() {
            msg.fail(Error::Closed(text.clone()));
        }
        for msg in self.pending.drain_unsent() {
            msg.fail(Error::Closed(text.clone()));
        }
        self.fire_error(cause, true);
        self.fire_closed();
    }
}

fn thread_spawn_reader(engine: Arc<Engine>, read_half: TcpStream) -> Result<()> {
    std::thread::Builder::new()
        .name("respipe-reader".to_string())
        .spawn(move || reader_loop(engine, read_half))?;
    Ok(())
}

fn reader_loop(engine: Arc<Engine>, read_half: TcpStream) {
    let pool = BufferPool::new();
    let mut reader = FrameReader::new(read_half, &pool);
    loop {
        if matches!(engine.state.get(), ConnectionState::Closed) {
            return;
        }
        match reader.next_reply() {
            Ok(None) => {
                engine.shutdown(Error::Closed("server closed the connection".to_string()));
                return;
            }
            Ok(Some(reply)) => {
                engine.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                if reply.is_error() {
                    engine.counters.error_messages.fetch_add(1, Ordering::Relaxed);
                }
                match engine.pending.pop_sent() {
                    Some(msg) => {
                        let is_server_error = reply.is_error();
                        if is_server_error {
                            if let Reply::Error(text) = &reply {
                                engine.fire_error(
                                    Error::Server(crate::error::ServerError::parse(text)),
                                    false,
                                );
                            }
                        }
                        if let Some(fatal) = pending::dispatch_reply(msg, reply, &engine.workers) {
                            engine.shutdown(fatal);
                            return;
                        }
                    }
                    None => {
                        engine.shutdown(Error::Protocol(
                            "reply received with no pending request".to_string(),
                        ));
                        return;
                    }
                }
            }
            Err(err) => {
                let fatal = err.is_fatal();
                engine.shutdown(err);
                if fatal {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    /// Serves one request/response turn per entry: waits to receive exactly
    /// `request.len()` bytes, then writes `response`, before moving to the
    /// next turn.
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

    #[test]
    fn connects_and_completes_ping() {
        let addr = fake_server(vec![
            (b"*1\r\n$4\r\nINFO\r\n".to_vec(), b"+PONG\r\n".to_vec()),
            (b"*1\r\n$4\r\nPING\r\n".to_vec(), b"+PONG\r\n".to_vec()),
        ]);
        let opts = Opts {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..Opts::default()
        };
        let engine = Engine::connect(opts).unwrap();
        let reply = engine.execute_raw(Command::new("PING")).unwrap();
        let got = engine.wait(&reply).unwrap();
        assert_eq!(got, Reply::Status(b"PONG".to_vec()));
    }
}
