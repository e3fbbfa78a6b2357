//! The `unsent`/`sent` queues and the pending-reply matcher.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::message::{substitute_expected, Message};
use crate::protocol::Reply;
use crate::workers::WorkerPool;

/// Messages waiting to be written (`unsent`) and messages written but not
/// yet replied to (`sent`), each behind its own lock, with `sent` additionally
/// signalled by a `Condvar` for drain-to-empty waits (used by `close()`'s
/// graceful `QUIT` wait and by tests).
pub struct PendingQueues {
    unsent: Mutex<VecDeque<Arc<Message>>>,
    sent: Mutex<VecDeque<Arc<Message>>>,
    sent_drained: Condvar,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self {
            unsent: Mutex::new(VecDeque::new()),
            sent: Mutex::new(VecDeque::new()),
            sent_drained: Condvar::new(),
        }
    }

    pub fn push_unsent(&self, msg: Arc<Message>) {
        self.unsent.lock().unwrap_or_else(|p| p.into_inner()).push_back(msg);
    }

    pub fn push_unsent_batch(&self, msgs: Vec<Arc<Message>>) {
        self.unsent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(msgs);
    }

    pub fn pop_unsent(&self) -> Option<Arc<Message>> {
        self.unsent.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn drain_unsent(&self) -> Vec<Arc<Message>> {
        self.unsent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect()
    }

    pub fn record_sent(&self, msg: Arc<Message>) {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push_back(msg);
    }

    pub fn pop_sent(&self) -> Option<Arc<Message>> {
        let mut guard = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let popped = guard.pop_front();
        if guard.is_empty() {
            self.sent_drained.notify_all();
        }
        popped
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn oldest_sent_summary(&self) -> Option<String> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .front()
            .map(|m| m.summary())
    }

    /// Blocks until `sent` is empty or `timeout` elapses. Returns whether it
    /// drained in time.
    pub fn wait_sent_drained(&self, timeout: Duration) -> bool {
        let guard = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_empty() {
            return true;
        }
        let (guard, result) = self
            .sent_drained
            .wait_timeout_while(guard, timeout, |q| !q.is_empty())
            .unwrap_or_else(|p| p.into_inner());
        guard.is_empty() || !result.timed_out()
    }

    pub fn drain_sent(&self) -> Vec<Arc<Message>> {
        let mut guard = self.sent.lock().unwrap_or_else(|p| p.into_inner());
        let drained = guard.drain(..).collect();
        self.sent_drained.notify_all();
        drained
    }
}

impl Default for PendingQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Matches a popped `sent` entry against its decoded reply, dispatches
/// completion onto the worker pool, and reports whether this was a
/// `must_succeed` message whose failure should tear down the connection.
pub fn dispatch_reply(msg: Arc<Message>, reply: Reply, workers: &WorkerPool) -> Option<Error> {
    let substituted = substitute_expected(&msg, reply);
    let fatal = match &substituted {
        Reply::Error(text) if msg.flags.must_succeed => Some(Error::Protocol(format!(
            "must-succeed command `{}` failed: {text}",
            msg.summary()
        ))),
        _ => None,
    };
    workers.dispatch(move || msg.complete_with(substituted));
    fatal
}
