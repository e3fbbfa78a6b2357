//! RESP reply representation.

/// A decoded RESP reply.
///
/// `Pass` and `Cancelled` are synthetic: they never appear on the wire.
/// `Pass` substitutes for a `Status` reply that matched a message's
/// `expected` literal; `Cancelled` is injected when a message never gets a
/// real reply (shutdown, transaction abort, explicit cancellation).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(Vec<u8>),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
    Pass,
    Cancelled,
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}
