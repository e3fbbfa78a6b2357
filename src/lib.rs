//! A pipelined client connection for line-oriented request/reply
//! key-value servers speaking a RESP-family protocol.
//!
//! # Features
//!
//! - **Pipelined multiplexing**: many callers share one full-duplex TCP
//!   connection, with strict FIFO reply matching
//! - **Thread-based, not async**: a dedicated reader thread plus a small
//!   worker pool for completion dispatch
//! - **Database-context tracking**: per-command `db` targeting with
//!   synthetic `SELECT` injection and invalidation
//! - **Transactions**: `MULTI`/`EXEC` with `WATCH` preconditions, submitted
//!   as one atomic wire batch
//!
//! # Example
//!
//! ```no_run
//! use respipe::{Command, Engine, Opts};
//!
//! fn main() -> respipe::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let engine = Engine::connect(opts)?;
//!     let reply = engine.execute_bytes(Command::new("GET").arg("key"))?;
//!     let value = engine.wait(&reply)?;
//!     println!("value: {:?}", value);
//!
//!     engine.close(false)?;
//!     Ok(())
//! }
//! ```

// private
mod buffer_pool;
mod error;
mod opts;
mod pending;
mod stats;
mod workers;

pub mod state;

// pub
pub mod engine;
pub mod handshake;
pub mod message;
pub mod protocol;
pub mod transaction;

pub use engine::{ClosedCallback, Engine, ErrorCallback, ErrorEvent};
pub use error::{Error, Result, ServerError};
pub use handshake::{ServerInfo, ServerType};
pub use message::{Command, Completion, Flags, Sink};
pub use opts::Opts;
pub use protocol::Reply;
pub use stats::StatsSnapshot;
pub use state::ConnectionState;
pub use transaction::Transaction;
