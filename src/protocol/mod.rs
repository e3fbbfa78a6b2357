//! RESP wire protocol: encode/decode primitives and the reply type.

pub mod codec;
pub mod reply;

pub use codec::{encode_command, write_frame, FrameReader};
pub use reply::Reply;
