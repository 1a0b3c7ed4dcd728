//! Courier Transport Layer
//!
//! Framing and TCP plumbing shared by mailboxes and acceptors.
//!
//! # Architecture
//!
//! - **Transport**: one persistent TCP connection per client/server pair
//! - **Codec**: JSON envelopes, single object or batch array
//! - **Wire Format**: `[4-byte length as u32 big-endian] + [1-byte kind] + [payload]`
//!
//! # Components
//!
//! - **[`Frame`]** / **[`FrameKind`]**: publish, ping request and ping response frames
//! - **[`JsonCodec`]**: encode/decode request and response envelopes
//! - **[`TcpTransport`]**: async connect, frame send and frame receive
//!
//! # Message Size Limits
//!
//! Frames larger than 100 MB are rejected on both encode and receive.

pub mod codec;
pub mod tcp;

pub use codec::{Frame, FrameKind, InvalidRequest, JsonCodec, MAX_FRAME_SIZE};
pub use tcp::TcpTransport;
