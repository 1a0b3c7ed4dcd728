//! Courier wire protocol types.
//!
//! A call travels as a JSON request envelope and comes back as a response
//! envelope correlated by the request id:
//!
//! ```text
//! request:  {"id": 7, "msg": {"service": "plus", "args": [1, 2]}}
//! response: {"id": 7, "msg": 3}
//! error:    {"id": 7, "msg": null, "error": {"message": "...", "code": "SERVICE_NOT_FOUND"}}
//! ```
//!
//! With debug tracing enabled both envelopes also carry
//! `traceId`, `seqId`, `source` and `remote`. A frame may hold a JSON array
//! of envelopes instead of a single one when buffering is enabled.

pub mod envelope;

pub use envelope::{Batch, RequestEnvelope, ResponseEnvelope, RpcMessage, TraceFields};
