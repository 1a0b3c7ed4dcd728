use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::protocol::TraceFields;
use crate::util::now_millis;

/// Which side of a call emitted a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRole {
    Client,
    Server,
}

impl fmt::Display for TraceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceRole::Client => f.write_str("client"),
            TraceRole::Server => f.write_str("server"),
        }
    }
}

/// Structured log correlator for one RPC call.
///
/// A tracer is created by the client when `rpc_debug_log` is on, travels
/// inside the request envelope as [`TraceFields`], and is continued by the
/// server so that every step of a call shares one trace id with an
/// increasing sequence number. Clones share the sequence counter.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    id: String,
    seq: AtomicU64,
    source: String,
    remote: String,
    msg: Value,
}

impl Tracer {
    /// Starts a new trace with a fresh UUID v4 id.
    pub fn new(source: impl Into<String>, remote: impl Into<String>, msg: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), 1, source, remote, msg)
    }

    pub fn with_id(
        id: impl Into<String>,
        seq: u64,
        source: impl Into<String>,
        remote: impl Into<String>,
        msg: Value,
    ) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                id: id.into(),
                seq: AtomicU64::new(seq),
                source: source.into(),
                remote: remote.into(),
                msg,
            }),
        }
    }

    /// Continues a trace received on the wire. Returns `None` when the
    /// envelope carried no trace id.
    pub fn from_fields(fields: &TraceFields, msg: Value) -> Option<Self> {
        let id = fields.trace_id.clone()?;
        Some(Self::with_id(
            id,
            fields.seq_id.unwrap_or(1),
            fields.source.clone().unwrap_or_default(),
            fields.remote.clone().unwrap_or_default(),
            msg,
        ))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// Fields to embed in an outgoing envelope.
    pub fn fields(&self) -> TraceFields {
        TraceFields {
            trace_id: Some(self.inner.id.clone()),
            seq_id: Some(self.seq()),
            source: Some(self.inner.source.clone()),
            remote: Some(self.inner.remote.clone()),
        }
    }

    /// Builds one trace record and advances the sequence.
    pub fn record(&self, role: TraceRole, method: &str, description: &str) -> Value {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        json!({
            "traceId": self.inner.id,
            "seq": seq,
            "role": role.to_string(),
            "source": self.inner.source,
            "remote": self.inner.remote,
            "method": method,
            "msg": self.inner.msg,
            "timestamp": now_millis(),
            "description": description,
        })
    }

    pub fn info(&self, role: TraceRole, method: &str, description: &str) {
        info!(target: "courier::trace", "{}", self.record(role, method, description));
    }

    pub fn debug(&self, role: TraceRole, method: &str, description: &str) {
        debug!(target: "courier::trace", "{}", self.record(role, method, description));
    }

    pub fn error(&self, role: TraceRole, method: &str, description: &str) {
        error!(target: "courier::trace", "{}", self.record(role, method, description));
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("id", &self.inner.id)
            .field("seq", &self.seq())
            .finish()
    }
}
