use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RpcError, WireError};

/// The payload of a call: which service to run and with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub service: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcMessage {
    pub fn new(service: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            service: service.into(),
            args,
        }
    }
}

/// Cross-process causal logging fields, only present when debug tracing is on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl TraceFields {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none()
    }
}

/// Request envelope: `{id, msg: {service, args}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub msg: RpcMessage,
    #[serde(flatten)]
    pub trace: TraceFields,
}

impl RequestEnvelope {
    pub fn new(id: u64, msg: RpcMessage) -> Self {
        Self {
            id,
            msg,
            trace: TraceFields::default(),
        }
    }

    pub fn with_trace(mut self, trace: TraceFields) -> Self {
        self.trace = trace;
        self
    }
}

/// Response envelope: `{id, msg: result, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(default)]
    pub msg: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(flatten)]
    pub trace: TraceFields,
}

impl ResponseEnvelope {
    /// Creates a successful response correlated to `id`.
    pub fn success(id: u64, msg: Value) -> Self {
        Self {
            id,
            msg,
            error: None,
            trace: TraceFields::default(),
        }
    }

    /// Creates an error response correlated to `id`.
    pub fn failure(id: u64, error: &RpcError) -> Self {
        Self {
            id,
            msg: Value::Null,
            error: Some(error.to_wire()),
            trace: TraceFields::default(),
        }
    }

    /// Builds a response from the outcome of a service call.
    pub fn from_result(id: u64, result: &std::result::Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value.clone()),
            Err(e) => Self::failure(id, e),
        }
    }

    pub fn with_trace(mut self, trace: TraceFields) -> Self {
        self.trace = trace;
        self
    }

    /// Turns the envelope into the caller-facing outcome.
    pub fn into_result(self) -> std::result::Result<Value, RpcError> {
        match self.error {
            Some(wire) => Err(RpcError::from_wire(wire)),
            None => Ok(self.msg),
        }
    }
}

/// A frame payload holds either a single envelope or a batch array of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Batch<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Batch<T> {
    /// Wraps `items`, emitting a bare object when there is exactly one.
    pub fn from_vec(mut items: Vec<T>) -> Self {
        if items.len() == 1 {
            if let Some(item) = items.pop() {
                return Batch::One(item);
            }
        }
        Batch::Many(items)
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Batch::Many(items) => items,
            Batch::One(item) => vec![item],
        }
    }
}
