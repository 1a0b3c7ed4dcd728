use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::protocol::{Batch, RequestEnvelope, ResponseEnvelope};

/// Maximum frame payload size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Size of the frame header: 4-byte length plus 1-byte kind.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Kind byte following the length prefix of every frame.
///
/// Mirrors the three MQTT packets the RPC link needs: a `publish` carrying
/// the JSON envelope, and the `pingreq`/`pingresp` keepalive pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Publish = 0x01,
    PingReq = 0x02,
    PingResp = 0x03,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(FrameKind::Publish),
            0x02 => Ok(FrameKind::PingReq),
            0x03 => Ok(FrameKind::PingResp),
            other => Err(RpcError::InvalidMessage(format!("unknown frame kind 0x{:02x}", other))),
        }
    }
}

/// One boundary-preserving message on a courier link.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn publish(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Publish,
            payload,
        }
    }

    pub fn ping_req() -> Self {
        Self {
            kind: FrameKind::PingReq,
            payload: Vec::new(),
        }
    }

    pub fn ping_resp() -> Self {
        Self {
            kind: FrameKind::PingResp,
            payload: Vec::new(),
        }
    }

    /// Encodes the frame as `[u32 big-endian length][kind][payload]`.
    ///
    /// The length counts the payload only.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_FRAME_SIZE {
            return Err(RpcError::InvalidMessage(format!(
                "Frame too large: {} bytes (max {} bytes)",
                self.payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one complete frame from `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(RpcError::InvalidMessage(format!(
                "Frame header truncated: {} bytes",
                data.len()
            )));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let kind = FrameKind::from_byte(data[4])?;
        let payload = &data[FRAME_HEADER_SIZE..];
        if payload.len() != len {
            return Err(RpcError::InvalidMessage(format!(
                "Frame length mismatch: header says {} bytes, got {}",
                len,
                payload.len()
            )));
        }
        Ok(Self {
            kind,
            payload: payload.to_vec(),
        })
    }
}

/// A batch element that did not decode as a request envelope.
#[derive(Debug)]
pub struct InvalidRequest {
    pub id: Option<u64>,
    pub error: RpcError,
}

/// JSON codec for envelope payloads.
///
/// Encoding a batch of one emits a bare object; decoding accepts either an
/// object or an array.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode outgoing calls
    pub fn encode_requests(requests: Vec<RequestEnvelope>) -> Result<Vec<u8>> {
        Self::encode_batch(requests)
    }

    /// Decode incoming calls
    pub fn decode_requests(data: &[u8]) -> Result<Vec<RequestEnvelope>> {
        Self::decode_batch(data)
    }

    /// Decode incoming calls element by element.
    ///
    /// Only a payload that is not JSON at all fails as a whole. A malformed
    /// element of a batch comes back as an [`InvalidRequest`] carrying the
    /// id it had, if any, so the rest of the batch is still served.
    pub fn decode_request_items(
        data: &[u8],
    ) -> Result<Vec<std::result::Result<RequestEnvelope, InvalidRequest>>> {
        let items: Vec<Value> = Self::decode_batch(data)?;
        Ok(items
            .into_iter()
            .map(|item| {
                let id = item.get("id").and_then(Value::as_u64);
                serde_json::from_value(item).map_err(|e| InvalidRequest {
                    id,
                    error: RpcError::InvalidMessage(e.to_string()),
                })
            })
            .collect())
    }

    /// Encode outgoing responses
    pub fn encode_responses(responses: Vec<ResponseEnvelope>) -> Result<Vec<u8>> {
        Self::encode_batch(responses)
    }

    /// Decode incoming responses
    pub fn decode_responses(data: &[u8]) -> Result<Vec<ResponseEnvelope>> {
        Self::decode_batch(data)
    }

    fn encode_batch<T: Serialize>(items: Vec<T>) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Batch::from_vec(items))?)
    }

    fn decode_batch<T: DeserializeOwned>(data: &[u8]) -> Result<Vec<T>> {
        let batch: Batch<T> = serde_json::from_slice(data)?;
        Ok(batch.into_vec())
    }
}
