// Copyright 2025 Courier Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Courier Common Types and Transport
//!
//! Shared building blocks for the courier RPC and service-discovery layer:
//!
//! - **Protocol**: request/response envelopes and batches ([`protocol`])
//! - **Transport**: framed TCP links ([`transport`])
//! - **Errors**: the error kinds every courier operation can surface ([`error`])
//! - **Server identity**: [`ServerInfo`] and [`ServerMap`]
//! - **Configuration**: serde-driven config for registries, clients and servers ([`config`])
//! - **Tracing**: cross-process call correlation ([`tracer`])
//!
//! # Wire format
//!
//! - **Transport**: one persistent TCP connection per client/server pair
//! - **Serialization**: JSON
//! - **Frame**: `[4-byte length as u32 big-endian] + [1-byte kind] + [payload]`
//! - **Max Frame Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use courier_common::{RequestEnvelope, ResponseEnvelope, RpcMessage};
//! use serde_json::json;
//!
//! let request = RequestEnvelope::new(1, RpcMessage::new("plus", vec![json!(1), json!(2)]));
//! let response = ResponseEnvelope::success(request.id, json!(3));
//! assert_eq!(response.into_result().unwrap(), json!(3));
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server_info;
pub mod tracer;
pub mod transport;
pub mod util;

pub use error::{codes, Result, RpcError, WireError};
pub use protocol::*;
pub use server_info::{ServerInfo, ServerMap, DEFAULT_PORT, WILDCARD_SERVER_TYPE};
pub use tracer::{TraceRole, Tracer};
