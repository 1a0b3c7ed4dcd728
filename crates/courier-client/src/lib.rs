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

//! # Courier Client
//!
//! Calls services on remote courier servers.
//!
//! - [`Client`]: `rpc_invoke` by server id, `rpc_invoke_by_route` by server type
//! - [`Mailstation`]: registry subscription, one mailbox per server, the
//!   queue of calls waiting for a connection
//! - [`Mailbox`] / [`TcpMailbox`]: one framed TCP link with request
//!   correlation, timeouts, optional batching and keepalive
//! - [`router`]: default (CRC32 of a seed), random and round-robin selection

pub mod client;
pub mod mailbox;
pub mod mailstation;
pub mod router;

pub use client::{Client, ClientState};
pub use mailbox::{
    Mailbox, MailboxContext, MailboxEvent, MailboxEvents, MailboxFactory, TcpMailbox, TcpMailboxFactory,
};
pub use mailstation::{Mailstation, StationEvent, StationState};
pub use router::{CustomRoute, RouteContext, Router};
