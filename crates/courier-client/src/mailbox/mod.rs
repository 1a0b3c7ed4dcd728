//! Client side links to remote servers.
//!
//! A [`Mailbox`] is one logical connection to one server. It correlates
//! responses to requests by id and bounds every call by the invoke timeout.
//! The [`Mailstation`](crate::Mailstation) owns one mailbox per server id
//! and learns about closed links through [`MailboxEvent`]s.

mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use courier_common::config::MailboxConfig;
use courier_common::{Result, RpcMessage, ServerInfo, Tracer};

pub use tcp::TcpMailbox;

/// Lifecycle notifications a mailbox sends to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The link is gone for good. `serial` tells apart successive mailboxes
    /// created for the same server id.
    Close { server_id: String, serial: u64 },
    Error { server_id: String, message: String },
}

/// Sending side of the owner's mailbox event channel, bound to one mailbox.
#[derive(Debug, Clone)]
pub struct MailboxEvents {
    sender: mpsc::UnboundedSender<MailboxEvent>,
    server_id: String,
    serial: u64,
}

impl MailboxEvents {
    pub fn new(sender: mpsc::UnboundedSender<MailboxEvent>, server_id: impl Into<String>, serial: u64) -> Self {
        Self {
            sender,
            server_id: server_id.into(),
            serial,
        }
    }

    /// Events that go nowhere, for mailboxes used without a station.
    pub fn detached(server_id: impl Into<String>) -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self::new(sender, server_id, 0)
    }

    pub fn close(&self) {
        let _ = self.sender.send(MailboxEvent::Close {
            server_id: self.server_id.clone(),
            serial: self.serial,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.sender.send(MailboxEvent::Error {
            server_id: self.server_id.clone(),
            message: message.into(),
        });
    }
}

/// Everything a factory needs to build a mailbox.
pub struct MailboxContext {
    pub server: ServerInfo,
    pub config: MailboxConfig,
    pub events: MailboxEvents,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    fn server_id(&self) -> &str;

    /// Opens the link. Fails when already connected or closed.
    async fn connect(&self) -> Result<()>;

    /// Queues `msg` for sending and returns the pending reply.
    ///
    /// The request is enqueued before this returns, so calls issued in
    /// order are written in order.
    fn send(&self, msg: RpcMessage, tracer: Option<Tracer>) -> BoxFuture<'static, Result<Value>>;

    /// Closes the link for good. Idempotent.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

pub trait MailboxFactory: Send + Sync {
    fn create(&self, ctx: MailboxContext) -> Arc<dyn Mailbox>;
}

/// Builds [`TcpMailbox`]es.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpMailboxFactory;

impl MailboxFactory for TcpMailboxFactory {
    fn create(&self, ctx: MailboxContext) -> Arc<dyn Mailbox> {
        Arc::new(TcpMailbox::new(ctx))
    }
}
