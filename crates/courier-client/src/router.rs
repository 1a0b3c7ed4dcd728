//! Server selection for `rpc_invoke_by_route`.
//!
//! Routers pick one server id out of a candidate list. They never check
//! liveness and never retry; an empty candidate list fails with
//! `NoServerFound`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand::Rng;
use serde_json::Value;

use courier_common::config::RouteKind;
use courier_common::{Result, RpcError};

/// What a call is about, handed to custom routers.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub server_type: &'a str,
    pub service: &'a str,
    pub args: &'a [Value],
}

fn no_server(ctx: &RouteContext<'_>) -> RpcError {
    RpcError::NoServerFound(format!(
        "cannot find server info by type: {}",
        ctx.server_type
    ))
}

/// IEEE CRC32 of `seed` (or of a random value) modulo the candidate count.
///
/// The same seed always lands on the same server while the candidate list
/// is unchanged, which gives sticky routing by room id and the like.
pub fn default_route<'s>(
    servers: &'s [String],
    ctx: &RouteContext<'_>,
    seed: Option<&str>,
) -> Result<&'s String> {
    if servers.is_empty() {
        return Err(no_server(ctx));
    }
    let hash = match seed {
        Some(seed) => crc32fast::hash(seed.as_bytes()),
        None => rand::thread_rng().gen::<u32>(),
    };
    Ok(&servers[hash as usize % servers.len()])
}

/// Uniformly random candidate.
pub fn random_route<'s>(servers: &'s [String], ctx: &RouteContext<'_>) -> Result<&'s String> {
    if servers.is_empty() {
        return Err(no_server(ctx));
    }
    Ok(&servers[rand::thread_rng().gen_range(0..servers.len())])
}

/// Per server type counters for round-robin routing.
///
/// Each counter is an unsigned integer that wraps on overflow; the chosen
/// index is the counter modulo the candidate count.
#[derive(Debug, Default)]
pub struct RoundRobinCounters {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<'s>(&self, servers: &'s [String], ctx: &RouteContext<'_>) -> Result<&'s String> {
        if servers.is_empty() {
            return Err(no_server(ctx));
        }
        let mut counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let counter = counters.entry(ctx.server_type.to_string()).or_insert(0);
        let index = *counter % servers.len();
        *counter = counter.wrapping_add(1);
        Ok(&servers[index])
    }

    #[cfg(test)]
    fn set(&self, server_type: &str, value: usize) {
        self.counters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(server_type.to_string(), value);
    }
}

/// User supplied routing function.
pub type CustomRoute =
    Arc<dyn Fn(&[String], &RouteContext<'_>, Option<&str>) -> Result<String> + Send + Sync>;

/// A configured router.
#[derive(Clone)]
pub enum Router {
    Default,
    Random,
    RoundRobin(Arc<RoundRobinCounters>),
    Custom(CustomRoute),
}

impl Router {
    pub fn from_kind(kind: RouteKind) -> Self {
        match kind {
            RouteKind::Default => Router::Default,
            RouteKind::Random => Router::Random,
            RouteKind::RoundRobin => Router::RoundRobin(Arc::new(RoundRobinCounters::new())),
        }
    }

    pub fn route(&self, servers: &[String], ctx: &RouteContext<'_>, seed: Option<&str>) -> Result<String> {
        match self {
            Router::Default => default_route(servers, ctx, seed).cloned(),
            Router::Random => random_route(servers, ctx).cloned(),
            Router::RoundRobin(counters) => counters.route(servers, ctx).cloned(),
            Router::Custom(route) => {
                if servers.is_empty() {
                    return Err(no_server(ctx));
                }
                route(servers, ctx, seed)
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Router::Default => f.write_str("Router::Default"),
            Router::Random => f.write_str("Router::Random"),
            Router::RoundRobin(_) => f.write_str("Router::RoundRobin"),
            Router::Custom(_) => f.write_str("Router::Custom"),
        }
    }
}
