//! [`RemoteCache`] over Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use courier_common::{Result, RpcError};

use super::cache::RemoteCache;

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

fn map_error(e: redis::RedisError) -> RpcError {
    RpcError::Registry(format!("redis: {}", e))
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(map_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_error)?;
        info!(url, "connected to redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let found: bool = self.conn().exists(key).await.map_err(map_error)?;
        Ok(found)
    }

    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<String>> {
        let mut cmd = redis::cmd(if ttl.is_some() { "GETEX" } else { "GET" });
        cmd.arg(key);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let value: Option<String> = cmd.query_async(&mut self.conn()).await.map_err(map_error)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut self.conn()).await.map_err(map_error)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut self.conn()).await.map_err(map_error)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let _: i64 = self.conn().del(key).await.map_err(map_error)?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.conn().sadd(key, member).await.map_err(map_error)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let members: Vec<String> = self.conn().smembers(key).await.map_err(map_error)?;
        Ok(members)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.conn().srem(key, member).await.map_err(map_error)?;
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let n: usize = self.conn().scard(key).await.map_err(map_error)?;
        Ok(n)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self.conn().hset(key, field, value).await.map_err(map_error)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().hget(key, field).await.map_err(map_error)?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let _: i64 = self.conn().hdel(key, field).await.map_err(map_error)?;
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let n: usize = self.conn().hlen(key).await.map_err(map_error)?;
        Ok(n)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let n: i64 = self.conn().incr(key, 1).await.map_err(map_error)?;
        Ok(n)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let n: i64 = self.conn().decr(key, 1).await.map_err(map_error)?;
        Ok(n)
    }
}
