//! Redis client implementation with connection management

use crate::Result;
use redis::{aio::ConnectionManager, AsyncCommands};

/// Redis client with automatic reconnection
///
/// Cloning is cheap: every clone shares the same multiplexed connection.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
}

impl RedisClient {
    /// Connect to Redis server
    ///
    /// Supports both redis:// and rediss:// (TLS) URLs
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }

    // ============================================================================
    // Key-Value Operations
    // ============================================================================

    /// GET - Get value by key
    pub async fn get<T: redis::FromRedisValue>(&mut self, key: &str) -> Result<Option<T>> {
        self.conn.get(key).await
    }

    /// DEL - Delete one or more keys
    pub async fn del<K>(&mut self, keys: K) -> Result<i64>
    where
        K: redis::ToRedisArgs + Send + Sync,
    {
        self.conn.del(keys).await
    }

    /// PTTL - Remaining time to live in milliseconds (-2 missing, -1 no expiry)
    pub async fn pttl(&mut self, key: &str) -> Result<i64> {
        self.conn.pttl(key).await
    }

    /// SET key value NX PX millis
    ///
    /// Returns `true` when the key was created, `false` when it already existed.
    pub async fn set_nx_px(&mut self, key: &str, value: &str, millis: u64) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.is_some())
    }

    // ============================================================================
    // Lua Scripts
    // ============================================================================

    /// Execute Lua script
    /// Note: For complex scripts, consider using redis::Script directly
    pub fn create_script(code: &str) -> redis::Script {
        redis::Script::new(code)
    }

    /// Run a script with one key and string arguments, returning an integer reply
    pub async fn eval_int(
        &mut self,
        script: &redis::Script,
        key: &str,
        args: &[&str],
    ) -> Result<i64> {
        let mut invocation = script.key(key);
        for arg in args {
            invocation.arg(*arg);
        }
        invocation.invoke_async(&mut self.conn).await
    }
}
