//! # MQ Redis
//!
//! Low-level Redis client used by the consumer engine.
//!
//! ## Design Principles
//!
//! - **No business logic** - Pure infrastructure layer
//! - **No dependencies** on other mq-* crates
//! - **Generic operations** - Used by the lock provider, the streams broker
//!   adapter and the dead-letter publisher alike
//!
//! ## Features
//!
//! - Connection management with automatic reconnection
//! - Key-value operations with millisecond expiry (`SET NX PX`)
//! - Lua scripts
//! - Redis Streams consumer groups (XREADGROUP, XAUTOCLAIM, XPENDING, XACK)
//!
//! ## Example
//!
//! ```rust,no_run
//! use mq_redis::RedisClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = RedisClient::connect("redis://localhost:6379").await?;
//!
//!     let acquired = client.set_nx_px("lock:orders:42", "owner-1", 30_000).await?;
//!     assert!(acquired);
//!
//!     Ok(())
//! }
//! ```

mod client;
mod streams;

pub use client::RedisClient;
pub use streams::StreamEntryBinary;

// Re-export commonly used types
pub use redis::{RedisError, Script};

/// Result type for Redis operations
pub type Result<T> = std::result::Result<T, RedisError>;
