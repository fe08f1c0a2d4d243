//! Shared out-of-process tier.
//!
//! The store only sees opaque bytes under a namespaced key; entry encoding
//! and TTL checks on read are the hierarchy's job.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::error::CacheError;

/// Key-value store behind L2.
#[async_trait]
pub trait L2Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value`; `None` TTL keeps it until deleted.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Short label for logs and health reports.
    fn name(&self) -> &str {
        "l2"
    }
}

/// Process-local L2, used by tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryL2 {
    records: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl InMemoryL2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Overwrite raw bytes, bypassing encoding. Handy for corrupting entries in tests.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.records.insert(key.to_string(), (value, None));
    }
}

#[async_trait]
impl L2Store for InMemoryL2 {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let expired = match self.records.get(key) {
            Some(record) => match record.1 {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Ok(Some(record.0.clone())),
            },
            None => return Ok(None),
        };
        if expired {
            self.records.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.records.insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.records.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisL2;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;
    use redis::AsyncCommands;
    use tokio::sync::OnceCell;

    /// Redis-backed L2 over one multiplexed async connection.
    pub struct RedisL2 {
        client: redis::Client,
        connection: OnceCell<redis::aio::MultiplexedConnection>,
    }

    impl RedisL2 {
        pub fn new(client: redis::Client) -> Self {
            Self {
                client,
                connection: OnceCell::new(),
            }
        }

        pub fn from_url(url: &str) -> Result<Self, CacheError> {
            let client = redis::Client::open(url).map_err(|e| CacheError::unavailable("redis", e))?;
            Ok(Self::new(client))
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
            self.connection
                .get_or_try_init(|| async {
                    self.client
                        .get_multiplexed_async_connection()
                        .await
                        .map_err(|e| CacheError::unavailable("redis", e))
                })
                .await
                .cloned()
        }
    }

    #[async_trait]
    impl L2Store for RedisL2 {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            let mut con = self.connection().await?;
            con.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| CacheError::unavailable("redis", format!("GET failed: {e}")))
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: Vec<u8>,
            ttl: Option<Duration>,
        ) -> Result<(), CacheError> {
            let mut con = self.connection().await?;
            let result = match ttl {
                Some(ttl) => {
                    let millis = (ttl.as_millis() as u64).max(1);
                    con.pset_ex::<_, _, ()>(key, value, millis).await
                }
                None => con.set::<_, _, ()>(key, value).await,
            };
            result.map_err(|e| CacheError::unavailable("redis", format!("SET failed: {e}")))
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            let mut con = self.connection().await?;
            con.del::<_, ()>(key)
                .await
                .map_err(|e| CacheError::unavailable("redis", format!("DEL failed: {e}")))
        }

        fn name(&self) -> &str {
            "redis"
        }
    }
}
