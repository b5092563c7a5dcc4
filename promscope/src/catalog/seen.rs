//! The TTL'd seen-set suppressing redundant catalog upserts.
//!
//! The external variant survives restarts and is shared across replicas;
//! its failures are best-effort and never block the write path.

use crate::settings::SeenStoreSettings;
use crate::BootstrapResult;
use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::time::Duration;

/// Seen-set store error.
#[derive(Debug, thiserror::Error)]
#[error("seen store error: {0}")]
pub struct SeenStoreError(#[from] redis::RedisError);

/// External membership store for flushed metric names.
#[async_trait]
pub trait SeenStore: Send + Sync {
    /// Returns the subset of `names` currently marked seen.
    async fn filter_seen(&self, names: &[String]) -> Result<HashSet<String>, SeenStoreError>;

    /// Marks `names` seen for `ttl`.
    async fn mark_seen(&self, names: &[String], ttl: Duration) -> Result<(), SeenStoreError>;
}

/// Redis-backed seen-set.
pub struct RedisSeenStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisSeenStore {
    pub async fn connect(settings: &SeenStoreSettings) -> BootstrapResult<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .context("invalid seen-store URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to the seen store")?;

        Ok(Self {
            conn,
            key_prefix: settings.key_prefix.clone(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[async_trait]
impl SeenStore for RedisSeenStore {
    async fn filter_seen(&self, names: &[String]) -> Result<HashSet<String>, SeenStoreError> {
        if names.is_empty() {
            return Ok(HashSet::new());
        }

        let keys: Vec<String> = names.iter().map(|n| self.key(n)).collect();
        let mut conn = self.conn.clone();

        let values: Vec<Option<String>> = conn.mget(&keys).await?;

        Ok(names
            .iter()
            .zip(values)
            .filter(|(_, value)| value.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn mark_seen(&self, names: &[String], ttl: Duration) -> Result<(), SeenStoreError> {
        if names.is_empty() {
            return Ok(());
        }

        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut pipe = redis::pipe();

        for name in names {
            pipe.cmd("SET")
                .arg(self.key(name))
                .arg(1)
                .arg("PX")
                .arg(ttl_ms)
                .ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }
}
