// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use typing_sync_engine::config::PrimaryStoreConfig;

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis primary store running in a container.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
    pub config: PrimaryStoreConfig,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        let config = PrimaryStoreConfig::for_testing(&url);
        Self {
            container,
            url,
            config,
        }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Length of the change stream.
    pub async fn stream_len(&self) -> redis::RedisResult<usize> {
        let mut conn = self.conn().await?;
        conn.xlen(self.config.change_stream_key()).await
    }

    /// Trim the change stream to its newest `keep` entries.
    pub async fn trim_stream(&self, keep: usize) -> redis::RedisResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("XTRIM")
            .arg(self.config.change_stream_key())
            .arg("MAXLEN")
            .arg(keep)
            .query_async(&mut conn)
            .await
    }

    /// Append a raw change entry, as a misbehaving writer would.
    pub async fn add_raw_entry(&self, fields: &[(&str, &[u8])]) -> redis::RedisResult<String> {
        let mut conn = self.conn().await?;
        conn.xadd(self.config.change_stream_key(), "*", fields).await
    }

    /// TTL of a stored record hash, in seconds.
    pub async fn record_ttl(&self, key: &str) -> redis::RedisResult<i64> {
        let mut conn = self.conn().await?;
        conn.ttl(self.config.record_key(key)).await
    }

    /// Backdate a record's last write and drop its hash, as retention would.
    pub async fn expire_record(&self, key: &str, written_ms: i64) -> redis::RedisResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(self.config.write_index_key(), key, written_ms).await?;
        conn.del(self.config.record_key(key)).await
    }

    /// Whether `key` is still in the event-time index.
    pub async fn is_indexed(&self, key: &str) -> redis::RedisResult<bool> {
        let mut conn = self.conn().await?;
        let score: Option<f64> = conn.zscore(self.config.timestamp_index_key(), key).await?;
        Ok(score.is_some())
    }
}
