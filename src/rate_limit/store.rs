use redis::AsyncCommands;

use super::{CounterStore, RateStoreError};

/// Counter store over a shared redis deployment. Buckets from every
/// gateway instance land in the same keyspace, so the windows line up
/// fleet-wide.
#[derive(Clone, Debug)]
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RateStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_ttl(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<(u64, i64), RateStoreError> {
        let mut conn = self.connection().await?;

        // INCR and TTL travel in one atomic round-trip so two gateways
        // racing on the same bucket still observe a total order.
        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .ttl(key)
            .query_async(&mut conn)
            .await?;

        if ttl < 0 {
            // Freshly created bucket: without an expiry it would outlive
            // its window. Set it here so the bucket self-destructs.
            let _: () = conn.expire(key, window_secs as i64).await?;
            return Ok((count, window_secs as i64));
        }

        Ok((count, ttl))
    }

    async fn set_expiry(&self, key: &str, secs: u64) -> Result<(), RateStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.expire(key, secs as i64).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, RateStoreError> {
        let mut conn = self.connection().await?;
        let value: Option<u64> = conn.get(key).await?;
        Ok(value)
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, RateStoreError> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, RateStoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let deleted: u64 = conn.del(keys).await?;
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), RateStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("__firewall_ping__").await?;
        Ok(())
    }
}
