use crate::config::{LimiterConfig, RedisConfig};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// One entry read from a request stream: the store-assigned id and the
/// serialized payload field.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Typed adapter over the shared KV store.
///
/// Plain commands go through a multiplexed [`ConnectionManager`] (cheaply
/// cloneable, reconnects on its own). Blocking stream reads and optimistic
/// transactions need exclusive use of a connection, so those callers obtain
/// a dedicated connection via [`KvStore::dedicated`] / [`KvStore::txn`].
///
/// Cluster-redirect errors (key slots moved between shards) are retried a
/// bounded number of times with a fixed delay; all other errors surface to
/// the caller immediately.
#[derive(Clone)]
pub struct KvStore {
    client: redis::Client,
    conn: ConnectionManager,
    max_retries: u32,
    retry_delay: Duration,
}

impl KvStore {
    pub async fn connect(redis_cfg: &RedisConfig, limiter_cfg: &LimiterConfig) -> RedisResult<Self> {
        let client = redis::Client::open(redis_cfg.connection_url())?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            max_retries: limiter_cfg.max_retries,
            retry_delay: Duration::from_secs(limiter_cfg.retry_delay_secs),
        })
    }

    /// A fresh connection for exclusive use (blocking reads).
    pub async fn dedicated(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Begin an optimistic transaction on a dedicated connection.
    pub async fn txn(&self) -> RedisResult<Txn> {
        Ok(Txn {
            conn: self.dedicated().await?,
        })
    }

    /// Run `op` against a cloned manager connection, retrying bounded on
    /// cluster redirects.
    async fn with_retry<T, F, Fut>(&self, op: F) -> RedisResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(self.conn.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if is_cluster_redirect(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "store: cluster redirect, retrying, attempt={}/{}, error={}",
                        attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // --- strings / counters ---

    pub async fn get_string(&self, key: &str) -> RedisResult<Option<String>> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.get(&key).await }
        })
        .await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> RedisResult<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let value = value.to_string();
            async move { conn.set_ex(&key, &value, ttl_secs).await }
        })
        .await
    }

    pub async fn incr(&self, key: &str) -> RedisResult<i64> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.incr(&key, 1i64).await }
        })
        .await
    }

    // --- hashes ---

    pub async fn hgetall(&self, key: &str) -> RedisResult<HashMap<String, String>> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.hgetall(&key).await }
        })
        .await
    }

    // --- sets (node-id pool) ---

    pub async fn sadd(&self, key: &str, member: &str) -> RedisResult<()> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sadd(&key, &member).await }
        })
        .await
    }

    pub async fn spop(&self, key: &str) -> RedisResult<Option<String>> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.spop(&key).await }
        })
        .await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> RedisResult<bool> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sismember(&key, &member).await }
        })
        .await
    }

    /// Set a key's TTL without touching its value.
    pub async fn expire(&self, key: &str, ttl_secs: i64) -> RedisResult<bool> {
        self.with_retry(|mut conn| {
            let key = key.to_string();
            async move { conn.expire(&key, ttl_secs).await }
        })
        .await
    }

    // --- streams ---

    pub async fn xadd(&self, stream: &str, field: &str, payload: &str) -> RedisResult<String> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            let field = field.to_string();
            let payload = payload.to_string();
            async move { conn.xadd(&stream, "*", &[(&field, &payload)]).await }
        })
        .await
    }

    /// Create the consumer group with cursor `0` and MKSTREAM. A group that
    /// already exists is not an error.
    pub async fn xgroup_create(&self, stream: &str, group: &str) -> RedisResult<()> {
        let result: RedisResult<()> = self
            .with_retry(|mut conn| {
                let stream = stream.to_string();
                let group = group.to_string();
                async move { conn.xgroup_create_mkstream(&stream, &group, "0").await }
            })
            .await;
        match result {
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            other => other,
        }
    }

    /// Blocking group read on a dedicated connection. Returns the entries
    /// delivered to `consumer`, oldest first; empty when the block timed out.
    #[allow(clippy::too_many_arguments)]
    pub async fn xread_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        group: &str,
        consumer: &str,
        field: &str,
        count: usize,
        block: Duration,
    ) -> RedisResult<Vec<StreamEntry>> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                if let Some(payload) = id.get::<String>(field) {
                    entries.push(StreamEntry { id: id.id, payload });
                }
            }
        }
        Ok(entries)
    }

    pub async fn xack(&self, stream: &str, group: &str, id: &str) -> RedisResult<()> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            let group = group.to_string();
            let id = id.to_string();
            async move {
                let _: i64 = conn.xack(&stream, &group, &[&id]).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn xlen(&self, stream: &str) -> RedisResult<u64> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            async move { conn.xlen(&stream).await }
        })
        .await
    }

    /// Minimum entry id still pending in the group, if any.
    pub async fn xpending_min_id(&self, stream: &str, group: &str) -> RedisResult<Option<String>> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            let group = group.to_string();
            async move {
                let reply: StreamPendingReply = conn.xpending(&stream, &group).await?;
                Ok(match reply {
                    StreamPendingReply::Data(data) if data.count > 0 => Some(data.start_id),
                    _ => None,
                })
            }
        })
        .await
    }

    /// Drop all entries with an id lower than `min_id`.
    pub async fn xtrim_min_id(&self, stream: &str, min_id: &str) -> RedisResult<u64> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            let min_id = min_id.to_string();
            async move {
                redis::cmd("XTRIM")
                    .arg(&stream)
                    .arg("MINID")
                    .arg(&min_id)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    /// Trim the stream down to approximately `max_len` entries.
    pub async fn xtrim_max_len(&self, stream: &str, max_len: u64) -> RedisResult<u64> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            async move {
                redis::cmd("XTRIM")
                    .arg(&stream)
                    .arg("MAXLEN")
                    .arg(max_len)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    /// Remove a consumer from the group. Its still-pending entries become
    /// ownerless within the group.
    pub async fn xgroup_del_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> RedisResult<()> {
        self.with_retry(|mut conn| {
            let stream = stream.to_string();
            let group = group.to_string();
            let consumer = consumer.to_string();
            async move {
                let _: i64 = redis::cmd("XGROUP")
                    .arg("DELCONSUMER")
                    .arg(&stream)
                    .arg(&group)
                    .arg(&consumer)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
    }
}

/// Errors raised while a cluster reshuffles key slots. The data usually
/// lands somewhere reachable, so these are worth a bounded retry.
fn is_cluster_redirect(e: &redis::RedisError) -> bool {
    matches!(
        e.kind(),
        redis::ErrorKind::Moved
            | redis::ErrorKind::Ask
            | redis::ErrorKind::TryAgain
            | redis::ErrorKind::ClusterDown
    )
}

/// One optimistic transaction: WATCH a key set, read, then commit an atomic
/// batch that only applies if none of the watched keys changed in between.
///
/// The connection is dedicated to this transaction, so no other task can
/// interleave commands and silently break the WATCH. Reads that should
/// invalidate the commit must happen after [`Txn::watch`]; mutations made
/// outside the final pipeline (e.g. pruning expired log entries) must
/// happen before it, since a watched key touched by its own connection also
/// aborts the commit.
pub struct Txn {
    conn: MultiplexedConnection,
}

impl Txn {
    pub async fn watch(&mut self, keys: &[&str]) -> RedisResult<()> {
        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(*key);
        }
        let _: () = cmd.query_async(&mut self.conn).await?;
        Ok(())
    }

    /// Release the watch without committing (the deny path).
    pub async fn unwatch(&mut self) -> RedisResult<()> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }

    pub async fn get_u64(&mut self, key: &str) -> RedisResult<Option<u64>> {
        self.conn.get(key).await
    }

    pub async fn hgetall(&mut self, key: &str) -> RedisResult<HashMap<String, String>> {
        self.conn.hgetall(key).await
    }

    pub async fn zcard(&mut self, key: &str) -> RedisResult<u64> {
        self.conn.zcard(key).await
    }

    /// Remove sorted-set members with a score strictly below `bound`.
    pub async fn zrem_range_below(&mut self, key: &str, bound: u64) -> RedisResult<u64> {
        self.conn
            .zrembyscore(key, "-inf", format!("({}", bound))
            .await
    }

    /// Commit the batch. Returns `false` when a watched key changed and the
    /// store discarded the transaction — the caller decides and retries.
    pub async fn exec(&mut self, pipe: &redis::Pipeline) -> RedisResult<bool> {
        let reply: Option<redis::Value> = pipe.query_async(&mut self.conn).await?;
        Ok(reply.is_some())
    }
}
