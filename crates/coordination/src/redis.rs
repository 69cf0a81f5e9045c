use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{CoordinationError, CoordinationStore, Result};

/// Owner-scoped delete. GET/DEL must be one atomic unit or a lock that
/// expired between the two calls could release someone else's acquisition.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed coordination using a multiplexed `ConnectionManager` for
/// commands and a dedicated connection per subscription.
#[derive(Clone)]
pub struct RedisCoordination {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordination").finish_non_exhaustive()
    }
}

impl RedisCoordination {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CoordinationError::Connection(format!("invalid redis url: {}", e)))?;

        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CoordinationError::Connection(format!("redis connect failed: {}", e)))?;

        debug!("redis coordination connected");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordination {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(owner)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("SET NX failed: {}", e)))?;

        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let released: i32 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("unlock script failed: {}", e)))?;

        if released == 0 {
            debug!(key = key, "unlock skipped, lock no longer held by owner");
        }
        Ok(())
    }

    async fn put_session(&self, key: &str, blob: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(blob)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("SETEX failed: {}", e)))?;
        Ok(())
    }

    async fn get_session(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("GET failed: {}", e)))
    }

    async fn drop_session(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("DEL failed: {}", e)))?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("PUBLISH failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CoordinationError::Connection(format!("pubsub connect failed: {}", e)))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CoordinationError::Backend(format!("SUBSCRIBE failed: {}", e)))?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "dropping undecodable pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "pubsub stream closed");
        });

        Ok(rx)
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.manager.clone();
        matches!(
            redis::cmd("PING").query_async::<String>(&mut conn).await,
            Ok(pong) if pong == "PONG"
        )
    }
}
