use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::{CoordinationStore, Result};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// In-process coordination backend with the same expiry and owner-scoping
/// semantics as the redis one. Single-node only.
#[derive(Default)]
pub struct MemoryCoordination {
    entries: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).map(Entry::live).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry { value: owner.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|e| e.live() && e.value == owner) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn put_session(&self, key: &str, blob: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry { value: blob.to_string(), expires_at: Some(Instant::now() + ttl) },
        );
        Ok(())
    }

    async fn get_session(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).filter(|e| e.live()).map(|e| e.value.clone()))
    }

    async fn drop_session(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _ = self.topic(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.topic(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_admits_exactly_one_owner() {
        let store = MemoryCoordination::new();
        let ttl = Duration::from_secs(5);

        assert!(store.try_lock("lock:conversation:c1", "a1", ttl).await.unwrap());
        assert!(!store.try_lock("lock:conversation:c1", "a2", ttl).await.unwrap());
        assert!(store.try_lock("lock:conversation:c2", "a2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let store = MemoryCoordination::new();

        assert!(store.try_lock("k", "a1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.try_lock("k", "a2", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_is_owner_scoped() {
        let store = MemoryCoordination::new();
        let ttl = Duration::from_secs(5);

        assert!(store.try_lock("k", "a1", ttl).await.unwrap());
        store.unlock("k", "a2").await.unwrap();
        assert!(!store.try_lock("k", "a3", ttl).await.unwrap());

        store.unlock("k", "a1").await.unwrap();
        assert!(store.try_lock("k", "a3", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn sessions_expire() {
        let store = MemoryCoordination::new();

        store.put_session("session:u1", "{}", Duration::from_millis(10)).await.unwrap();
        assert!(store.get_session("session:u1").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.get_session("session:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let store = MemoryCoordination::new();

        let mut rx = store.subscribe("events").await.unwrap();
        tokio::task::yield_now().await;
        store.publish("events", "hello").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
    }
}
