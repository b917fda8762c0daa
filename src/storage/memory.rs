//! Process-local state storage.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::LimitError;
use crate::ratelimit::State;

use super::{storage_key, StateStorage, UpdateFn};

/// One stored state, kept encoded so every read decodes current truth.
#[derive(Debug)]
struct Slot {
    bytes: Option<Vec<u8>>,
    expires_at: Instant,
}

impl Slot {
    fn empty() -> Self {
        Self {
            bytes: None,
            expires_at: Instant::now(),
        }
    }

    fn live_bytes(&self, now: Instant) -> Option<&[u8]> {
        self.bytes.as_deref().filter(|_| self.expires_at > now)
    }
}

/// In-memory storage with a mutex per key.
///
/// Updates of one key are serialized; updates of different keys only
/// contend on the map shard while the slot is looked up.
#[derive(Debug)]
pub struct MemoryStorage {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    ttl: Duration,
}

impl MemoryStorage {
    /// Create an empty store whose writes live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
        }
    }

    /// Number of keys currently tracked, expired ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop expired slots that no update is using. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            // Anyone holding a clone is about to read or write the slot.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let keep = match slot.try_lock() {
                Ok(slot) => slot.live_bytes(now).is_some(),
                Err(_) => true,
            };
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Periodically purge expired slots until the storage is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let storage: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                let purged = storage.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = storage.len(), "Purged expired limiter state");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, bytes: &[u8]) {
        let slot = Slot {
            bytes: Some(bytes.to_vec()),
            expires_at: Instant::now() + self.ttl,
        };
        self.slots.insert(key.to_string(), Arc::new(Mutex::new(slot)));
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn update(
        &self,
        key: &str,
        algorithm: &str,
        apply: &mut UpdateFn<'_>,
    ) -> Result<(), LimitError> {
        let storage_key = storage_key(key, algorithm);
        let slot = self
            .slots
            .entry(storage_key)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::empty())))
            .clone();

        // No await past this point, so a cancelled caller never leaves a
        // half-applied update behind.
        let mut slot = slot.lock().await;
        let now = Instant::now();

        let current = slot.live_bytes(now).map(State::decode).transpose()?;
        let next = apply(current)?;

        slot.bytes = Some(next.encode()?);
        slot.expires_at = now + self.ttl;
        trace!(key, algorithm, "Stored limiter state in memory");
        Ok(())
    }
}
