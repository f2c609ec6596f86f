//! In-memory blackboard backend.
//!
//! [`InMemoryStore`] is a TTL-aware key/value and list store that satisfies the
//! [`BlackboardStore`](super::BlackboardStore) contract inside a single process.
//! It is what the test-suite and single-node deployments use; a shared durable
//! backend only has to implement the same trait.
//!
//! # Features
//!
//! - **Key/value and list slots** sharing one key space
//! - **TTL expiration** tracked per key, refreshed on every write
//! - **Lazy eviction** on every access plus a background sweep (one second by
//!   default) when the store is created inside a tokio runtime
//! - **Atomic list append and bounded increment**: every operation runs under a
//!   single lock, so concurrent writers observe one linear order
//!
//! # Examples
//!
//! ```rust
//! use forumflow::blackboard::{BlackboardStore, InMemoryStore};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//! store.put("task:1:guidance:plan", "cover pricing".into(), Some(Duration::from_secs(60))).await?;
//! assert_eq!(
//!     store.get("task:1:guidance:plan").await?.as_deref(),
//!     Some("cover pricing")
//! );
//!
//! store.append("task:1:forum:log", "first".into(), None).await?;
//! store.append("task:1:forum:log", "second".into(), None).await?;
//! assert_eq!(store.range("task:1:forum:log").await?, vec!["first", "second"]);
//! # Ok(())
//! # }
//! ```

use super::{BlackboardError, BlackboardStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Metadata associated with a stored slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMetadata {
    /// UTC timestamp of the most recent write to the slot.
    pub added_utc: DateTime<Utc>,
    /// Absolute expiry instant, `None` if the slot never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    fn new(ttl: Option<Duration>) -> Self {
        let added_utc = Utc::now();
        Self {
            added_utc,
            expires_at: ttl.and_then(|ttl| expiry_for(added_utc, ttl)),
        }
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }
}

/// An out-of-range TTL is treated as "never expires".
fn expiry_for(added: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    added.checked_add_signed(ttl)
}

#[derive(Debug, Clone)]
enum Slot {
    Value(String),
    List(Vec<String>),
}

impl Slot {
    fn byte_len(&self) -> usize {
        match self {
            Slot::Value(value) => value.len(),
            Slot::List(items) => items.iter().map(String::len).sum(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, (Slot, EntryMetadata)>,
    // Maps expiration time to the keys that were scheduled to expire at that time.
    // A key may appear under several timestamps after its TTL was refreshed; the
    // entry metadata stays authoritative.
    expiring_timestamps_2_keys: BTreeMap<DateTime<Utc>, Vec<String>>,
}

impl StoreState {
    fn write(&mut self, key: &str, slot: Slot, ttl: Option<Duration>) {
        let metadata = self.schedule(key, ttl);
        self.entries.insert(key.to_string(), (slot, metadata));
    }

    /// Restart the TTL of an existing slot without touching its contents.
    fn touch(&mut self, key: &str, ttl: Option<Duration>) {
        let metadata = self.schedule(key, ttl);
        if let Some((_, current)) = self.entries.get_mut(key) {
            *current = metadata;
        }
    }

    fn schedule(&mut self, key: &str, ttl: Option<Duration>) -> EntryMetadata {
        let metadata = EntryMetadata::new(ttl);
        if let Some(expiry) = metadata.expires_at {
            self.expiring_timestamps_2_keys
                .entry(expiry)
                .or_default()
                .push(key.to_string());
        }
        metadata
    }

    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&(Slot, EntryMetadata)> {
        self.entries
            .get(key)
            .filter(|(_, metadata)| !metadata.is_expired_at(now))
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let due: Vec<DateTime<Utc>> = self
            .expiring_timestamps_2_keys
            .range(..=now)
            .map(|(expiry, _)| *expiry)
            .collect();

        for expiry in due {
            if let Some(keys) = self.expiring_timestamps_2_keys.remove(&expiry) {
                for key in keys {
                    let expired = self
                        .entries
                        .get(&key)
                        .map(|(_, metadata)| metadata.is_expired_at(now))
                        .unwrap_or(false);
                    if expired {
                        self.entries.remove(&key);
                    }
                }
            }
        }
    }
}

/// TTL-aware in-process implementation of [`BlackboardStore`].
///
/// Cloning the store is cheap and every clone shares the same data.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    /// Create an empty store.
    ///
    /// When called from within a tokio runtime a background task sweeps expired
    /// keys every second. The sweep holds only a weak reference and stops once
    /// the last clone of the store is dropped. Outside a runtime expiry still
    /// happens lazily on access.
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(1))
    }

    /// Create an empty store with a custom background sweep interval, clamped
    /// to at least one millisecond.
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(StoreState::default()));

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak_state = Arc::downgrade(&state);
            handle.spawn(async move {
                let mut ticker = time::interval(sweep_interval.max(MIN_SWEEP_INTERVAL));
                loop {
                    ticker.tick().await;
                    let Some(state) = weak_state.upgrade() else {
                        break;
                    };
                    if let Ok(mut guard) = state.lock() {
                        guard.evict_expired(Utc::now());
                    };
                }
            });
        }

        Self { state }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, BlackboardError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| BlackboardError::Backend("in-memory store lock poisoned".into()))?;
        guard.evict_expired(Utc::now());
        Ok(guard)
    }

    /// Metadata for a live key, mostly useful for diagnostics and tests.
    pub fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, BlackboardError> {
        let state = self.lock()?;
        Ok(state
            .live(key, Utc::now())
            .map(|(_, metadata)| metadata.clone()))
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize, BlackboardError> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .entries
            .values()
            .filter(|(_, metadata)| !metadata.is_expired_at(now))
            .count())
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> Result<bool, BlackboardError> {
        Ok(self.len()? == 0)
    }

    /// Total size of stored data in bytes.
    ///
    /// Returns (total_bytes, keys_bytes, values_bytes)
    pub fn total_bytes_stored(&self) -> Result<(usize, usize, usize), BlackboardError> {
        let state = self.lock()?;
        let mut keys_size = 0;
        let mut values_size = 0;
        for (key, (slot, _)) in state.entries.iter() {
            keys_size += key.len();
            values_size += slot.byte_len();
        }
        Ok((keys_size + values_size, keys_size, values_size))
    }

    /// Drop every key.
    pub fn clear(&self) -> Result<(), BlackboardError> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.expiring_timestamps_2_keys.clear();
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlackboardStore for InMemoryStore {
    async fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), BlackboardError> {
        let mut state = self.lock()?;
        state.write(key, Slot::Value(value), ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BlackboardError> {
        let state = self.lock()?;
        match state.live(key, Utc::now()) {
            Some((Slot::Value(value), _)) => Ok(Some(value.clone())),
            Some((Slot::List(_), _)) => Err(BlackboardError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlackboardError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .entries
            .remove(key)
            .map(|(_, metadata)| !metadata.is_expired_at(now))
            .unwrap_or(false))
    }

    async fn append(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<usize, BlackboardError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let existing = state
            .entries
            .get_mut(key)
            .filter(|(_, metadata)| !metadata.is_expired_at(now));
        let len = match existing {
            Some((Slot::List(items), _)) => {
                items.push(value);
                items.len()
            }
            Some((Slot::Value(_), _)) => {
                return Err(BlackboardError::WrongType(key.to_string()))
            }
            None => {
                state.write(key, Slot::List(vec![value]), ttl);
                return Ok(1);
            }
        };
        state.touch(key, ttl);
        Ok(len)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, BlackboardError> {
        let state = self.lock()?;
        match state.live(key, Utc::now()) {
            Some((Slot::List(items), _)) => Ok(items.clone()),
            Some((Slot::Value(_), _)) => Err(BlackboardError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn incr_bounded(
        &self,
        key: &str,
        max: i64,
        ttl: Option<Duration>,
    ) -> Result<Option<i64>, BlackboardError> {
        let mut state = self.lock()?;
        let current = match state.live(key, Utc::now()) {
            Some((Slot::Value(value), _)) => value
                .trim()
                .parse::<i64>()
                .map_err(|_| BlackboardError::WrongType(key.to_string()))?,
            Some((Slot::List(_), _)) => {
                return Err(BlackboardError::WrongType(key.to_string()))
            }
            None => 0,
        };
        if current >= max {
            return Ok(None);
        }
        let next = current + 1;
        state.write(key, Slot::Value(next.to_string()), ttl);
        Ok(Some(next))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlackboardError> {
        let state = self.lock()?;
        let now = Utc::now();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, (_, metadata))| key.starts_with(prefix) && !metadata.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
