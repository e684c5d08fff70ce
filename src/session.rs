use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// A stored value and the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: u64,
}

/// Per-session key/value storage with compare-and-swap.
///
/// A session idle for longer than the store's timeout reads as absent.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, session_id: &str) -> io::Result<Option<Versioned>>;

    /// Store `data` only if the current version is `expected` (`None`: the
    /// session holds nothing). Returns false when another writer got there
    /// first.
    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected: Option<u64>,
        data: Vec<u8>,
    ) -> io::Result<bool>;

    async fn remove(&self, session_id: &str) -> io::Result<()>;
}

struct SessionEntry {
    data: Vec<u8>,
    version: u64,
    touched_at: Instant,
}

/// In-process session store with sliding idle expiry.
pub struct MemorySessionStore {
    entries: DashMap<String, SessionEntry>,
    idle_timeout: Duration,
    // Versions are never reused, even across expiry and recreation.
    next_version: AtomicU64,
}

impl MemorySessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
            next_version: AtomicU64::new(1),
        }
    }

    fn is_expired(&self, entry: &SessionEntry, now: Instant) -> bool {
        now.duration_since(entry.touched_at) >= self.idle_timeout
    }

    /// Drop idle sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !self.is_expired(e, now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> io::Result<Option<Versioned>> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            if !self.is_expired(&entry, now) {
                entry.touched_at = now;
                return Ok(Some(Versioned {
                    data: entry.data.clone(),
                    version: entry.version,
                }));
            }
        } else {
            return Ok(None);
        }
        self.entries
            .remove_if(session_id, |_, e| self.is_expired(e, now));
        Ok(None)
    }

    async fn compare_and_swap(
        &self,
        session_id: &str,
        expected: Option<u64>,
        data: Vec<u8>,
    ) -> io::Result<bool> {
        let now = Instant::now();
        let fresh = SessionEntry {
            data,
            version: self.next_version.fetch_add(1, Ordering::Relaxed),
            touched_at: now,
        };
        match self.entries.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = (!self.is_expired(occupied.get(), now)).then(|| occupied.get().version);
                if current != expected {
                    return Ok(false);
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn remove(&self, session_id: &str) -> io::Result<()> {
        self.entries.remove(session_id);
        Ok(())
    }
}
