//! Read-through metadata cache keyed by document id.
//!
//! Entries carry the document row together with its grantees as of the read
//! that produced them. Writers invalidate after commit; readers take a
//! [`FillTicket`] before going to the store and fill with
//! [`MetadataCache::set_if_unchanged`], so a read that raced with an
//! invalidation never reinstates the stale projection.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Document, Grantee};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// A document plus everyone it is shared with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDocument {
    pub document: Document,
    pub grantees: Vec<Grantee>,
}

impl ResolvedDocument {
    pub fn grant_logins(&self) -> Vec<String> {
        self.grantees
            .iter()
            .map(|grantee| grantee.login.clone())
            .collect()
    }

    pub fn readable_by(&self, user_id: Uuid) -> bool {
        self.document.owner_id == user_id
            || self.document.is_public
            || self.grantees.iter().any(|g| g.user_id == user_id)
    }
}

/// Invalidation generation observed before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket(u64);

#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ResolvedDocument>, CacheError>;

    /// Stores the entry unconditionally.
    async fn set(&self, entry: ResolvedDocument) -> Result<(), CacheError>;

    async fn ticket(&self) -> Result<FillTicket, CacheError>;

    /// Stores the entry only if no invalidation happened since `ticket` was taken.
    async fn set_if_unchanged(
        &self,
        ticket: FillTicket,
        entry: ResolvedDocument,
    ) -> Result<bool, CacheError>;

    async fn invalidate(&self, id: Uuid) -> Result<(), CacheError>;
}

struct CacheEntry {
    value: ResolvedDocument,
    inserted_at: Instant,
}

struct CacheState {
    entries: LruCache<Uuid, CacheEntry>,
    epoch: u64,
}

/// In-process LRU cache with a fixed TTL. A zero TTL disables caching.
pub struct LruMetadataCache {
    state: Mutex<CacheState>,
    ttl: Duration,
}

impl LruMetadataCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                epoch: 0,
            }),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".to_string()))
    }

    fn store(&self, state: &mut CacheState, entry: ResolvedDocument) {
        state.entries.put(
            entry.document.id,
            CacheEntry {
                value: entry,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl MetadataCache for LruMetadataCache {
    async fn get(&self, id: Uuid) -> Result<Option<ResolvedDocument>, CacheError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let mut state = self.lock()?;
        if let Some(entry) = state.entries.get(&id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Ok(Some(entry.value.clone()));
            }
            state.entries.pop(&id);
        }
        Ok(None)
    }

    async fn set(&self, entry: ResolvedDocument) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut state = self.lock()?;
        self.store(&mut state, entry);
        Ok(())
    }

    async fn ticket(&self) -> Result<FillTicket, CacheError> {
        Ok(FillTicket(self.lock()?.epoch))
    }

    async fn set_if_unchanged(
        &self,
        ticket: FillTicket,
        entry: ResolvedDocument,
    ) -> Result<bool, CacheError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let mut state = self.lock()?;
        if state.epoch != ticket.0 {
            return Ok(false);
        }
        self.store(&mut state, entry);
        Ok(true)
    }

    async fn invalidate(&self, id: Uuid) -> Result<(), CacheError> {
        let mut state = self.lock()?;
        state.entries.pop(&id);
        state.epoch = state.epoch.wrapping_add(1);
        Ok(())
    }
}
