//! Keyed pool of lazily created worker processes
//!
//! The registry owns every live worker record. Records are created on first
//! resolve for their key, reused while within the class TTL, and evicted by
//! the sweeper or by full teardown. At most one live record exists per key at
//! any instant, including under concurrent resolves: the check-then-create
//! sequence for a key runs under that key's creation lock, so of N
//! simultaneous resolves for a missing key exactly one launches a worker and
//! the rest observe its record.
//!
//! Ports are deterministic (`base_port + index`), so a duplicate launch for
//! the same key would attempt to bind an already-bound port; the per-key
//! serialization is what rules that out.

use crate::config::{ClassConfig, ClassDefaults};
use crate::error::GatewayError;
use crate::launcher::WorkerLauncher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Identifies one pool slot: a worker class plus an index within the class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub class: String,
    pub index: u32,
}

impl WorkerKey {
    pub fn new(class: &str, index: u32) -> Self {
        Self {
            class: class.to_string(),
            index,
        }
    }

    /// The canonical routable identifier for this slot
    pub fn address_path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.class, self.index)
    }
}

/// Snapshot of a live worker record, as returned by [`PoolRegistry::resolve`].
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub key: WorkerKey,
    /// Never reassigned while the record lives
    pub port: u16,
    pub address_path: String,
    pub created_at: Instant,
    pub created_utc: DateTime<Utc>,
    pub last_accessed_utc: DateTime<Utc>,
}

/// Registry-internal state for one worker
struct PoolEntry<H> {
    port: u16,
    address_path: String,
    created_at: Instant,
    created_utc: DateTime<Utc>,
    last_accessed: Instant,
    last_accessed_utc: DateTime<Utc>,
    /// Taken exactly once, at eviction
    handle: Option<H>,
}

impl<H> PoolEntry<H> {
    fn record(&self, key: &WorkerKey) -> WorkerRecord {
        WorkerRecord {
            key: key.clone(),
            port: self.port,
            address_path: self.address_path.clone(),
            created_at: self.created_at,
            created_utc: self.created_utc,
            last_accessed_utc: self.last_accessed_utc,
        }
    }
}

/// Keyed store of worker records with TTL validity and deterministic ports.
///
/// # Usage
///
/// `PoolRegistry` is designed to be used behind an `Arc` for shared ownership
/// across async tasks; [`new`](PoolRegistry::new) returns `Arc<Self>`
/// directly. The router and the sweeper access it from independently
/// scheduled tasks.
pub struct PoolRegistry<L: WorkerLauncher> {
    entries: DashMap<WorkerKey, Mutex<PoolEntry<L::Handle>>>,
    /// Per-key serialization of check-then-create and eviction. Entries are
    /// never removed: dropping one while a resolve holds a clone would split
    /// the key's mutual exclusion.
    creation_locks: DashMap<WorkerKey, Arc<AsyncMutex<()>>>,
    classes: HashMap<String, ClassConfig>,
    defaults: ClassDefaults,
    launcher: L,
    /// Set by teardown_all; rejects all further creation
    closed: AtomicBool,
}

impl<L: WorkerLauncher> PoolRegistry<L> {
    pub fn new(
        classes: HashMap<String, ClassConfig>,
        defaults: ClassDefaults,
        launcher: L,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            creation_locks: DashMap::new(),
            classes,
            defaults,
            launcher,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn class_config(&self, class: &str) -> Result<&ClassConfig, GatewayError> {
        match self.classes.get(class) {
            Some(cfg) if cfg.enabled => Ok(cfg),
            _ => Err(GatewayError::ClassDisabled(class.to_string())),
        }
    }

    /// A record is valid iff its age is strictly below the class TTL.
    /// Access activity does not extend validity.
    pub fn is_valid(&self, record: &WorkerRecord) -> bool {
        self.is_valid_at(record, Instant::now())
    }

    pub fn is_valid_at(&self, record: &WorkerRecord, now: Instant) -> bool {
        match self.classes.get(&record.key.class) {
            Some(cfg) => now.duration_since(record.created_at) < cfg.ttl(&self.defaults),
            None => false,
        }
    }

    fn entry_expired(&self, key: &WorkerKey, created_at: Instant, now: Instant) -> bool {
        match self.classes.get(&key.class) {
            Some(cfg) => now.duration_since(created_at) >= cfg.ttl(&self.defaults),
            None => true,
        }
    }

    fn creation_lock(&self, key: &WorkerKey) -> Arc<AsyncMutex<()>> {
        self.creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Resolve a key to a live record, creating the worker if needed.
    ///
    /// With an explicit index: a valid record is touched and returned; an
    /// absent or expired one is replaced by a fresh launch. With no index:
    /// the lowest index not currently in use is taken and a new record is
    /// always created.
    ///
    /// On launch failure no record is left behind for the key, so a later
    /// resolve retries creation.
    pub async fn resolve(
        &self,
        class: &str,
        index: Option<u32>,
    ) -> Result<WorkerRecord, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }
        self.class_config(class)?;

        match index {
            Some(index) => self.resolve_at(class, index).await.map(|(record, _)| record),
            None => {
                let mut index = self.lowest_free_index(class, 0);
                loop {
                    let (record, created) = self.resolve_at(class, index).await?;
                    if created {
                        return Ok(record);
                    }
                    // Lost the probed slot to a concurrent creation; this
                    // path always creates, so probe above it
                    index = self.lowest_free_index(class, index + 1);
                }
            }
        }
    }

    fn lowest_free_index(&self, class: &str, from: u32) -> u32 {
        let mut index = from;
        while self.entries.contains_key(&WorkerKey::new(class, index)) {
            index += 1;
        }
        index
    }

    async fn resolve_at(
        &self,
        class: &str,
        index: u32,
    ) -> Result<(WorkerRecord, bool), GatewayError> {
        let config = self.class_config(class)?;
        let key = WorkerKey::new(class, index);

        let lock = self.creation_lock(&key);
        let _guard = lock.lock().await;

        // Re-check after acquiring: teardown may have begun while we waited
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        let ttl = config.ttl(&self.defaults);
        if let Some(entry) = self.entries.get(&key) {
            let mut guard = entry.lock();
            if Instant::now().duration_since(guard.created_at) < ttl {
                guard.last_accessed = Instant::now();
                guard.last_accessed_utc = Utc::now();
                debug!(key = %key, port = guard.port, "Reusing worker");
                return Ok((guard.record(&key), false));
            }
        }

        // Absent or expired; a stale record is released before relaunching
        self.evict_locked(&key).await;

        let port = u16::try_from(index)
            .ok()
            .and_then(|i| config.base_port.checked_add(i))
            .ok_or_else(|| GatewayError::PortOutOfRange {
                class: class.to_string(),
                index,
            })?;

        let address_path = key.address_path();
        let handle = self
            .launcher
            .launch(class, config, port, &address_path)
            .await
            .map_err(GatewayError::Launch)?;

        let now = Instant::now();
        let now_utc = Utc::now();
        let entry = PoolEntry {
            port,
            address_path,
            created_at: now,
            created_utc: now_utc,
            last_accessed: now,
            last_accessed_utc: now_utc,
            handle: Some(handle),
        };
        let record = entry.record(&key);

        info!(key = %key, port, "Worker created");
        self.entries.insert(key, Mutex::new(entry));
        Ok((record, true))
    }

    /// Evict one key: release its worker and remove the record. Idempotent;
    /// a no-op for an absent key.
    pub async fn evict(&self, key: &WorkerKey) {
        let lock = self.creation_lock(key);
        let _guard = lock.lock().await;
        self.evict_locked(key).await;
    }

    /// Must be called with the key's creation lock held.
    async fn evict_locked(&self, key: &WorkerKey) {
        let handle = match self.entries.get(key) {
            Some(entry) => entry.lock().handle.take(),
            None => return,
        };

        if let Some(handle) = handle {
            // Release failures never block removal: leaking the registry
            // slot would block all future creation for this key
            match self.launcher.release(handle).await {
                Ok(()) => info!(key = %key, "Worker released"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to release worker, removing record anyway")
                }
            }
        }

        self.entries.remove(key);
    }

    /// Evict all and only the records whose age has reached the class TTL.
    /// Returns the number of records evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<WorkerKey> = self
            .entries
            .iter()
            .filter(|entry| self.entry_expired(entry.key(), entry.value().lock().created_at, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let lock = self.creation_lock(&key);
            let _guard = lock.lock().await;

            // Re-check under the lock; the record may have been recreated
            // since the scan
            let still_expired = self
                .entries
                .get(&key)
                .map(|entry| self.entry_expired(&key, entry.lock().created_at, Instant::now()))
                .unwrap_or(false);

            if still_expired {
                debug!(key = %key, "Evicting expired worker");
                self.evict_locked(&key).await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "Swept expired workers");
        }
        evicted
    }

    /// Evict every record and reject all future creation. Used at shutdown.
    pub async fn teardown_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let keys: Vec<WorkerKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.evict(&key).await;
        }

        info!("All workers torn down");
    }

    /// Snapshot of the current pool, grouped by class.
    pub fn statistics(&self) -> PoolStats {
        let now = Instant::now();
        let mut by_class: HashMap<String, usize> = HashMap::new();
        let mut workers = Vec::new();

        for entry in self.entries.iter() {
            let key = entry.key();
            let value = entry.value().lock();
            *by_class.entry(key.class.clone()).or_insert(0) += 1;

            let ttl_secs = self
                .classes
                .get(&key.class)
                .map(|cfg| cfg.ttl(&self.defaults).as_secs())
                .unwrap_or(0);

            workers.push(WorkerStats {
                key: key.to_string(),
                class: key.class.clone(),
                index: key.index,
                port: value.port,
                address_path: value.address_path.clone(),
                created_at: value.created_utc,
                last_accessed_at: value.last_accessed_utc,
                age_secs: now.duration_since(value.created_at).as_secs(),
                ttl_secs,
                expired: self.entry_expired(key, value.created_at, now),
            });
        }

        workers.sort_by(|a, b| a.key.cmp(&b.key));

        PoolStats {
            total: workers.len(),
            by_class,
            workers,
        }
    }
}

/// Snapshot of the pool for the status surface
#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub by_class: HashMap<String, usize>,
    pub workers: Vec<WorkerStats>,
}

/// One worker record in a statistics snapshot
#[derive(Debug, Serialize)]
pub struct WorkerStats {
    pub key: String,
    pub class: String,
    pub index: u32,
    pub port: u16,
    pub address_path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub age_secs: u64,
    pub ttl_secs: u64,
    pub expired: bool,
}
