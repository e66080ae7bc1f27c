//! Replay protection.
//!
//! # Responsibilities
//! - Derive a fingerprint per delivery (signature, timestamp, delivery id, body digest)
//! - Reject deliveries whose timestamp is outside the allowed clock skew
//! - Remember accepted fingerprints for the signature timeout
//!
//! # Design Decisions
//! - Memory is bounded: at capacity the oldest fingerprint is evicted even if
//!   it has not expired yet
//! - Expiry is checked on lookup, so correctness never waits for the sweep
//! - Large caches are sharded by fingerprint hash so sources do not contend
//! - Missing or unparseable timestamps fail closed

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::BuildHasher;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::schema::HeaderConfig;
use crate::security::clock::Clock;
use crate::security::context::SecurityRequestContext;

/// Values above this are read as milliseconds rather than seconds.
const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// Why a delivery was refused by the replay guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayRejection {
    Duplicate,
    Stale,
    MissingTimestamp,
    MalformedTimestamp,
    MalformedHeader,
}

impl ReplayRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayRejection::Duplicate => "replayed_request",
            ReplayRejection::Stale => "stale_request",
            ReplayRejection::MissingTimestamp => "missing_timestamp",
            ReplayRejection::MalformedTimestamp => "malformed_timestamp",
            ReplayRejection::MalformedHeader => "malformed_replay_headers",
        }
    }
}

impl std::fmt::Display for ReplayRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remembered fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceRecord {
    pub fingerprint: String,
    pub expires_at_ms: u64,
}

#[derive(Debug, Default)]
struct NonceTable {
    /// fingerprint -> (expires_at_ms, insertion sequence)
    entries: HashMap<String, (u64, u64)>,
    /// Insertion order for capacity eviction.
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl NonceTable {
    fn remove_front(&mut self) {
        if let Some((seq, fingerprint)) = self.order.pop_front() {
            if self.entries.get(&fingerprint).is_some_and(|(_, s)| *s == seq) {
                self.entries.remove(&fingerprint);
            }
        }
    }

    fn check_and_insert(&mut self, fingerprint: &str, now_ms: u64, ttl_ms: u64, capacity: usize) -> bool {
        if let Some((expires_at, _)) = self.entries.get(fingerprint) {
            if *expires_at > now_ms {
                return false;
            }
        }

        while self.entries.len() >= capacity && !self.order.is_empty() {
            self.remove_front();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(fingerprint.to_string(), (now_ms.saturating_add(ttl_ms), seq));
        self.order.push_back((seq, fingerprint.to_string()));
        true
    }

    fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (expires_at, _)| *expires_at > now_ms);
        let NonceTable { entries, order, .. } = self;
        order.retain(|(seq, fp)| entries.get(fp).is_some_and(|(_, s)| s == seq));
        before - self.entries.len()
    }
}

/// Entries per shard before the table is split.
const SHARD_MIN_ENTRIES: usize = 1024;
const MAX_SHARDS: usize = 16;

/// Bounded fingerprint cache with TTL and oldest-first eviction.
///
/// Large caches are split into independently locked shards; eviction order
/// is then kept per shard.
#[derive(Debug)]
pub struct NonceCache {
    shards: Vec<Mutex<NonceTable>>,
    shard_capacity: usize,
    capacity: usize,
    hasher: RandomState,
}

impl NonceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let shard_count = (capacity / SHARD_MIN_ENTRIES).clamp(1, MAX_SHARDS);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(NonceTable::default())).collect(),
            shard_capacity: capacity / shard_count,
            capacity,
            hasher: RandomState::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, fingerprint: &str) -> MutexGuard<'_, NonceTable> {
        let index = (self.hasher.hash_one(fingerprint) % self.shards.len() as u64) as usize;
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables(&self) -> impl Iterator<Item = MutexGuard<'_, NonceTable>> {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Insert `fingerprint` unless a live entry exists. Returns `false` on a hit.
    pub fn check_and_insert(&self, fingerprint: &str, now_ms: u64, ttl_ms: u64) -> bool {
        self.shard(fingerprint)
            .check_and_insert(fingerprint, now_ms, ttl_ms, self.shard_capacity)
    }

    /// Whether a live entry exists for `fingerprint`.
    pub fn contains(&self, fingerprint: &str, now_ms: u64) -> bool {
        self.shard(fingerprint)
            .entries
            .get(fingerprint)
            .is_some_and(|(expires_at, _)| *expires_at > now_ms)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        self.tables().map(|mut table| table.purge_expired(now_ms)).sum()
    }

    /// Number of fingerprints currently held, expired or not.
    pub fn len(&self) -> usize {
        self.tables().map(|table| table.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live fingerprints at `now_ms`.
    pub fn active_count(&self, now_ms: u64) -> usize {
        self.tables()
            .map(|table| {
                table
                    .entries
                    .values()
                    .filter(|(expires_at, _)| *expires_at > now_ms)
                    .count()
            })
            .sum()
    }

    pub fn records(&self) -> Vec<NonceRecord> {
        let mut records = Vec::new();
        for table in self.tables() {
            records.extend(table.entries.iter().map(|(fingerprint, (expires_at_ms, _))| NonceRecord {
                fingerprint: fingerprint.clone(),
                expires_at_ms: *expires_at_ms,
            }));
        }
        records
    }

    pub fn clear(&self) {
        for mut table in self.tables() {
            table.entries.clear();
            table.order.clear();
        }
    }
}

/// Rejects duplicate and stale deliveries.
#[derive(Debug, Clone)]
pub struct ReplayGuard {
    cache: Arc<NonceCache>,
    clock: Arc<dyn Clock>,
    headers: HeaderConfig,
    enabled: bool,
    ttl_ms: u64,
    max_skew_ms: u64,
}

impl ReplayGuard {
    pub fn new(
        cache: Arc<NonceCache>,
        clock: Arc<dyn Clock>,
        headers: HeaderConfig,
        enabled: bool,
        ttl_ms: u64,
        max_skew_ms: u64,
    ) -> Self {
        Self {
            cache,
            clock,
            headers,
            enabled,
            ttl_ms,
            max_skew_ms,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Accept a delivery, remembering its fingerprint.
    pub fn accept(&self, ctx: &SecurityRequestContext) -> Result<(), ReplayRejection> {
        if !self.enabled {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let fingerprint = self.fingerprint(ctx, now)?;
        if self.cache.check_and_insert(&fingerprint, now, self.ttl_ms) {
            Ok(())
        } else {
            Err(ReplayRejection::Duplicate)
        }
    }

    /// Evaluate a delivery without recording it.
    pub fn check(&self, ctx: &SecurityRequestContext) -> Result<(), ReplayRejection> {
        if !self.enabled {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let fingerprint = self.fingerprint(ctx, now)?;
        if self.cache.contains(&fingerprint, now) {
            Err(ReplayRejection::Duplicate)
        } else {
            Ok(())
        }
    }

    /// Fingerprint of a fresh delivery. Fails if its timestamp is unusable.
    fn fingerprint(&self, ctx: &SecurityRequestContext, now_ms: u64) -> Result<String, ReplayRejection> {
        let headers = ctx.headers();
        let read = |name: &str| headers.single(name).map_err(|_| ReplayRejection::MalformedHeader);

        let raw_timestamp = read(&self.headers.timestamp)?.ok_or(ReplayRejection::MissingTimestamp)?;
        let timestamp_ms = parse_timestamp(raw_timestamp)?;
        if timestamp_ms.abs_diff(now_ms) > self.max_skew_ms {
            return Err(ReplayRejection::Stale);
        }

        let signature = read(&self.headers.signature)?.unwrap_or_default();
        let delivery_id = read(&self.headers.delivery_id)?.unwrap_or_default();

        let mut hasher = Sha256::new();
        for part in [signature.as_bytes(), raw_timestamp.as_bytes(), delivery_id.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hasher.update(Sha256::digest(ctx.body()));
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Parse a Unix timestamp in seconds or milliseconds.
fn parse_timestamp(raw: &str) -> Result<u64, ReplayRejection> {
    let value: u64 = raw.parse().map_err(|_| ReplayRejection::MalformedTimestamp)?;
    if value >= MILLIS_THRESHOLD {
        Ok(value)
    } else {
        Ok(value.saturating_mul(1000))
    }
}
