//! Per-address reputation with escalating, self-expiring blocks.
//!
//! # State Transitions
//! ```text
//! Clean → Blocked: failures >= max_failed_attempts within failure window
//! Blocked → Clean: blocked_until passes (checked lazily on lookup)
//! Blocked → Blocked: failure while blocked, consecutive_blocks += 1, longer block
//! Any → Clean: manual unblock (full reset, history discarded)
//! ```
//!
//! Block length is `block_duration * 2^consecutive_blocks`, capped. After
//! `decay_after` without any failure an address that is not blocked forgets
//! its repeat-offense history, so the next block starts from the base again.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::schema::GatewayConfig;
use crate::observability::metrics;
use crate::resilience::backoff::exponential_ms;
use crate::security::clock::Clock;

/// Reputation record for one address.
#[derive(Debug, Clone, Serialize)]
pub struct IpBlockRecord {
    pub ip: IpAddr,
    /// Block expiry in epoch ms; `0` when not blocked.
    pub blocked_until_ms: u64,
    pub consecutive_blocks: u32,
    /// Failures inside the current rolling window.
    pub failure_count: u32,
    pub last_failure_at_ms: u64,
    #[serde(skip)]
    recent_failures: VecDeque<u64>,
}

impl IpBlockRecord {
    fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            blocked_until_ms: 0,
            consecutive_blocks: 0,
            failure_count: 0,
            last_failure_at_ms: 0,
            recent_failures: VecDeque::new(),
        }
    }

    pub fn is_blocked_at(&self, now_ms: u64) -> bool {
        self.blocked_until_ms > now_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.blocked_until_ms.saturating_sub(now_ms)
    }

    fn is_clean(&self) -> bool {
        self.blocked_until_ms == 0 && self.consecutive_blocks == 0 && self.recent_failures.is_empty()
    }
}

/// Shared table of address records.
pub type ReputationTable = DashMap<IpAddr, IpBlockRecord>;

/// Tunables for [`IpReputationStore`].
#[derive(Debug, Clone)]
pub struct ReputationPolicy {
    pub max_failed_attempts: u32,
    pub failure_window_ms: u64,
    pub base_block_ms: u64,
    pub max_block_ms: u64,
    pub decay_after_ms: u64,
    pub max_tracked_ips: usize,
    pub allowlist: Vec<IpAddr>,
}

impl ReputationPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_failed_attempts: config.security.max_failed_attempts,
            failure_window_ms: config.reputation.failure_window_secs.saturating_mul(1000),
            base_block_ms: config.security.block_duration_ms(),
            max_block_ms: config.reputation.max_block_duration_secs.saturating_mul(1000),
            decay_after_ms: config.reputation.decay_after_secs.saturating_mul(1000),
            max_tracked_ips: config.reputation.max_tracked_ips,
            allowlist: config.reputation.allowlist.clone(),
        }
    }
}

/// What a recorded failure did to the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted; still below the threshold.
    Counted { failures: u32 },
    /// The address is now blocked until the given time.
    Blocked { until_ms: u64, consecutive_blocks: u32 },
    /// Address is allowlisted or could not be tracked.
    Ignored,
}

/// Tracks failures per source address and blocks repeat offenders.
#[derive(Debug, Clone)]
pub struct IpReputationStore {
    table: Arc<ReputationTable>,
    clock: Arc<dyn Clock>,
    policy: ReputationPolicy,
}

impl IpReputationStore {
    pub fn new(table: Arc<ReputationTable>, clock: Arc<dyn Clock>, policy: ReputationPolicy) -> Self {
        Self { table, clock, policy }
    }

    pub fn policy(&self) -> &ReputationPolicy {
        &self.policy
    }

    /// Record one failure from `ip`.
    pub fn record_failure(&self, ip: IpAddr) -> FailureOutcome {
        if self.policy.allowlist.contains(&ip) {
            return FailureOutcome::Ignored;
        }
        let now = self.clock.now_ms();

        if !self.table.contains_key(&ip) && !self.make_room(now) {
            tracing::warn!(ip = %ip, "Reputation table full of active blocks, failure not tracked");
            return FailureOutcome::Ignored;
        }

        let mut record = self.table.entry(ip).or_insert_with(|| IpBlockRecord::new(ip));
        self.apply_decay(&mut record, now);
        record.last_failure_at_ms = now;

        if record.is_blocked_at(now) {
            let outcome = self.escalate(&mut record, now);
            tracing::warn!(
                ip = %ip,
                consecutive_blocks = record.consecutive_blocks,
                blocked_until_ms = record.blocked_until_ms,
                "Failure from blocked source, block extended"
            );
            return outcome;
        }

        let window_start = now.saturating_sub(self.policy.failure_window_ms);
        while record.recent_failures.front().is_some_and(|t| *t <= window_start) {
            record.recent_failures.pop_front();
        }
        record.recent_failures.push_back(now);
        record.failure_count = u32::try_from(record.recent_failures.len()).unwrap_or(u32::MAX);

        if record.failure_count < self.policy.max_failed_attempts {
            return FailureOutcome::Counted {
                failures: record.failure_count,
            };
        }

        record.recent_failures.clear();
        record.failure_count = 0;
        let outcome = self.escalate(&mut record, now);
        metrics::record_ip_block();
        tracing::warn!(
            ip = %ip,
            consecutive_blocks = record.consecutive_blocks,
            blocked_until_ms = record.blocked_until_ms,
            "Source blocked after repeated failures"
        );
        outcome
    }

    /// Whether `ip` is currently blocked. Expired blocks are cleared here.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        let now = self.clock.now_ms();
        let Some(mut record) = self.table.get_mut(&ip) else {
            return false;
        };
        if record.is_blocked_at(now) {
            return true;
        }
        if record.blocked_until_ms != 0 {
            tracing::info!(ip = %ip, "Block expired");
            record.blocked_until_ms = 0;
        }
        self.apply_decay(&mut record, now);
        false
    }

    /// Read-only variant of [`is_blocked`](Self::is_blocked).
    pub fn peek_blocked(&self, ip: IpAddr) -> bool {
        let now = self.clock.now_ms();
        self.table
            .get(&ip)
            .is_some_and(|record| record.is_blocked_at(now))
    }

    /// Administrative full reset. Returns whether an active block was lifted.
    pub fn unblock(&self, ip: IpAddr) -> bool {
        let now = self.clock.now_ms();
        match self.table.remove(&ip) {
            Some((_, record)) => {
                let was_blocked = record.is_blocked_at(now);
                tracing::info!(ip = %ip, was_blocked, "Source manually unblocked");
                was_blocked
            }
            None => false,
        }
    }

    /// Active blocks, longest remaining first.
    pub fn list_blocked(&self) -> Vec<IpBlockRecord> {
        let now = self.clock.now_ms();
        let mut blocked: Vec<IpBlockRecord> = self
            .table
            .iter()
            .filter(|r| r.is_blocked_at(now))
            .map(|r| r.value().clone())
            .collect();
        blocked.sort_by(|a, b| b.blocked_until_ms.cmp(&a.blocked_until_ms));
        blocked
    }

    pub fn blocked_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.table.iter().filter(|r| r.is_blocked_at(now)).count()
    }

    pub fn tracked_count(&self) -> usize {
        self.table.len()
    }

    pub fn record(&self, ip: IpAddr) -> Option<IpBlockRecord> {
        self.table.get(&ip).map(|r| r.value().clone())
    }

    /// Drop records that carry no information any more. Returns removed count.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.table.len();
        self.table.retain(|_, record| {
            if record.is_blocked_at(now_ms) {
                return true;
            }
            if record.blocked_until_ms != 0 {
                record.blocked_until_ms = 0;
            }
            self.apply_decay(record, now_ms);
            let window_start = now_ms.saturating_sub(self.policy.failure_window_ms);
            let quiet_in_window = record
                .recent_failures
                .back()
                .map_or(true, |t| *t <= window_start);
            !(record.is_clean() || (record.consecutive_blocks == 0 && quiet_in_window))
        });
        before.saturating_sub(self.table.len())
    }

    fn escalate(&self, record: &mut IpBlockRecord, now: u64) -> FailureOutcome {
        let duration = exponential_ms(
            self.policy.base_block_ms,
            record.consecutive_blocks,
            self.policy.max_block_ms,
        );
        record.consecutive_blocks = record.consecutive_blocks.saturating_add(1);
        record.blocked_until_ms = record.blocked_until_ms.max(now.saturating_add(duration));
        FailureOutcome::Blocked {
            until_ms: record.blocked_until_ms,
            consecutive_blocks: record.consecutive_blocks,
        }
    }

    fn apply_decay(&self, record: &mut IpBlockRecord, now: u64) {
        if record.is_blocked_at(now) || record.last_failure_at_ms == 0 {
            return;
        }
        if now.saturating_sub(record.last_failure_at_ms) >= self.policy.decay_after_ms {
            record.consecutive_blocks = 0;
            record.recent_failures.clear();
            record.failure_count = 0;
        }
    }

    /// Ensure a new address can be tracked, evicting the stalest unblocked record.
    fn make_room(&self, now: u64) -> bool {
        if self.table.len() < self.policy.max_tracked_ips {
            return true;
        }
        self.sweep(now);
        if self.table.len() < self.policy.max_tracked_ips {
            return true;
        }
        let victim = self
            .table
            .iter()
            .filter(|r| !r.is_blocked_at(now))
            .min_by_key(|r| r.last_failure_at_ms)
            .map(|r| *r.key());
        match victim {
            Some(ip) => {
                self.table.remove(&ip);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;

    const START_MS: u64 = 1_700_000_000_000;

    fn policy() -> ReputationPolicy {
        ReputationPolicy {
            max_failed_attempts: 3,
            failure_window_ms: 60_000,
            base_block_ms: 10_000,
            max_block_ms: 80_000,
            decay_after_ms: 3_600_000,
            max_tracked_ips: 100,
            allowlist: Vec::new(),
        }
    }

    fn store(clock: Arc<ManualClock>, policy: ReputationPolicy) -> IpReputationStore {
        IpReputationStore::new(Arc::new(DashMap::new()), clock, policy)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn trip(store: &IpReputationStore, addr: IpAddr, attempts: u32) -> FailureOutcome {
        let mut outcome = FailureOutcome::Ignored;
        for _ in 0..attempts {
            outcome = store.record_failure(addr);
        }
        outcome
    }

    #[test]
    fn test_blocks_after_max_failures() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.1");

        assert_eq!(store.record_failure(addr), FailureOutcome::Counted { failures: 1 });
        assert_eq!(store.record_failure(addr), FailureOutcome::Counted { failures: 2 });
        assert!(!store.is_blocked(addr));
        assert_eq!(
            store.record_failure(addr),
            FailureOutcome::Blocked {
                until_ms: START_MS + 10_000,
                consecutive_blocks: 1
            }
        );
        assert!(store.is_blocked(addr));
        assert_eq!(store.list_blocked().len(), 1);
    }

    #[test]
    fn test_block_expires_lazily_without_sweep() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.2");
        trip(&store, addr, 3);

        clock.advance_ms(9_999);
        assert!(store.is_blocked(addr));
        clock.advance_ms(1);
        assert!(!store.is_blocked(addr));
        assert_eq!(store.record(addr).unwrap().blocked_until_ms, 0);
        assert_eq!(store.blocked_count(), 0);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.3");

        store.record_failure(addr);
        store.record_failure(addr);
        clock.advance_ms(60_001);
        assert_eq!(store.record_failure(addr), FailureOutcome::Counted { failures: 1 });
        assert!(!store.is_blocked(addr));
    }

    #[test]
    fn test_repeat_offender_backoff_is_monotonic_and_capped() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.4");

        let mut previous = 0;
        let mut durations = Vec::new();
        for _ in 0..6 {
            let now = clock.now_ms();
            let FailureOutcome::Blocked { until_ms, .. } = trip(&store, addr, 3) else {
                panic!("expected block");
            };
            let duration = until_ms - now;
            assert!(duration >= previous);
            previous = duration;
            durations.push(duration);
            clock.advance_ms(duration);
            assert!(!store.is_blocked(addr));
        }
        assert_eq!(durations, vec![10_000, 20_000, 40_000, 80_000, 80_000, 80_000]);
    }

    #[test]
    fn test_failure_while_blocked_extends_block() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.5");
        trip(&store, addr, 3);
        let first_until = store.record(addr).unwrap().blocked_until_ms;

        clock.advance_ms(1_000);
        let outcome = store.record_failure(addr);
        let second_until = store.record(addr).unwrap().blocked_until_ms;
        assert_eq!(
            outcome,
            FailureOutcome::Blocked {
                until_ms: START_MS + 1_000 + 20_000,
                consecutive_blocks: 2
            }
        );
        assert!(second_until > first_until);
    }

    #[test]
    fn test_blocked_until_never_decreases() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let mut p = policy();
        p.max_block_ms = 10_000;
        let store = store(clock.clone(), p);
        let addr = ip("198.51.100.6");
        trip(&store, addr, 3);
        let until = store.record(addr).unwrap().blocked_until_ms;

        // Cap reached: a new failure cannot shorten the existing block.
        store.record_failure(addr);
        assert!(store.record(addr).unwrap().blocked_until_ms >= until);
    }

    #[test]
    fn test_unblock_is_full_reset() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.7");
        trip(&store, addr, 3);
        clock.advance_ms(10_000);
        trip(&store, addr, 3);
        assert_eq!(store.record(addr).unwrap().consecutive_blocks, 2);

        assert!(store.unblock(addr));
        assert!(!store.is_blocked(addr));
        assert!(store.record(addr).is_none());
        assert!(!store.unblock(addr));

        // Next offense starts again at the base duration.
        let now = clock.now_ms();
        assert_eq!(
            trip(&store, addr, 3),
            FailureOutcome::Blocked {
                until_ms: now + 10_000,
                consecutive_blocks: 1
            }
        );
    }

    #[test]
    fn test_history_decays_after_quiet_period() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.8");

        trip(&store, addr, 3);
        clock.advance_ms(10_000);
        trip(&store, addr, 3);
        assert_eq!(store.record(addr).unwrap().consecutive_blocks, 2);

        // Block of 20s ends, then a full decay period passes without failures.
        clock.advance_ms(20_000 + 3_600_000);
        assert!(!store.is_blocked(addr));
        assert_eq!(store.record(addr).unwrap().consecutive_blocks, 0);

        let now = clock.now_ms();
        assert_eq!(
            trip(&store, addr, 3),
            FailureOutcome::Blocked {
                until_ms: now + 10_000,
                consecutive_blocks: 1
            }
        );
    }

    #[test]
    fn test_history_kept_before_decay_period() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        let addr = ip("198.51.100.9");

        trip(&store, addr, 3);
        clock.advance_ms(3_000_000);
        let now = clock.now_ms();
        assert_eq!(
            trip(&store, addr, 3),
            FailureOutcome::Blocked {
                until_ms: now + 20_000,
                consecutive_blocks: 2
            }
        );
    }

    #[test]
    fn test_allowlisted_address_never_blocked() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let mut p = policy();
        p.allowlist = vec![ip("10.0.0.1")];
        let store = store(clock, p);

        assert_eq!(trip(&store, ip("10.0.0.1"), 10), FailureOutcome::Ignored);
        assert!(!store.is_blocked(ip("10.0.0.1")));
    }

    #[test]
    fn test_sweep_reclaims_quiet_records_but_keeps_blocks() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = store(clock.clone(), policy());
        store.record_failure(ip("198.51.100.10"));
        trip(&store, ip("198.51.100.11"), 3);

        clock.advance_ms(60_001);
        // The expired offender keeps its escalation history until it decays.
        assert_eq!(store.sweep(clock.now_ms()), 1);
        assert_eq!(store.tracked_count(), 1);
        assert!(store.record(ip("198.51.100.10")).is_none());

        // Active blocks are kept.
        trip(&store, ip("198.51.100.12"), 3);
        assert_eq!(store.sweep(clock.now_ms()), 0);
        assert_eq!(store.tracked_count(), 2);

        clock.advance_ms(3_600_000);
        assert_eq!(store.sweep(clock.now_ms()), 2);
        assert_eq!(store.tracked_count(), 0);
    }

    #[test]
    fn test_capacity_evicts_stalest_unblocked_record() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let mut p = policy();
        p.max_tracked_ips = 2;
        let store = store(clock.clone(), p);

        trip(&store, ip("198.51.100.20"), 3);
        clock.advance_ms(1);
        store.record_failure(ip("198.51.100.21"));
        clock.advance_ms(1);
        store.record_failure(ip("198.51.100.22"));

        assert_eq!(store.tracked_count(), 2);
        assert!(store.is_blocked(ip("198.51.100.20")));
        assert!(store.record(ip("198.51.100.21")).is_none());
    }
}
