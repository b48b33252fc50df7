//! Streaming Slot Management
//!
//! The realtime gateway admits a fixed number of concurrent subscriptions,
//! so slots are a contended resource:
//! - Fixed pool (41 slots), allocated lowest-id first
//! - Priority eviction: a candidate may displace a strictly lower-priority
//!   occupant once that occupant has held its slot past the dwell floor
//! - Stable eviction order: global minimum priority, ties to the lowest
//!   slot id
//! - Rejected candidates are never dropped silently: every overflow is
//!   appended to a daily JSONL ledger

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::ledger::DailyLedger;
use crate::models::{OverflowRecord, SlotAssignment, SlotCandidate, SlotInfo, SlotOutcome};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Number of concurrent streaming slots the gateway admits.
    pub capacity: usize,
    /// Seconds an occupant is protected from eviction after taking a slot.
    pub min_dwell_secs: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            capacity: 41,
            min_dwell_secs: 120,
        }
    }
}

impl SlotConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            capacity: std::env::var("MAX_SUBSCRIPTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.capacity),
            min_dwell_secs: std::env::var("MIN_DWELL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.min_dwell_secs),
        }
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Default)]
struct SlotMetrics {
    allocations: AtomicU64,
    replacements: AtomicU64,
    overflows: AtomicU64,
    releases: AtomicU64,
}

impl SlotMetrics {
    #[inline]
    fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_replacement(&self) {
        self.replacements.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counters snapshot for status logging.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStats {
    pub total_allocations: u64,
    pub total_replacements: u64,
    pub total_overflows: u64,
    pub total_releases: u64,
    pub allocated_slots: usize,
    pub available_slots: usize,
}

// =============================================================================
// SLOT MANAGER
// =============================================================================

/// Slot table plus its symbol index, guarded together so the index can
/// never drift from the table.
#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Option<SlotInfo>>,
    by_symbol: HashMap<String, usize>,
}

pub struct SlotManager {
    config: SlotConfig,
    table: RwLock<SlotTable>,
    overflow_ledger: DailyLedger,
    metrics: SlotMetrics,
}

impl SlotManager {
    pub fn new(config: SlotConfig, ledger_dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        if config.capacity == 0 {
            anyhow::bail!("slot capacity must be at least 1");
        }
        let overflow_ledger = DailyLedger::new(ledger_dir, "overflow_")?;
        let table = SlotTable {
            slots: vec![None; config.capacity],
            by_symbol: HashMap::new(),
        };
        info!(
            capacity = config.capacity,
            min_dwell_secs = config.min_dwell_secs,
            "slot_manager_ready"
        );
        Ok(Self {
            config,
            table: RwLock::new(table),
            overflow_ledger,
            metrics: SlotMetrics::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Allocate a slot for `candidate` at the current wall clock.
    pub fn assign_slot(&self, candidate: &SlotCandidate) -> SlotAssignment {
        self.assign_slot_at(candidate, Utc::now())
    }

    /// Allocation with an explicit clock. Resolution order:
    ///
    /// 1. symbol already holds a slot -> a strictly higher priority
    ///    refreshes it in place (dwell keeps accruing from the original
    ///    `assigned_at`); equal or lower is a no-op
    /// 2. lowest-numbered empty slot
    /// 3. evict the global minimum priority among occupants that are both
    ///    strictly lower-priority than the candidate and past the dwell
    ///    floor; ties resolve to the lowest slot id
    /// 4. overflow: ledgered and reported, never an error
    pub fn assign_slot_at(&self, candidate: &SlotCandidate, now: DateTime<Utc>) -> SlotAssignment {
        let mut table = self.table.write();

        // Case 1: already holds a slot.
        if let Some(slot_id) = table.by_symbol.get(&candidate.symbol).copied() {
            if let Some(occupant) = table.slots[slot_id].as_mut() {
                let reason = if candidate.priority > occupant.priority {
                    occupant.priority = candidate.priority;
                    occupant.trigger_type = candidate.trigger_type.clone();
                    occupant.detected_at = candidate.detected_at;
                    SlotOutcome::UpdatedExistingSlot
                } else {
                    SlotOutcome::AlreadyAllocated
                };
                debug!(symbol = %candidate.symbol, slot_id, reason = %reason, "slot_assignment");
                return SlotAssignment {
                    assigned: true,
                    slot_id: Some(slot_id),
                    replaced: None,
                    reason,
                };
            }
        }

        // Case 2: empty slot, lowest id first.
        if let Some(slot_id) = table.slots.iter().position(|s| s.is_none()) {
            let info = Self::occupant(slot_id, candidate, now);
            table.slots[slot_id] = Some(info);
            table.by_symbol.insert(candidate.symbol.clone(), slot_id);
            self.metrics.record_allocation();
            info!(
                symbol = %candidate.symbol,
                slot_id,
                priority = candidate.priority,
                reason = %SlotOutcome::AllocatedEmptySlot,
                "slot_assignment"
            );
            return SlotAssignment {
                assigned: true,
                slot_id: Some(slot_id),
                replaced: None,
                reason: SlotOutcome::AllocatedEmptySlot,
            };
        }

        // Case 3: eviction. Strictly lower priority only, dwell floor
        // honored, global minimum wins; ties keep the lowest slot id
        // because the scan is ascending and equal priorities never
        // displace the current victim.
        let min_dwell = self.config.min_dwell_secs as i64;
        let mut victim: Option<(usize, f64)> = None;
        for (slot_id, occupant) in table.slots.iter().enumerate() {
            let info = match occupant {
                Some(info) => info,
                None => continue,
            };
            if info.priority >= candidate.priority {
                continue;
            }
            if (now - info.assigned_at).num_seconds() < min_dwell {
                continue;
            }
            match victim {
                Some((_, best)) if info.priority >= best => {}
                _ => victim = Some((slot_id, info.priority)),
            }
        }

        if let Some((slot_id, _)) = victim {
            let replaced = table.slots[slot_id].take();
            let info = Self::occupant(slot_id, candidate, now);
            table.slots[slot_id] = Some(info);
            if let Some(old) = &replaced {
                table.by_symbol.remove(&old.symbol);
            }
            table.by_symbol.insert(candidate.symbol.clone(), slot_id);
            self.metrics.record_allocation();
            self.metrics.record_replacement();
            info!(
                symbol = %candidate.symbol,
                slot_id,
                priority = candidate.priority,
                evicted = %replaced.as_ref().map(|r| r.symbol.as_str()).unwrap_or("?"),
                reason = %SlotOutcome::ReplacedLowerPriority,
                "slot_assignment"
            );
            return SlotAssignment {
                assigned: true,
                slot_id: Some(slot_id),
                replaced,
                reason: SlotOutcome::ReplacedLowerPriority,
            };
        }

        // Case 4: overflow. Ledgered so rejected candidates stay auditable.
        drop(table);
        self.metrics.record_overflow();
        let record = OverflowRecord {
            timestamp: now,
            symbol: candidate.symbol.clone(),
            trigger_type: candidate.trigger_type.clone(),
            priority_score: candidate.priority,
            detected_at: candidate.detected_at,
            reason: "all_slots_occupied",
        };
        if let Err(e) = self.overflow_ledger.append(&record, now) {
            warn!(symbol = %candidate.symbol, error = %e, "overflow ledger write failed");
        }
        warn!(
            symbol = %candidate.symbol,
            priority = candidate.priority,
            reason = %SlotOutcome::OverflowAllSlotsOccupied,
            "slot_assignment"
        );
        SlotAssignment {
            assigned: false,
            slot_id: None,
            replaced: None,
            reason: SlotOutcome::OverflowAllSlotsOccupied,
        }
    }

    /// Free the slot held by `symbol`. Returns false if it held none.
    pub fn release_slot(&self, symbol: &str) -> bool {
        let mut table = self.table.write();
        match table.by_symbol.remove(symbol) {
            Some(slot_id) => {
                table.slots[slot_id] = None;
                self.metrics.record_release();
                info!(symbol = %symbol, slot_id, "slot_released");
                true
            }
            None => {
                debug!(symbol = %symbol, "release for symbol without a slot");
                false
            }
        }
    }

    /// Free every slot. Returns how many were occupied.
    pub fn release_all(&self) -> usize {
        let mut table = self.table.write();
        let released = table.by_symbol.len();
        table.by_symbol.clear();
        for slot in table.slots.iter_mut() {
            *slot = None;
        }
        for _ in 0..released {
            self.metrics.record_release();
        }
        if released > 0 {
            info!(released, "all_slots_released");
        }
        released
    }

    pub fn get_slot_info(&self, symbol: &str) -> Option<SlotInfo> {
        let table = self.table.read();
        table
            .by_symbol
            .get(symbol)
            .and_then(|&slot_id| table.slots[slot_id].clone())
    }

    /// Occupied slots in ascending slot-id order.
    pub fn list_assigned(&self) -> Vec<SlotInfo> {
        self.table
            .read()
            .slots
            .iter()
            .filter_map(|s| s.clone())
            .collect()
    }

    /// (occupied, capacity)
    pub fn occupancy(&self) -> (usize, usize) {
        let used = self.table.read().by_symbol.len();
        (used, self.config.capacity)
    }

    pub fn stats(&self) -> SlotStats {
        let (used, capacity) = self.occupancy();
        SlotStats {
            total_allocations: self.metrics.allocations.load(Ordering::Relaxed),
            total_replacements: self.metrics.replacements.load(Ordering::Relaxed),
            total_overflows: self.metrics.overflows.load(Ordering::Relaxed),
            total_releases: self.metrics.releases.load(Ordering::Relaxed),
            allocated_slots: used,
            available_slots: capacity - used,
        }
    }

    fn occupant(slot_id: usize, candidate: &SlotCandidate, now: DateTime<Utc>) -> SlotInfo {
        SlotInfo {
            slot_id,
            symbol: candidate.symbol.clone(),
            priority: candidate.priority,
            trigger_type: candidate.trigger_type.clone(),
            detected_at: candidate.detected_at,
            assigned_at: now,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
