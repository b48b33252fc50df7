use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized realtime tick. Both wire paths (pipe/caret batch and JSON
/// envelope) decode into this shape.
#[derive(Debug, Clone, Serialize)]
pub struct PriceUpdate {
    pub symbol: String,
    /// HHMMSS execution time from the exchange; absent on the envelope path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<String>,
    pub price: i64,
    pub change_sign: i32,
    pub change_amount: i64,
    pub change_rate: f64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub acml_volume: i64,
    pub acml_trade_value: i64,
    pub ask_price: i64,
    pub bid_price: i64,
    pub source: &'static str,
    /// Receipt time, assigned when the frame is decoded.
    pub timestamp: DateTime<Utc>,
}

/// Snapshot returned by the REST current-price endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub price: i64,
    pub change_sign: i32,
    pub change_amount: i64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

/// One line of the daily scalp tick log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub price: i64,
    pub volume: i64,
    pub source: String,
    pub session_id: String,
}

/// A symbol proposed for a streaming slot by the trigger stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotCandidate {
    pub symbol: String,
    pub priority: f64,
    pub trigger_type: String,
    pub detected_at: DateTime<Utc>,
}

/// Occupant of a streaming slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub slot_id: usize,
    pub symbol: String,
    pub priority: f64,
    pub trigger_type: String,
    pub detected_at: DateTime<Utc>,
    /// When the symbol first took this slot. Preserved across in-place
    /// updates so dwell keeps accruing.
    pub assigned_at: DateTime<Utc>,
}

/// Why an allocation attempt ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotOutcome {
    UpdatedExistingSlot,
    AlreadyAllocated,
    AllocatedEmptySlot,
    ReplacedLowerPriority,
    OverflowAllSlotsOccupied,
}

impl SlotOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotOutcome::UpdatedExistingSlot => "updated_existing_slot",
            SlotOutcome::AlreadyAllocated => "already_allocated",
            SlotOutcome::AllocatedEmptySlot => "allocated_empty_slot",
            SlotOutcome::ReplacedLowerPriority => "replaced_lower_priority",
            SlotOutcome::OverflowAllSlotsOccupied => "overflow_all_slots_occupied",
        }
    }
}

impl fmt::Display for SlotOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed result of an allocation attempt. Overflow is a value, not an error.
#[derive(Debug, Clone)]
pub struct SlotAssignment {
    pub assigned: bool,
    pub slot_id: Option<usize>,
    pub replaced: Option<SlotInfo>,
    pub reason: SlotOutcome,
}

/// Row appended to the overflow ledger when every slot is held by an
/// occupant the candidate cannot evict.
#[derive(Debug, Clone, Serialize)]
pub struct OverflowRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub trigger_type: String,
    pub priority_score: f64,
    pub detected_at: DateTime<Utc>,
    pub reason: &'static str,
}

/// Which feed a gap event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapTrack {
    TrackA,
    TrackB,
}

impl fmt::Display for GapTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapTrack::TrackA => write!(f, "track_a"),
            GapTrack::TrackB => write!(f, "track_b"),
        }
    }
}

/// Severity tier of a detected gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GapType {
    Minor,
    Major,
    Critical,
}

impl fmt::Display for GapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GapType::Minor => write!(f, "minor"),
            GapType::Major => write!(f, "major"),
            GapType::Critical => write!(f, "critical"),
        }
    }
}

/// Row appended to the gap ledger for every classified gap.
#[derive(Debug, Clone, Serialize)]
pub struct GapEvent {
    pub track: GapTrack,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub gap_seconds: f64,
    pub gap_type: GapType,
    pub expected_interval_seconds: f64,
    /// Exchange-timezone stamp, kept with its offset in the ledger row.
    pub detected_at: DateTime<FixedOffset>,
}

/// Point-in-time readiness snapshot of the provider engine.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub mode: String,
    pub rest_ready: bool,
    pub ws_connected: bool,
    pub ws_subscriptions: usize,
    pub ws_available_slots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_outcome_strings() {
        assert_eq!(
            SlotOutcome::UpdatedExistingSlot.as_str(),
            "updated_existing_slot"
        );
        assert_eq!(SlotOutcome::AlreadyAllocated.as_str(), "already_allocated");
        assert_eq!(
            SlotOutcome::AllocatedEmptySlot.as_str(),
            "allocated_empty_slot"
        );
        assert_eq!(
            SlotOutcome::ReplacedLowerPriority.as_str(),
            "replaced_lower_priority"
        );
        assert_eq!(
            SlotOutcome::OverflowAllSlotsOccupied.as_str(),
            "overflow_all_slots_occupied"
        );
    }

    #[test]
    fn test_gap_event_serializes_track_and_type() {
        let event = GapEvent {
            track: GapTrack::TrackB,
            symbol: Some("005930".to_string()),
            gap_seconds: 61.2,
            gap_type: GapType::Major,
            expected_interval_seconds: 2.0,
            detected_at: Utc::now().fixed_offset(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["track"], "track_b");
        assert_eq!(json["gap_type"], "major");
        assert_eq!(json["symbol"], "005930");
    }

    #[test]
    fn test_track_a_event_omits_symbol() {
        let event = GapEvent {
            track: GapTrack::TrackA,
            symbol: None,
            gap_seconds: 700.0,
            gap_type: GapType::Minor,
            expected_interval_seconds: 600.0,
            detected_at: Utc::now().fixed_offset(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"symbol\""));
        assert!(json.contains("\"track\":\"track_a\""));
    }
}
