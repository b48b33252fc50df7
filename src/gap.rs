//! Data Gap Detection
//!
//! Watermark-based staleness monitoring for the two inbound feeds:
//! - Track A: the bulk REST sweep, one global watermark
//! - Track B: the realtime scalp stream, one watermark per subscribed symbol
//!
//! Collectors push "last seen" stamps; a sweep task asks for
//! classification. No watermark means no baseline, and no baseline is
//! never a gap. Every classified gap lands in a daily JSONL ledger.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use crate::ledger::DailyLedger;
use crate::models::{GapEvent, GapTrack, GapType};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Gap tier boundaries for one track, in seconds. Classification is
/// top-down with `>=` at each tier.
#[derive(Debug, Clone)]
pub struct GapThresholds {
    pub expected_interval_secs: f64,
    pub minor_secs: f64,
    pub major_secs: f64,
    pub critical_secs: f64,
}

impl GapThresholds {
    fn from_env(prefix: &str, defaults: GapThresholds) -> Self {
        let read = |key: &str, fallback: f64| {
            std::env::var(format!("{}_{}", prefix, key))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        Self {
            expected_interval_secs: read("EXPECTED_SECONDS", defaults.expected_interval_secs),
            minor_secs: read("MINOR_SECONDS", defaults.minor_secs),
            major_secs: read("MAJOR_SECONDS", defaults.major_secs),
            critical_secs: read("CRITICAL_SECONDS", defaults.critical_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GapConfig {
    pub track_a: GapThresholds,
    pub track_b: GapThresholds,
    /// Exchange timezone used for the `detected_at` stamp in ledger rows.
    pub tz: Tz,
    /// Sweep cadence for the periodic checker.
    pub check_interval_secs: u64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            track_a: GapThresholds {
                expected_interval_secs: 600.0,
                minor_secs: 660.0,
                major_secs: 900.0,
                critical_secs: 1800.0,
            },
            track_b: GapThresholds {
                expected_interval_secs: 2.0,
                minor_secs: 10.0,
                major_secs: 60.0,
                critical_secs: 300.0,
            },
            tz: chrono_tz::Asia::Seoul,
            check_interval_secs: 60,
        }
    }
}

impl GapConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            track_a: GapThresholds::from_env("TRACK_A", d.track_a),
            track_b: GapThresholds::from_env("TRACK_B", d.track_b),
            tz: std::env::var("EXCHANGE_TZ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.tz),
            check_interval_secs: std::env::var("GAP_CHECK_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.check_interval_secs),
        }
    }
}

// =============================================================================
// GAP DETECTOR
// =============================================================================

#[derive(Debug, Default)]
struct GapMetrics {
    minor: AtomicU64,
    major: AtomicU64,
    critical: AtomicU64,
}

/// Status snapshot for periodic logging.
#[derive(Debug, Clone, Serialize)]
pub struct GapStatus {
    pub track_a_last_update: Option<DateTime<Utc>>,
    pub track_a_age_secs: Option<f64>,
    pub track_b_tracked_symbols: usize,
    pub minor_total: u64,
    pub major_total: u64,
    pub critical_total: u64,
}

pub struct GapDetector {
    config: GapConfig,
    track_a_seen: RwLock<Option<DateTime<Utc>>>,
    track_b_seen: RwLock<HashMap<String, DateTime<Utc>>>,
    gap_ledger: DailyLedger,
    metrics: GapMetrics,
}

impl GapDetector {
    pub fn new(config: GapConfig, ledger_dir: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        let gap_ledger = DailyLedger::new(ledger_dir, "gap_")?;
        info!(
            track_a_expected = config.track_a.expected_interval_secs,
            track_b_expected = config.track_b.expected_interval_secs,
            tz = %config.tz,
            "gap_detector_ready"
        );
        Ok(Self {
            config,
            track_a_seen: RwLock::new(None),
            track_b_seen: RwLock::new(HashMap::new()),
            gap_ledger,
            metrics: GapMetrics::default(),
        })
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    /// Advance the bulk-feed watermark.
    pub fn update_track_a(&self, at: DateTime<Utc>) {
        *self.track_a_seen.write() = Some(at);
    }

    /// Advance one symbol's realtime watermark.
    pub fn update_track_b(&self, symbol: &str, at: DateTime<Utc>) {
        self.track_b_seen.write().insert(symbol.to_string(), at);
    }

    /// Forget a symbol's watermark (its slot was released). A stale
    /// watermark for an unsubscribed symbol would otherwise alarm forever.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        self.track_b_seen.write().remove(symbol).is_some()
    }

    pub fn check_track_a(&self, now: DateTime<Utc>) -> Option<GapEvent> {
        let seen = (*self.track_a_seen.read())?;
        self.evaluate(GapTrack::TrackA, None, seen, now)
    }

    pub fn check_track_b(&self, symbol: &str, now: DateTime<Utc>) -> Option<GapEvent> {
        let seen = self.track_b_seen.read().get(symbol).copied()?;
        self.evaluate(GapTrack::TrackB, Some(symbol.to_string()), seen, now)
    }

    /// Classify every tracked realtime symbol. Watermarks are snapshotted
    /// first so ledger IO happens outside the lock.
    pub fn check_all_track_b(&self, now: DateTime<Utc>) -> Vec<GapEvent> {
        let snapshot: Vec<(String, DateTime<Utc>)> = self
            .track_b_seen
            .read()
            .iter()
            .map(|(symbol, seen)| (symbol.clone(), *seen))
            .collect();
        snapshot
            .into_iter()
            .filter_map(|(symbol, seen)| self.evaluate(GapTrack::TrackB, Some(symbol), seen, now))
            .collect()
    }

    pub fn status(&self, now: DateTime<Utc>) -> GapStatus {
        let track_a_last_update = *self.track_a_seen.read();
        GapStatus {
            track_a_last_update,
            track_a_age_secs: track_a_last_update
                .map(|seen| (now - seen).num_milliseconds() as f64 / 1000.0),
            track_b_tracked_symbols: self.track_b_seen.read().len(),
            minor_total: self.metrics.minor.load(Ordering::Relaxed),
            major_total: self.metrics.major.load(Ordering::Relaxed),
            critical_total: self.metrics.critical.load(Ordering::Relaxed),
        }
    }

    fn evaluate(
        &self,
        track: GapTrack,
        symbol: Option<String>,
        seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<GapEvent> {
        let thresholds = match track {
            GapTrack::TrackA => &self.config.track_a,
            GapTrack::TrackB => &self.config.track_b,
        };
        let gap_seconds = (now - seen).num_milliseconds() as f64 / 1000.0;
        let gap_type = classify(thresholds, gap_seconds)?;
        let event = GapEvent {
            track,
            symbol,
            gap_seconds,
            gap_type,
            expected_interval_seconds: thresholds.expected_interval_secs,
            detected_at: now.with_timezone(&self.config.tz).fixed_offset(),
        };
        self.record(&event, now);
        Some(event)
    }

    fn record(&self, event: &GapEvent, now: DateTime<Utc>) {
        match event.gap_type {
            GapType::Minor => {
                self.metrics.minor.fetch_add(1, Ordering::Relaxed);
                info!(
                    track = %event.track,
                    symbol = event.symbol.as_deref().unwrap_or("-"),
                    gap_seconds = event.gap_seconds,
                    "minor data gap"
                );
            }
            GapType::Major => {
                self.metrics.major.fetch_add(1, Ordering::Relaxed);
                warn!(
                    track = %event.track,
                    symbol = event.symbol.as_deref().unwrap_or("-"),
                    gap_seconds = event.gap_seconds,
                    "major data gap"
                );
            }
            GapType::Critical => {
                self.metrics.critical.fetch_add(1, Ordering::Relaxed);
                error!(
                    track = %event.track,
                    symbol = event.symbol.as_deref().unwrap_or("-"),
                    gap_seconds = event.gap_seconds,
                    "critical data gap"
                );
            }
        }
        if let Err(e) = self.gap_ledger.append(event, now) {
            warn!(error = %e, "gap ledger write failed");
        } else {
            debug!(track = %event.track, gap_type = %event.gap_type, "gap event ledgered");
        }
    }
}

fn classify(thresholds: &GapThresholds, gap_secs: f64) -> Option<GapType> {
    if gap_secs >= thresholds.critical_secs {
        Some(GapType::Critical)
    } else if gap_secs >= thresholds.major_secs {
        Some(GapType::Major)
    } else if gap_secs >= thresholds.minor_secs {
        Some(GapType::Minor)
    } else {
        None
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn detector() -> (GapDetector, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let det = GapDetector::new(GapConfig::default(), dir.path()).unwrap();
        (det, dir)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 0, 30, 0).unwrap()
    }

    fn after_ms(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    #[test]
    fn test_no_baseline_is_never_a_gap() {
        let (det, _dir) = detector();
        assert!(det.check_track_a(t0()).is_none());
        assert!(det.check_track_b("005930", t0()).is_none());
        assert!(det.check_all_track_b(t0()).is_empty());
    }

    #[test]
    fn test_track_a_tier_boundaries() {
        let (det, _dir) = detector();
        det.update_track_a(t0());

        assert!(det.check_track_a(after_ms(659_900)).is_none());
        assert_eq!(
            det.check_track_a(after_ms(660_000)).unwrap().gap_type,
            GapType::Minor
        );
        assert_eq!(
            det.check_track_a(after_ms(899_900)).unwrap().gap_type,
            GapType::Minor
        );
        assert_eq!(
            det.check_track_a(after_ms(900_000)).unwrap().gap_type,
            GapType::Major
        );
        assert_eq!(
            det.check_track_a(after_ms(1_799_900)).unwrap().gap_type,
            GapType::Major
        );
        assert_eq!(
            det.check_track_a(after_ms(1_800_000)).unwrap().gap_type,
            GapType::Critical
        );
    }

    #[test]
    fn test_track_b_tier_boundaries() {
        let (det, _dir) = detector();
        det.update_track_b("005930", t0());

        assert!(det.check_track_b("005930", after_ms(9_900)).is_none());
        assert_eq!(
            det.check_track_b("005930", after_ms(10_000)).unwrap().gap_type,
            GapType::Minor
        );
        assert_eq!(
            det.check_track_b("005930", after_ms(59_900)).unwrap().gap_type,
            GapType::Minor
        );
        assert_eq!(
            det.check_track_b("005930", after_ms(60_000)).unwrap().gap_type,
            GapType::Major
        );
        assert_eq!(
            det.check_track_b("005930", after_ms(299_900)).unwrap().gap_type,
            GapType::Major
        );
        assert_eq!(
            det.check_track_b("005930", after_ms(300_000)).unwrap().gap_type,
            GapType::Critical
        );
    }

    #[test]
    fn test_fresh_update_clears_classification() {
        let (det, _dir) = detector();
        det.update_track_b("005930", t0());
        assert!(det.check_track_b("005930", after_ms(70_000)).is_some());

        det.update_track_b("005930", after_ms(70_000));
        assert!(det.check_track_b("005930", after_ms(71_000)).is_none());
    }

    #[test]
    fn test_remove_symbol_stops_tracking() {
        let (det, _dir) = detector();
        det.update_track_b("005930", t0());
        assert!(det.remove_symbol("005930"));
        assert!(!det.remove_symbol("005930"));
        assert!(det.check_track_b("005930", after_ms(999_000)).is_none());
        assert_eq!(det.status(t0()).track_b_tracked_symbols, 0);
    }

    #[test]
    fn test_check_all_reports_only_gapped_symbols() {
        let (det, _dir) = detector();
        det.update_track_b("005930", t0());
        det.update_track_b("000660", after_ms(58_000));

        // At +60s: 005930 is 60s stale (major), 000660 only 2s (fine).
        let events = det.check_all_track_b(after_ms(60_000));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].symbol.as_deref(), Some("005930"));
        assert_eq!(events[0].gap_type, GapType::Major);
    }

    #[test]
    fn test_events_are_ledgered() {
        let (det, _dir) = detector();
        det.update_track_a(t0());
        det.update_track_b("005930", t0());

        det.check_track_a(after_ms(1_900_000));
        det.check_track_b("005930", after_ms(12_000));

        let path = det.gap_ledger.path_for(after_ms(12_000));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["track"], "track_a");
        assert_eq!(first["gap_type"], "critical");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["symbol"], "005930");
        assert_eq!(second["gap_type"], "minor");
    }

    #[test]
    fn test_status_counts_by_tier() {
        let (det, _dir) = detector();
        det.update_track_a(t0());
        det.check_track_a(after_ms(700_000));
        det.check_track_a(after_ms(1_000_000));
        det.check_track_a(after_ms(1_900_000));

        let status = det.status(after_ms(1_900_000));
        assert_eq!(status.minor_total, 1);
        assert_eq!(status.major_total, 1);
        assert_eq!(status.critical_total, 1);
        assert_eq!(status.track_a_age_secs, Some(1900.0));
    }
}
