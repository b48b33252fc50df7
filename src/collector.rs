//! Track B collector: the driver that ties slots, stream, and gap
//! watchdog together.
//!
//! - Consumes slot candidates from the trigger stage over a channel
//! - Allocation outcomes drive subscribe/unsubscribe on the stream,
//!   always in that order: the slot decision happens first
//! - Every realtime tick lands in the daily scalp ledger and advances
//!   the per-symbol watermark
//! - A periodic sweep classifies silence on both tracks

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::StreamSession;
use crate::gap::GapDetector;
use crate::ledger::DailyLedger;
use crate::models::{ScalpRecord, SlotCandidate};
use crate::slot::{SlotManager, SlotStats};

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct CollectorMetrics {
    candidates_processed: AtomicU64,
    subscriptions_issued: AtomicU64,
    evictions_unsubscribed: AtomicU64,
    scalp_records: AtomicU64,
}

impl CollectorMetrics {
    #[inline]
    fn record_candidate(&self) {
        self.candidates_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_subscription(&self) {
        self.subscriptions_issued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_eviction(&self) {
        self.evictions_unsubscribed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_scalp(&self) {
        self.scalp_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scalp_records_total(&self) -> u64 {
        self.scalp_records.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub slots: SlotStats,
    pub candidates_processed: u64,
    pub subscriptions_issued: u64,
    pub evictions_unsubscribed: u64,
    pub scalp_records: u64,
}

// =============================================================================
// COLLECTOR
// =============================================================================

pub struct TrackBCollector {
    slots: Arc<SlotManager>,
    gaps: Arc<GapDetector>,
    engine: Arc<dyn StreamSession>,
    scalp_ledger: Arc<DailyLedger>,
    /// Process startup stamp, written into every scalp row so a day file
    /// can be split back into runs.
    session_id: String,
    running: AtomicBool,
    metrics: Arc<CollectorMetrics>,
}

impl TrackBCollector {
    pub fn new(
        slots: Arc<SlotManager>,
        gaps: Arc<GapDetector>,
        engine: Arc<dyn StreamSession>,
        scalp_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let scalp_ledger = Arc::new(DailyLedger::new(scalp_dir, "")?);
        Ok(Self {
            slots,
            gaps,
            engine,
            scalp_ledger,
            session_id: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            running: AtomicBool::new(true),
            metrics: Arc::new(CollectorMetrics::default()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wire the stream's tick callback into the scalp ledger and the
    /// Track B watermark. The callback only appends and updates a map,
    /// keeping the receive loop unblocked.
    pub fn install_price_sink(&self) {
        let gaps = Arc::clone(&self.gaps);
        let ledger = Arc::clone(&self.scalp_ledger);
        let metrics = Arc::clone(&self.metrics);
        let session_id = self.session_id.clone();
        self.engine.on_price_update(Box::new(move |update| {
            gaps.update_track_b(&update.symbol, update.timestamp);
            let record = ScalpRecord {
                timestamp: update.timestamp,
                symbol: update.symbol,
                price: update.price,
                volume: update.acml_volume,
                source: update.source.to_string(),
                session_id: session_id.clone(),
            };
            match ledger.append(&record, record.timestamp) {
                Ok(()) => metrics.record_scalp(),
                Err(e) => warn!(symbol = %record.symbol, error = %e, "scalp ledger append failed"),
            }
        }));
    }

    /// Candidate intake loop. Owns the receiving end; exits when the
    /// trigger stage drops its sender or [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>, mut candidates: mpsc::Receiver<SlotCandidate>) {
        info!(session_id = %self.session_id, "collector started");
        while self.running.load(Ordering::SeqCst) {
            match candidates.recv().await {
                Some(candidate) => self.handle_candidate(candidate).await,
                None => {
                    info!("candidate channel closed");
                    break;
                }
            }
        }
        info!("collector stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One candidate through the slot path. The allocation decision comes
    /// first; only then is the stream told about evictions and additions.
    pub async fn handle_candidate(&self, candidate: SlotCandidate) {
        self.metrics.record_candidate();
        let assignment = self.slots.assign_slot(&candidate);

        if let Some(evicted) = &assignment.replaced {
            self.metrics.record_eviction();
            if !self.engine.unsubscribe(&evicted.symbol).await {
                warn!(symbol = %evicted.symbol, "unsubscribe after eviction failed");
            }
            self.gaps.remove_symbol(&evicted.symbol);
            info!(
                evicted = %evicted.symbol,
                replacement = %candidate.symbol,
                "eviction applied to stream"
            );
        }

        if assignment.assigned {
            // Idempotent when the symbol already streams; re-issuing also
            // heals a slot whose subscription was lost.
            self.metrics.record_subscription();
            if !self.engine.subscribe(&candidate.symbol).await {
                warn!(symbol = %candidate.symbol, "subscribe for allocated slot failed");
            }
        } else {
            debug!(
                symbol = %candidate.symbol,
                reason = %assignment.reason,
                "candidate not allocated"
            );
        }
    }

    /// Periodic silence sweep over both tracks. Events are ledgered by
    /// the detector itself; this loop only emits a per-tick summary.
    pub async fn run_gap_sweep(self: Arc<Self>) {
        let period = Duration::from_secs(self.gaps.config().check_interval_secs);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "gap sweep started");
        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let now = Utc::now();
            let track_a = self.gaps.check_track_a(now);
            let track_b = self.gaps.check_all_track_b(now);
            if track_a.is_none() && track_b.is_empty() {
                debug!("gap sweep clean");
            } else {
                warn!(
                    track_a_gap = track_a.is_some(),
                    track_b_gaps = track_b.len(),
                    "gap sweep found silent feeds"
                );
            }
        }
        info!("gap sweep stopped");
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            slots: self.slots.stats(),
            candidates_processed: self.metrics.candidates_processed.load(Ordering::Relaxed),
            subscriptions_issued: self.metrics.subscriptions_issued.load(Ordering::Relaxed),
            evictions_unsubscribed: self.metrics.evictions_unsubscribed.load(Ordering::Relaxed),
            scalp_records: self.metrics.scalp_records_total(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::GapConfig;
    use crate::models::{Health, PriceUpdate};
    use crate::slot::SlotConfig;
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingEngine {
        calls: Mutex<Vec<String>>,
        sink: RwLock<Option<Box<dyn Fn(PriceUpdate) + Send + Sync>>>,
    }

    #[async_trait]
    impl StreamSession for RecordingEngine {
        async fn start_stream(&self) -> bool {
            self.calls.lock().push("start".to_string());
            true
        }
        async fn stop_stream(&self) {
            self.calls.lock().push("stop".to_string());
        }
        async fn subscribe(&self, symbol: &str) -> bool {
            self.calls.lock().push(format!("subscribe:{symbol}"));
            true
        }
        async fn unsubscribe(&self, symbol: &str) -> bool {
            self.calls.lock().push(format!("unsubscribe:{symbol}"));
            true
        }
        async fn subscribe_many(
            &self,
            symbols: &[String],
            _spacing: Duration,
        ) -> HashMap<String, bool> {
            symbols.iter().map(|s| (s.clone(), true)).collect()
        }
        fn list_active_symbols(&self) -> Vec<String> {
            Vec::new()
        }
        fn on_price_update(&self, cb: Box<dyn Fn(PriceUpdate) + Send + Sync>) {
            *self.sink.write() = Some(cb);
        }
        async fn health(&self) -> Health {
            Health {
                mode: "real".to_string(),
                rest_ready: true,
                ws_connected: true,
                ws_subscriptions: 0,
                ws_available_slots: 41,
            }
        }
    }

    fn candidate(symbol: &str, priority: f64) -> SlotCandidate {
        SlotCandidate {
            symbol: symbol.to_string(),
            priority,
            trigger_type: "volume_spike".to_string(),
            detected_at: Utc::now(),
        }
    }

    fn tick(symbol: &str, price: i64) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.to_string(),
            execution_time: Some("093015".to_string()),
            price,
            change_sign: 2,
            change_amount: 100,
            change_rate: 0.14,
            open: price - 200,
            high: price + 300,
            low: price - 500,
            acml_volume: 123_456,
            acml_trade_value: 0,
            ask_price: price + 100,
            bid_price: price - 100,
            source: "ws_stream",
            timestamp: Utc::now(),
        }
    }

    struct Fixture {
        collector: Arc<TrackBCollector>,
        engine: Arc<RecordingEngine>,
        gaps: Arc<GapDetector>,
        _dir: tempfile::TempDir,
    }

    fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let slots = Arc::new(
            SlotManager::new(
                SlotConfig {
                    capacity,
                    min_dwell_secs: 0,
                },
                dir.path().join("system"),
            )
            .unwrap(),
        );
        let gaps =
            Arc::new(GapDetector::new(GapConfig::default(), dir.path().join("system")).unwrap());
        let engine = Arc::new(RecordingEngine::default());
        let collector = Arc::new(
            TrackBCollector::new(
                slots,
                Arc::clone(&gaps),
                engine.clone() as Arc<dyn StreamSession>,
                dir.path().join("scalp"),
            )
            .unwrap(),
        );
        Fixture {
            collector,
            engine,
            gaps,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_allocated_candidate_is_subscribed() {
        let fx = fixture(2);
        fx.collector.handle_candidate(candidate("005930", 0.8)).await;

        let calls = fx.engine.calls.lock().clone();
        assert_eq!(calls, vec!["subscribe:005930"]);
        let stats = fx.collector.stats();
        assert_eq!(stats.candidates_processed, 1);
        assert_eq!(stats.subscriptions_issued, 1);
    }

    #[tokio::test]
    async fn test_eviction_unsubscribes_and_drops_watermark() {
        let fx = fixture(1);
        fx.collector.handle_candidate(candidate("005930", 0.2)).await;
        fx.gaps.update_track_b("005930", Utc::now());

        fx.collector.handle_candidate(candidate("000660", 0.9)).await;

        let calls = fx.engine.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "subscribe:005930",
                "unsubscribe:005930",
                "subscribe:000660"
            ]
        );
        // The evicted symbol no longer has a watermark to alarm on.
        let far_future = Utc::now() + chrono::Duration::seconds(3600);
        assert!(fx.gaps.check_track_b("005930", far_future).is_none());
    }

    #[tokio::test]
    async fn test_overflow_leaves_stream_untouched() {
        let fx = fixture(1);
        fx.collector.handle_candidate(candidate("005930", 0.9)).await;
        // Lower priority cannot evict; no stream calls may follow.
        fx.collector.handle_candidate(candidate("000660", 0.1)).await;

        let calls = fx.engine.calls.lock().clone();
        assert_eq!(calls, vec!["subscribe:005930"]);
        assert_eq!(fx.collector.stats().evictions_unsubscribed, 0);
    }

    #[tokio::test]
    async fn test_price_sink_writes_scalp_and_watermark() {
        let fx = fixture(2);
        fx.collector.install_price_sink();

        let update = tick("005930", 70_200);
        let stamp = update.timestamp;
        {
            let sink = fx.engine.sink.read();
            let sink = sink.as_ref().unwrap();
            sink(update);
            sink(tick("005930", 70_300));
        }

        assert_eq!(fx.collector.stats().scalp_records, 2);
        // Fresh watermark: no gap right after a tick.
        assert!(fx.gaps.check_track_b("005930", stamp).is_none());

        let path = fx.collector.scalp_ledger.path_for(stamp);
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let row: ScalpRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row.symbol, "005930");
        assert_eq!(row.price, 70_200);
        assert_eq!(row.session_id, fx.collector.session_id());
    }
}
