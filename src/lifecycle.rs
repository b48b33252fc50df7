//! Token/Session Lifecycle Manager
//!
//! Keeps the broker credential fresh without losing stream state:
//! - Polling loop that wakes on a fixed interval and evaluates triggers
//! - Scheduled pre-market refresh inside a wall-clock window, at most
//!   once per exchange-local calendar day
//! - Proactive refresh once the credential age crosses a threshold
//! - Coordinated stop -> refresh -> start -> restore sequence
//! - Emergency ladder for reactive refresh on auth rejections
//!
//! The restart sequence is order-dependent: refreshing while the old
//! connection is live can invalidate in-flight subscriptions, and
//! resubscribing before the new connection is confirmed risks silent
//! loss.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::engine::StreamSession;
use crate::kis::BrokerAuth;

/// The scheduled trigger stays armed for this long past the target time.
const REFRESH_WINDOW_MINUTES: i64 = 5;
/// Pause between control sends while restoring snapshotted symbols.
const RESTORE_SPACING: Duration = Duration::from_millis(250);

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Exchange-local wall-clock time of the scheduled refresh.
    pub refresh_time: NaiveTime,
    pub proactive_refresh_hours: i64,
    pub check_interval_secs: u64,
    pub emergency_attempts: u32,
    pub emergency_base_delay_secs: u64,
    pub tz: Tz,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_time: NaiveTime::from_hms_opt(8, 30, 0).unwrap_or_default(),
            proactive_refresh_hours: 23,
            check_interval_secs: 300,
            emergency_attempts: 3,
            emergency_base_delay_secs: 30,
            tz: chrono_tz::Asia::Seoul,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            refresh_time: std::env::var("PREMARKET_REFRESH_TIME")
                .ok()
                .and_then(|v| NaiveTime::parse_from_str(&v, "%H:%M").ok())
                .unwrap_or(d.refresh_time),
            proactive_refresh_hours: std::env::var("PROACTIVE_REFRESH_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.proactive_refresh_hours),
            check_interval_secs: std::env::var("TOKEN_CHECK_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.check_interval_secs),
            emergency_attempts: std::env::var("EMERGENCY_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.emergency_attempts),
            emergency_base_delay_secs: std::env::var("EMERGENCY_RETRY_DELAY_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.emergency_base_delay_secs),
            tz: std::env::var("EXCHANGE_TZ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.tz),
        }
    }
}

// =============================================================================
// METRICS
// =============================================================================

#[derive(Debug, Default)]
struct LifecycleMetrics {
    scheduled_refreshes: AtomicU64,
    proactive_refreshes: AtomicU64,
    emergency_refreshes: AtomicU64,
    failed_refreshes: AtomicU64,
}

impl LifecycleMetrics {
    #[inline]
    fn record_scheduled(&self) {
        self.scheduled_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_proactive(&self) {
        self.proactive_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_emergency(&self) {
        self.emergency_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_failure(&self) {
        self.failed_refreshes.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub running: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub scheduled_refreshes: u64,
    pub proactive_refreshes: u64,
    pub emergency_refreshes: u64,
    pub failed_refreshes: u64,
}

// =============================================================================
// LIFECYCLE MANAGER
// =============================================================================

pub struct TokenLifecycleManager {
    config: LifecycleConfig,
    auth: Arc<dyn BrokerAuth>,
    engine: Arc<dyn StreamSession>,
    running: AtomicBool,
    /// Instant of the last fully successful coordinated refresh. The
    /// manager observes elapsed time only; it never holds token bytes.
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    on_error: RwLock<Option<Arc<dyn Fn(&str) + Send + Sync>>>,
    metrics: LifecycleMetrics,
}

impl TokenLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        auth: Arc<dyn BrokerAuth>,
        engine: Arc<dyn StreamSession>,
    ) -> Self {
        Self {
            config,
            auth,
            engine,
            running: AtomicBool::new(false),
            last_refresh: RwLock::new(None),
            on_error: RwLock::new(None),
            metrics: LifecycleMetrics::default(),
        }
    }

    pub fn set_on_error(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_error.write() = Some(Arc::new(cb));
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read()
    }

    pub fn status(&self) -> LifecycleStatus {
        LifecycleStatus {
            running: self.running.load(Ordering::SeqCst),
            last_refresh: self.last_refresh(),
            scheduled_refreshes: self.metrics.scheduled_refreshes.load(Ordering::Relaxed),
            proactive_refreshes: self.metrics.proactive_refreshes.load(Ordering::Relaxed),
            emergency_refreshes: self.metrics.emergency_refreshes.load(Ordering::Relaxed),
            failed_refreshes: self.metrics.failed_refreshes.load(Ordering::Relaxed),
        }
    }

    /// Polling loop. Runs until [`stop`](Self::stop); the stop flag is
    /// re-checked after every sleep so shutdown is cooperative.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("lifecycle loop already running");
            return;
        }
        info!(
            interval_secs = self.config.check_interval_secs,
            refresh_time = %self.config.refresh_time,
            tz = %self.config.tz,
            "token lifecycle loop started"
        );
        while self.running.load(Ordering::SeqCst) {
            sleep(Duration::from_secs(self.config.check_interval_secs)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.run_checks(Utc::now()).await;
        }
        info!("token lifecycle loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Evaluate both triggers in priority order: the scheduled window
    /// wins over the age threshold when both are due.
    pub async fn run_checks(&self, now: DateTime<Utc>) {
        if self.should_refresh_scheduled(now) {
            self.metrics.record_scheduled();
            if !self.execute_refresh("scheduled_premarket").await {
                self.metrics.record_failure();
            }
        } else if self.should_refresh_proactive(now) {
            self.metrics.record_proactive();
            if !self.execute_refresh("proactive_age").await {
                self.metrics.record_failure();
            }
        }
    }

    /// Inside the daily window, and not yet fired on this exchange-local
    /// calendar day.
    fn should_refresh_scheduled(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.config.tz);
        let start = self.config.refresh_time;
        let end = start + chrono::Duration::minutes(REFRESH_WINDOW_MINUTES);
        if local.time() < start || local.time() >= end {
            return false;
        }
        match *self.last_refresh.read() {
            None => true,
            Some(last) => {
                last.with_timezone(&self.config.tz).date_naive() != local.date_naive()
            }
        }
    }

    /// Credential age crossed the threshold, or no refresh has ever run.
    fn should_refresh_proactive(&self, now: DateTime<Utc>) -> bool {
        match *self.last_refresh.read() {
            None => true,
            Some(last) => {
                now.signed_duration_since(last)
                    >= chrono::Duration::hours(self.config.proactive_refresh_hours)
            }
        }
    }

    /// The coordinated restart sequence. Strictly ordered:
    /// snapshot -> stop -> force refresh -> start -> restore -> health.
    /// A failed start aborts without restoration; the system is left
    /// disconnected rather than subscribed against an unhealthy stream.
    pub async fn execute_refresh(&self, reason: &str) -> bool {
        info!(reason = %reason, "🔄 coordinated credential refresh starting");

        let snapshot = self.engine.list_active_symbols();
        info!(count = snapshot.len(), "subscription snapshot taken");

        self.engine.stop_stream().await;

        if let Err(e) = self.auth.force_refresh().await {
            error!(reason = %reason, error = %format!("{e:#}"), "credential refresh failed");
            self.fire_error(&format!("credential refresh failed: {e:#}"));
            return false;
        }

        if !self.engine.start_stream().await {
            error!(reason = %reason, "stream restart failed, leaving stream down");
            self.fire_error("stream restart failed after credential refresh");
            return false;
        }

        if !snapshot.is_empty() {
            let results = self.engine.subscribe_many(&snapshot, RESTORE_SPACING).await;
            let failed = results.values().filter(|ok| !**ok).count();
            if failed > 0 {
                warn!(failed, total = snapshot.len(), "some symbols did not restore");
            }
        }

        let health = self.engine.health().await;
        if !health.ws_connected {
            error!(reason = %reason, "health check reports stream down after refresh");
            self.fire_error("health check reports stream down after refresh");
            return false;
        }

        *self.last_refresh.write() = Some(Utc::now());
        info!(
            reason = %reason,
            restored = snapshot.len(),
            "✅ credential refresh complete"
        );
        true
    }

    /// Reactive ladder for auth rejections: retries `execute_refresh`
    /// with delays of base, 2x base, 4x base between attempts.
    pub async fn emergency_refresh(&self) -> bool {
        let attempts = self.config.emergency_attempts;
        for attempt in 1..=attempts {
            warn!(attempt, attempts, "🚨 emergency credential refresh");
            self.metrics.record_emergency();
            if self.execute_refresh("emergency_auth_rejection").await {
                return true;
            }
            self.metrics.record_failure();
            if attempt < attempts {
                let delay = self
                    .config
                    .emergency_base_delay_secs
                    .saturating_mul(2u64.saturating_pow(attempt - 1));
                warn!(delay_secs = delay, "emergency attempt failed, backing off");
                sleep(Duration::from_secs(delay)).await;
            }
        }
        error!(attempts, "emergency refresh exhausted all attempts");
        self.fire_error("emergency refresh exhausted all attempts");
        false
    }

    fn fire_error(&self, message: &str) {
        if let Some(cb) = self.on_error.read().clone() {
            cb(message);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
