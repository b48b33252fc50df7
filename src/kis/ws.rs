//! KIS Realtime WebSocket Session
//!
//! Fault-tolerant client for the realtime execution feed:
//! - State machine with well-defined transitions
//! - Candidate endpoints tried in order (override, mode default, legacy)
//! - Exponential backoff with a hard cap and a bounded retry budget
//! - Subscription replay after reconnect (subscribed plus pending, deduped)
//! - Dual wire format decode with per-record fault isolation
//!
//! The gateway admits a fixed number of concurrent subscriptions per
//! session, enforced here before any control message is sent.

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::wire::{self, DecodedFrame, WireError};
use super::{BrokerAuth, TR_ID_EXECUTION, WS_URL_LEGACY, WS_URL_REAL, WS_URL_VIRTUAL};
use crate::models::PriceUpdate;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub type PriceCallback = Arc<dyn Fn(PriceUpdate) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Explicit endpoint; when set it is dialed before the mode defaults.
    pub url_override: Option<String>,
    pub virtual_mode: bool,
    /// Concurrent subscription cap enforced by the gateway.
    pub max_subscriptions: usize,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Pause between control sends while replaying subscriptions.
    pub resubscribe_spacing_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url_override: None,
            virtual_mode: false,
            max_subscriptions: 41,
            max_retries: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            resubscribe_spacing_ms: 100,
        }
    }
}

impl WsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            url_override: std::env::var("KIS_WEBSOCKET_URL").ok(),
            virtual_mode: std::env::var("KIS_VIRTUAL")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_subscriptions: std::env::var("MAX_SUBSCRIPTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_subscriptions),
            max_retries: std::env::var("WS_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_retries),
            initial_delay_ms: std::env::var("WS_INITIAL_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.initial_delay_ms),
            max_delay_ms: std::env::var("WS_MAX_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_delay_ms),
            resubscribe_spacing_ms: std::env::var("WS_RESUBSCRIBE_SPACING_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.resubscribe_spacing_ms),
        }
    }

    /// Endpoints in dial order: override first, then the mode default,
    /// then the legacy gateway.
    pub fn candidates(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(url) = &self.url_override {
            urls.push(url.clone());
        }
        urls.push(
            if self.virtual_mode {
                WS_URL_VIRTUAL
            } else {
                WS_URL_REAL
            }
            .to_string(),
        );
        urls.push(WS_URL_LEGACY.to_string());
        urls
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// RECONNECT BACKOFF
// =============================================================================

/// delay = min(initial * 2^retry_count, max). The count advances on each
/// failed attempt and resets only on a confirmed successful connect.
#[derive(Debug)]
struct ReconnectBackoff {
    initial_ms: u64,
    max_ms: u64,
    max_retries: u32,
    retry_count: u32,
}

impl ReconnectBackoff {
    fn new(config: &WsConfig) -> Self {
        Self {
            initial_ms: config.initial_delay_ms,
            max_ms: config.max_delay_ms,
            max_retries: config.max_retries,
            retry_count: 0,
        }
    }

    fn next_delay(&self) -> Duration {
        let exp = self
            .initial_ms
            .saturating_mul(2u64.saturating_pow(self.retry_count));
        Duration::from_millis(exp.min(self.max_ms))
    }

    fn record_failure(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    fn exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    fn reset(&mut self) {
        self.retry_count = 0;
    }
}

// =============================================================================
// STREAM METRICS
// =============================================================================

#[derive(Debug, Default)]
pub struct StreamMetrics {
    frames_received: AtomicU64,
    price_updates: AtomicU64,
    pingpongs_answered: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl StreamMetrics {
    #[inline]
    fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_price_update(&self) {
        self.price_updates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_pingpong(&self) {
        self.pingpongs_answered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn price_updates_total(&self) -> u64 {
        self.price_updates.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "frames={} prices={} pingpong={} decode_errors={} reconnects={}",
            self.frames_received.load(Ordering::Relaxed),
            self.price_updates.load(Ordering::Relaxed),
            self.pingpongs_answered.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
        )
    }
}

#[derive(Default)]
struct Callbacks {
    on_price_update: RwLock<Option<PriceCallback>>,
    on_connection: RwLock<Option<EventCallback>>,
    on_disconnection: RwLock<Option<EventCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

// =============================================================================
// WEBSOCKET CLIENT
// =============================================================================

pub struct KisWsClient {
    config: WsConfig,
    auth: Arc<dyn BrokerAuth>,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<WsSink>>,
    /// Serializes connect/disconnect so competing callers cannot interleave
    /// teardown with dialing.
    session_lock: Mutex<()>,
    subscribed: RwLock<HashSet<String>>,
    pending: RwLock<HashSet<String>>,
    backoff: SyncMutex<ReconnectBackoff>,
    recv_task: SyncMutex<Option<JoinHandle<()>>>,
    /// Bumped on every connect/disconnect; stale receive and reconnect
    /// tasks notice and exit instead of acting on a dead session.
    generation: AtomicU64,
    callbacks: Callbacks,
    metrics: StreamMetrics,
}

impl KisWsClient {
    pub fn new(config: WsConfig, auth: Arc<dyn BrokerAuth>) -> Self {
        let backoff = ReconnectBackoff::new(&config);
        Self {
            config,
            auth,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: Mutex::new(None),
            session_lock: Mutex::new(()),
            subscribed: RwLock::new(HashSet::new()),
            pending: RwLock::new(HashSet::new()),
            backoff: SyncMutex::new(backoff),
            recv_task: SyncMutex::new(None),
            generation: AtomicU64::new(0),
            callbacks: Callbacks::default(),
            metrics: StreamMetrics::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.read().len()
    }

    pub fn available_subscriptions(&self) -> usize {
        self.config
            .max_subscriptions
            .saturating_sub(self.subscription_count())
    }

    /// Sorted snapshot of the active subscription set.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.subscribed.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    pub fn set_on_price_update(&self, cb: impl Fn(PriceUpdate) + Send + Sync + 'static) {
        *self.callbacks.on_price_update.write() = Some(Arc::new(cb));
    }

    pub fn set_on_connection(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.callbacks.on_connection.write() = Some(Arc::new(cb));
    }

    pub fn set_on_disconnection(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.callbacks.on_disconnection.write() = Some(Arc::new(cb));
    }

    pub fn set_on_error(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.callbacks.on_error.write() = Some(Arc::new(cb));
    }

    /// Dial the candidate endpoints in order; the first that answers wins.
    /// Idempotent while connected. On success the backoff resets, the
    /// receive loop starts, and queued subscriptions are replayed.
    pub async fn connect(self: Arc<Self>) -> Result<()> {
        let _guard = self.session_lock.lock().await;
        if self.is_connected() {
            debug!("connect requested while already connected");
            return Ok(());
        }
        self.transition(ConnectionState::Connecting, "connect requested");

        // Credentials before dialing: the gateway drops unsigned sessions.
        if let Err(e) = self.auth.ensure_token().await {
            return self.connect_failed(format!("token unavailable: {e:#}"));
        }
        if let Err(e) = self.auth.get_approval_key().await {
            return self.connect_failed(format!("approval key unavailable: {e:#}"));
        }

        let mut stream = None;
        for url in self.config.candidates() {
            info!(endpoint = %url, "🔌 dialing websocket endpoint");
            match connect_async(url.as_str()).await {
                Ok((ws, _resp)) => {
                    info!(endpoint = %url, "✅ websocket connected");
                    stream = Some(ws);
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %url, error = %e, "websocket endpoint failed");
                }
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => return self.connect_failed("unable to connect to any websocket endpoint".to_string()),
        };

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.backoff.lock().reset();
        self.transition(ConnectionState::Connected, "endpoint accepted");

        let handle = tokio::spawn(Arc::clone(&self).run_receive(source, generation));
        if let Some(previous) = self.recv_task.lock().replace(handle) {
            previous.abort();
        }

        self.fire_connection();
        self.replay_subscriptions().await;
        Ok(())
    }

    /// Tear the session down and clear both subscription sets. Safe to
    /// call when already disconnected.
    pub async fn disconnect(&self) {
        let _guard = self.session_lock.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        let had_connection = {
            let mut writer = self.writer.lock().await;
            match writer.take() {
                Some(mut sink) => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    true
                }
                None => false,
            }
        };
        self.subscribed.write().clear();
        self.pending.write().clear();
        if self.state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected, "client disconnect");
        }
        if had_connection {
            self.fire_disconnection();
        }
    }

    /// Subscribe to the realtime execution feed for `symbol`.
    ///
    /// Returns false when the cap is reached, when the send fails, or when
    /// disconnected (the symbol is then queued for replay on reconnect).
    pub async fn subscribe(&self, symbol: &str) -> bool {
        if self.subscribed.read().contains(symbol) {
            return true;
        }
        if self.subscription_count() >= self.config.max_subscriptions {
            warn!(
                symbol = %symbol,
                max = self.config.max_subscriptions,
                "subscription limit reached"
            );
            return false;
        }
        if !self.is_connected() {
            self.pending.write().insert(symbol.to_string());
            debug!(symbol = %symbol, "queued subscription until connect");
            return false;
        }

        let approval_key = match self.auth.get_approval_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "approval key unavailable for subscribe");
                return false;
            }
        };
        let msg = wire::control_message(&approval_key, TR_ID_EXECUTION, symbol, true);
        match self.send_text(msg).await {
            Ok(()) => {
                self.subscribed.write().insert(symbol.to_string());
                self.pending.write().remove(symbol);
                info!(
                    symbol = %symbol,
                    total = self.subscription_count(),
                    "📡 subscribed"
                );
                true
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "subscribe send failed");
                false
            }
        }
    }

    /// Drop the subscription for `symbol`. Idempotent: unknown symbols
    /// return true.
    pub async fn unsubscribe(&self, symbol: &str) -> bool {
        if !self.subscribed.read().contains(symbol) {
            self.pending.write().remove(symbol);
            return true;
        }
        if !self.is_connected() {
            self.subscribed.write().remove(symbol);
            self.pending.write().remove(symbol);
            return true;
        }

        let approval_key = match self.auth.get_approval_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "approval key unavailable for unsubscribe");
                return false;
            }
        };
        let msg = wire::control_message(&approval_key, TR_ID_EXECUTION, symbol, false);
        match self.send_text(msg).await {
            Ok(()) => {
                self.subscribed.write().remove(symbol);
                info!(symbol = %symbol, total = self.subscription_count(), "unsubscribed");
                true
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "unsubscribe send failed");
                false
            }
        }
    }

    /// Unsubscribe every active symbol; returns how many succeeded.
    pub async fn unsubscribe_all(&self) -> usize {
        let symbols = self.subscribed_symbols();
        let mut dropped = 0;
        for symbol in symbols {
            if self.unsubscribe(&symbol).await {
                dropped += 1;
            }
        }
        dropped
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    fn connect_failed(&self, reason: String) -> Result<()> {
        self.transition(ConnectionState::Disconnected, "connect failed");
        error!(reason = %reason, "websocket connect failed");
        self.fire_error(&reason);
        bail!(reason)
    }

    /// Replay subscribed plus pending through `subscribe`, deduped, with a
    /// fixed pause between control sends. Both sets are drained first so
    /// the cap and membership rules are re-applied from scratch.
    async fn replay_subscriptions(&self) {
        let mut union: Vec<String> = {
            let mut subscribed = self.subscribed.write();
            let mut pending = self.pending.write();
            let set: HashSet<String> = subscribed.drain().chain(pending.drain()).collect();
            set.into_iter().collect()
        };
        if union.is_empty() {
            return;
        }
        union.sort();
        info!(count = union.len(), "replaying subscriptions");
        for symbol in union {
            if !self.subscribe(&symbol).await {
                warn!(symbol = %symbol, "subscription replay failed");
            }
            sleep(Duration::from_millis(self.config.resubscribe_spacing_ms)).await;
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text))
                .await
                .context("websocket send"),
            None => bail!("websocket writer not available"),
        }
    }

    async fn run_receive(self: Arc<Self>, mut source: WsSource, generation: u64) {
        loop {
            let msg = source.next().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("stale receive loop exiting");
                return;
            }
            match msg {
                Some(Ok(message)) => self.handle_message(message).await,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read error");
                    break;
                }
                None => {
                    warn!("websocket stream ended by server");
                    break;
                }
            }
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.connection_lost(generation).await;
    }

    async fn handle_message(&self, message: Message) {
        match message {
            Message::Text(text) => {
                self.handle_decoded(wire::decode_text(&text, chrono::Utc::now()))
                    .await
            }
            Message::Binary(bytes) => {
                self.handle_decoded(wire::decode_binary(&bytes, chrono::Utc::now()))
                    .await
            }
            Message::Ping(payload) => {
                let mut writer = self.writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
            }
            Message::Close(frame) => {
                info!(frame = ?frame, "close frame received");
            }
            Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    async fn handle_decoded(&self, decoded: Result<DecodedFrame, WireError>) {
        self.metrics.record_frame();
        match decoded {
            Ok(DecodedFrame::PingPong) => {
                self.metrics.record_pingpong();
                if let Err(e) = self.send_text(wire::PINGPONG.to_string()).await {
                    warn!(error = %e, "keep-alive echo failed");
                }
            }
            Ok(DecodedFrame::Prices(updates)) => {
                let cb = self.callbacks.on_price_update.read().clone();
                for update in updates {
                    self.metrics.record_price_update();
                    if let Some(cb) = &cb {
                        cb(update);
                    }
                }
            }
            Ok(DecodedFrame::Ack {
                tr_id,
                code,
                message,
            }) => {
                if code == "0" {
                    info!(tr_id = %tr_id, msg = %message, "subscription ack");
                } else {
                    warn!(tr_id = %tr_id, code = %code, msg = %message, "subscription nack");
                }
            }
            Ok(DecodedFrame::Ignored) => {}
            Err(e) => {
                self.metrics.record_decode_error();
                warn!(error = %e, "frame decode failed, dropping frame");
            }
        }
    }

    /// Unexpected stream loss: report it and hand over to the reconnect
    /// loop. Subscription sets are kept for replay.
    async fn connection_lost(self: Arc<Self>, generation: u64) {
        self.transition(ConnectionState::Disconnected, "connection lost");
        *self.writer.lock().await = None;
        self.fire_disconnection();
        tokio::spawn(self.run_reconnect(generation));
    }

    /// Bounded retry loop. Gives up for good once the budget is spent;
    /// recovery past that point belongs to the operator path.
    ///
    /// Boxed future: the reconnect loop awaits `connect`, which spawns the
    /// receive loop, which spawns this — type erasure here breaks the
    /// otherwise cyclic `Send` computation on the opaque future types.
    fn run_reconnect(
        self: Arc<Self>,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.transition(ConnectionState::Reconnecting, "scheduling reconnect");
            loop {
                if self.generation.load(Ordering::SeqCst) != generation {
                    debug!("reconnect loop superseded");
                    return;
                }
                let (delay, attempt, exhausted) = {
                    let backoff = self.backoff.lock();
                    (backoff.next_delay(), backoff.attempt(), backoff.exhausted())
                };
                if exhausted {
                    self.transition(ConnectionState::Disconnected, "retries exhausted");
                    error!(
                        retries = self.config.max_retries,
                        "max reconnection attempts exceeded, giving up"
                    );
                    self.fire_error("max reconnection attempts exceeded");
                    return;
                }
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after backoff"
                );
                sleep(delay).await;
                if self.generation.load(Ordering::SeqCst) != generation {
                    debug!("reconnect loop superseded");
                    return;
                }
                match Arc::clone(&self).connect().await {
                    Ok(()) => {
                        self.metrics.record_reconnect();
                        info!("✅ reconnected");
                        return;
                    }
                    Err(e) => {
                        self.backoff.lock().record_failure();
                        warn!(error = %e, "reconnect attempt failed");
                    }
                }
            }
        })
    }

    fn transition(&self, new: ConnectionState, reason: &str) {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            info!(from = %old, to = %new, reason = %reason, "ws_transition");
        }
    }

    fn fire_connection(&self) {
        if let Some(cb) = self.callbacks.on_connection.read().clone() {
            cb();
        }
    }

    fn fire_disconnection(&self) {
        if let Some(cb) = self.callbacks.on_disconnection.read().clone() {
            cb();
        }
    }

    fn fire_error(&self, message: &str) {
        if let Some(cb) = self.callbacks.on_error.read().clone() {
            cb(message);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticAuth;

    #[async_trait]
    impl BrokerAuth for StaticAuth {
        async fn ensure_token(&self) -> Result<String> {
            Ok("token".to_string())
        }
        async fn force_refresh(&self) -> Result<()> {
            Ok(())
        }
        async fn get_approval_key(&self) -> Result<String> {
            Ok("approval".to_string())
        }
    }

    fn client(config: WsConfig) -> Arc<KisWsClient> {
        Arc::new(KisWsClient::new(config, Arc::new(StaticAuth)))
    }

    #[test]
    fn test_backoff_series_doubles_to_cap() {
        let config = WsConfig {
            max_retries: 10,
            ..WsConfig::default()
        };
        let mut backoff = ReconnectBackoff::new(&config);
        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.next_delay().as_secs());
            backoff.record_failure();
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_resets_only_on_success() {
        let config = WsConfig::default();
        let mut backoff = ReconnectBackoff::new(&config);
        for _ in 0..5 {
            backoff.record_failure();
        }
        assert!(backoff.exhausted());
        backoff.reset();
        assert!(!backoff.exhausted());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_candidate_order() {
        let real = WsConfig::default();
        assert_eq!(real.candidates(), vec![WS_URL_REAL, WS_URL_LEGACY]);

        let virt = WsConfig {
            virtual_mode: true,
            ..WsConfig::default()
        };
        assert_eq!(virt.candidates(), vec![WS_URL_VIRTUAL, WS_URL_LEGACY]);

        let overridden = WsConfig {
            url_override: Some("ws://127.0.0.1:9000".to_string()),
            ..WsConfig::default()
        };
        assert_eq!(
            overridden.candidates(),
            vec!["ws://127.0.0.1:9000", WS_URL_REAL, WS_URL_LEGACY]
        );
    }

    #[test]
    fn test_state_display_is_snake_case() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected_queues_pending() {
        let client = client(WsConfig::default());
        assert!(!client.subscribe("005930").await);
        assert_eq!(client.subscription_count(), 0);
        assert_eq!(client.pending_count(), 1);

        // Queueing is idempotent too.
        assert!(!client.subscribe("005930").await);
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_refused_at_cap() {
        let client = client(WsConfig {
            max_subscriptions: 2,
            ..WsConfig::default()
        });
        {
            let mut subscribed = client.subscribed.write();
            subscribed.insert("005930".to_string());
            subscribed.insert("000660".to_string());
        }
        assert!(!client.subscribe("035720").await);
        assert_eq!(client.pending_count(), 0);
        // Existing membership still reports success.
        assert!(client.subscribe("005930").await);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_symbol_is_true() {
        let client = client(WsConfig::default());
        assert!(client.unsubscribe("005930").await);
    }

    #[tokio::test]
    async fn test_unsubscribe_while_disconnected_clears_sets() {
        let client = client(WsConfig::default());
        client.subscribed.write().insert("005930".to_string());
        client.pending.write().insert("000660".to_string());

        assert!(client.unsubscribe("005930").await);
        assert_eq!(client.subscription_count(), 0);
        assert!(client.unsubscribe("000660").await);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_available_subscriptions() {
        let client = client(WsConfig {
            max_subscriptions: 3,
            ..WsConfig::default()
        });
        assert_eq!(client.available_subscriptions(), 3);
        client.subscribed.write().insert("005930".to_string());
        assert_eq!(client.available_subscriptions(), 2);
    }
}
