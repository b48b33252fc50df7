//! Provider engine: the seam that wires auth, REST quotes, and the
//! realtime stream behind one lifecycle surface.
//!
//! The token lifecycle manager and the collector both talk to
//! [`StreamSession`], never to the websocket client directly, so the
//! whole stream side can be swapped for a mock in tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::kis::{KisRestClient, KisWsClient};
use crate::models::{Health, PriceUpdate};

/// Stream lifecycle surface consumed by the refresh and collection paths.
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Bring the realtime stream up. False means the stream stayed down.
    async fn start_stream(&self) -> bool;
    /// Drop all subscriptions and close the stream.
    async fn stop_stream(&self);
    async fn subscribe(&self, symbol: &str) -> bool;
    async fn unsubscribe(&self, symbol: &str) -> bool;
    /// Bulk subscribe with a pause between control sends; returns the
    /// per-symbol outcome.
    async fn subscribe_many(&self, symbols: &[String], spacing: Duration)
        -> HashMap<String, bool>;
    /// Snapshot of currently subscribed symbols.
    fn list_active_symbols(&self) -> Vec<String>;
    /// Install the tick sink. Runs on the stream receive loop, so the
    /// callback must stay cheap and non-blocking.
    fn on_price_update(&self, cb: Box<dyn Fn(PriceUpdate) + Send + Sync>);
    async fn health(&self) -> Health;
}

pub struct ProviderEngine {
    rest: Arc<KisRestClient>,
    ws: Arc<KisWsClient>,
    mode: &'static str,
}

impl ProviderEngine {
    pub fn new(rest: Arc<KisRestClient>, ws: Arc<KisWsClient>, virtual_mode: bool) -> Self {
        Self {
            rest,
            ws,
            mode: if virtual_mode { "virtual" } else { "real" },
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    pub fn rest(&self) -> &Arc<KisRestClient> {
        &self.rest
    }

    pub fn ws(&self) -> &Arc<KisWsClient> {
        &self.ws
    }
}

#[async_trait]
impl StreamSession for ProviderEngine {
    async fn start_stream(&self) -> bool {
        match Arc::clone(&self.ws).connect().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "stream start failed");
                false
            }
        }
    }

    async fn stop_stream(&self) {
        let dropped = self.ws.unsubscribe_all().await;
        self.ws.disconnect().await;
        info!(dropped, "stream stopped");
    }

    async fn subscribe(&self, symbol: &str) -> bool {
        self.ws.subscribe(symbol).await
    }

    async fn unsubscribe(&self, symbol: &str) -> bool {
        self.ws.unsubscribe(symbol).await
    }

    async fn subscribe_many(
        &self,
        symbols: &[String],
        spacing: Duration,
    ) -> HashMap<String, bool> {
        let mut results = HashMap::with_capacity(symbols.len());
        for symbol in symbols {
            let ok = self.ws.subscribe(symbol).await;
            results.insert(symbol.clone(), ok);
            sleep(spacing).await;
        }
        let succeeded = results.values().filter(|ok| **ok).count();
        info!(
            requested = symbols.len(),
            succeeded, "bulk subscription finished"
        );
        results
    }

    fn list_active_symbols(&self) -> Vec<String> {
        self.ws.subscribed_symbols()
    }

    fn on_price_update(&self, cb: Box<dyn Fn(PriceUpdate) + Send + Sync>) {
        self.ws.set_on_price_update(cb);
    }

    async fn health(&self) -> Health {
        Health {
            mode: self.mode.to_string(),
            rest_ready: self.rest.ready().await,
            ws_connected: self.ws.is_connected(),
            ws_subscriptions: self.ws.subscription_count(),
            ws_available_slots: self.ws.available_subscriptions(),
        }
    }
}
