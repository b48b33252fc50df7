//! Thin REST boundary: current-price quotes over the KIS Open API.
//!
//! Every call passes through the shared rate limiter before it touches
//! the wire, so REST traffic can never starve the gateway quota.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{BrokerAuth, KisAuth, RateLimiter};
use crate::models::PriceSnapshot;

/// Domestic equity current-price inquiry.
const TR_ID_CURRENT_PRICE: &str = "FHKST01010100";
/// Market division for the KOSPI/KOSDAQ cash market.
const MARKET_DIV_STOCK: &str = "J";

pub struct KisRestClient {
    auth: Arc<KisAuth>,
    limiter: Arc<RateLimiter>,
    http: reqwest::Client,
}

impl KisRestClient {
    pub fn new(auth: Arc<KisAuth>, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building rest http client")?;
        Ok(Self {
            auth,
            limiter,
            http,
        })
    }

    /// A token in hand is what makes the REST side usable.
    pub async fn ready(&self) -> bool {
        self.auth.ensure_token().await.is_ok()
    }

    /// Fetch the latest traded price for a symbol.
    pub async fn fetch_current_price(&self, symbol: &str) -> Result<PriceSnapshot> {
        self.limiter.acquire().await;
        let headers = self.auth.auth_headers(TR_ID_CURRENT_PRICE).await?;
        let url = format!(
            "{}/uapi/domestic-stock/v1/quotations/inquire-price",
            self.auth.base_url()
        );
        let resp = self
            .http
            .get(&url)
            .headers(headers)
            .query(&[
                ("FID_COND_MRKT_DIV_CODE", MARKET_DIV_STOCK),
                ("FID_INPUT_ISCD", symbol),
            ])
            .send()
            .await
            .context("current price request failed")?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .context("current price response was not json")?;
        if !status.is_success() {
            bail!("quote endpoint returned {status}: {payload}");
        }
        let rt_cd = payload.get("rt_cd").and_then(|v| v.as_str()).unwrap_or("");
        if rt_cd != "0" {
            let msg = payload
                .get("msg1")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            bail!("quote rejected for {symbol}: {msg}");
        }
        let output = payload
            .get("output")
            .context("quote response missing output")?;
        debug!(symbol = %symbol, "quote fetched");

        Ok(PriceSnapshot {
            symbol: symbol.to_string(),
            price: output_i64(output, "stck_prpr"),
            change_sign: output_i64(output, "prdy_vrss_sign") as i32,
            change_amount: output_i64(output, "prdy_vrss"),
            volume: output_i64(output, "acml_vol"),
            timestamp: Utc::now(),
        })
    }
}

/// KIS sends numbers as strings; absent or malformed fields read as zero.
fn output_i64(output: &Value, key: &str) -> i64 {
    match output.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}
