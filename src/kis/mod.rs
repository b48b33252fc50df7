//! KIS OpenAPI integration: OAuth/approval-key auth, rate-limited REST
//! boundary, and the realtime websocket client.

pub mod auth;
pub mod rate_limit;
pub mod rest;
pub mod wire;
pub mod ws;

pub use auth::{AuthConfig, KisAuth};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use rest::KisRestClient;
pub use ws::{KisWsClient, WsConfig};

use anyhow::Result;
use async_trait::async_trait;

/// Token + approval-key provider seam. The websocket client and the token
/// lifecycle manager both reach auth through this trait so tests can
/// substitute recording fakes.
#[async_trait]
pub trait BrokerAuth: Send + Sync {
    /// Valid bearer token, refreshing first if absent or near expiry.
    async fn ensure_token(&self) -> Result<String>;
    /// Unconditional token rotation; drops the cached approval key.
    async fn force_refresh(&self) -> Result<()>;
    /// Websocket approval key, fetched once and cached for the session.
    async fn get_approval_key(&self) -> Result<String>;
}

pub const REST_BASE_REAL: &str = "https://openapi.koreainvestment.com:9443";
pub const REST_BASE_VIRTUAL: &str = "https://openapivts.koreainvestment.com:29443";

pub const WS_URL_REAL: &str = "ws://ops.koreainvestment.com:21000";
pub const WS_URL_VIRTUAL: &str = "ws://ops.koreainvestment.com:31000";
pub const WS_URL_LEGACY: &str = "wss://openapi.koreainvestment.com:9443/websocket";

/// Realtime execution feed for domestic equities.
pub const TR_ID_EXECUTION: &str = "H0STCNT0";
