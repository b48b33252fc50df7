//! OAuth session management for the KIS gateway.
//!
//! Token issuance is expensive and rate limited upstream, so tokens are
//! cached on disk and shared across collector processes:
//! - disk cache per account mode (`token_real.json` / `token_virtual.json`)
//! - create-if-absent lock file so exactly one process refreshes at a time;
//!   waiters poll the cache and adopt a token another process issued
//! - the EGW00133 rate-limit answer gets one long-wait retry
//! - the websocket approval key is fetched once and cached for the session

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::{BrokerAuth, REST_BASE_REAL, REST_BASE_VIRTUAL};

/// Tokens with less than this much life left are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 3600;

/// Upstream answer when token issuance itself is rate limited.
const RATE_LIMIT_CODE: &str = "EGW00133";
const RATE_LIMIT_WAIT_SECS: u64 = 65;

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub app_key: String,
    pub app_secret: String,
    pub base_url: String,
    pub virtual_mode: bool,
    pub cache_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub lock_wait_max_secs: u64,
    pub lock_poll_secs: u64,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let virtual_mode = std::env::var("KIS_VIRTUAL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let (key_var, secret_var) = if virtual_mode {
            ("KIS_PAPER_APP_KEY", "KIS_PAPER_APP_SECRET")
        } else {
            ("KIS_APP_KEY", "KIS_APP_SECRET")
        };
        let app_key =
            std::env::var(key_var).with_context(|| format!("{} is required", key_var))?;
        let app_secret =
            std::env::var(secret_var).with_context(|| format!("{} is required", secret_var))?;

        let base_url = std::env::var("KIS_BASE_URL").unwrap_or_else(|_| {
            if virtual_mode {
                REST_BASE_VIRTUAL.to_string()
            } else {
                REST_BASE_REAL.to_string()
            }
        });

        let cache_dir = std::env::var("KIS_TOKEN_CACHE_DIR")
            .unwrap_or_else(|_| ".kis_cache".to_string())
            .into();

        Ok(Self {
            app_key,
            app_secret,
            base_url,
            virtual_mode,
            cache_dir,
            http_timeout_secs: 10,
            lock_wait_max_secs: 120,
            lock_poll_secs: 2,
        })
    }
}

// =============================================================================
// TOKEN CACHE + LOCK
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn usable(&self) -> bool {
        self.expires_at - Utc::now() >= ChronoDuration::seconds(EXPIRY_MARGIN_SECS)
    }
}

/// Held while this process owns the refresh lock file; removal on drop
/// releases waiters in other processes.
struct TokenLock {
    path: PathBuf,
}

impl Drop for TokenLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove token lock");
        }
    }
}

enum LockOutcome {
    Locked(TokenLock),
    /// Another process refreshed while we waited; its token is good.
    CacheFilled(CachedToken),
}

// =============================================================================
// KIS AUTH
// =============================================================================

pub struct KisAuth {
    config: AuthConfig,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
    approval_key: RwLock<Option<String>>,
}

impl KisAuth {
    pub fn new(config: AuthConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!("creating token cache dir {}", config.cache_dir.display())
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building auth http client")?;
        info!(
            mode = if config.virtual_mode { "virtual" } else { "real" },
            base_url = %config.base_url,
            "kis_auth_ready"
        );
        Ok(Self {
            config,
            http,
            token: RwLock::new(None),
            approval_key: RwLock::new(None),
        })
    }

    pub fn mode(&self) -> &'static str {
        if self.config.virtual_mode {
            "virtual"
        } else {
            "real"
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn virtual_mode(&self) -> bool {
        self.config.virtual_mode
    }

    /// Standard KIS REST header set for `tr_id`.
    pub async fn auth_headers(&self, tr_id: &str) -> Result<HeaderMap> {
        let token = self.ensure_token().await?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).context("authorization header")?,
        );
        headers.insert(
            HeaderName::from_static("appkey"),
            HeaderValue::from_str(&self.config.app_key).context("appkey header")?,
        );
        headers.insert(
            HeaderName::from_static("appsecret"),
            HeaderValue::from_str(&self.config.app_secret).context("appsecret header")?,
        );
        headers.insert(
            HeaderName::from_static("tr_id"),
            HeaderValue::from_str(tr_id).context("tr_id header")?,
        );
        headers.insert(HeaderName::from_static("custtype"), HeaderValue::from_static("P"));
        Ok(headers)
    }

    fn cache_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("token_{}.json", self.mode()))
    }

    fn lock_path(&self) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("token_{}.lock", self.mode()))
    }

    fn load_cache(&self) -> Option<CachedToken> {
        let path = self.cache_path();
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unreadable token cache");
                None
            }
        }
    }

    fn save_cache(&self, token: &CachedToken) {
        let path = self.cache_path();
        match serde_json::to_string_pretty(token) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&path, raw) {
                    warn!(path = %path.display(), error = %e, "failed to write token cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize token cache"),
        }
    }

    fn try_lock(&self) -> std::io::Result<TokenLock> {
        let path = self.lock_path();
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map(|_| TokenLock { path })
    }

    /// A lock older than the full wait budget belongs to a dead process.
    fn break_stale_lock(&self) -> bool {
        let path = self.lock_path();
        let age = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|m| m.elapsed().ok());
        match age {
            Some(age) if age.as_secs() > self.config.lock_wait_max_secs => {
                warn!(path = %path.display(), age_secs = age.as_secs(), "breaking stale token lock");
                std::fs::remove_file(&path).is_ok()
            }
            _ => false,
        }
    }

    /// Acquire the cross-process refresh lock, waiting out a concurrent
    /// holder. With `adopt_cache`, a token that appears in the cache while
    /// waiting is taken instead of the lock.
    async fn acquire_refresh_lock(&self, adopt_cache: bool) -> Result<LockOutcome> {
        let mut waited = 0u64;
        loop {
            match self.try_lock() {
                Ok(guard) => return Ok(LockOutcome::Locked(guard)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if adopt_cache {
                        if let Some(cached) = self.load_cache() {
                            if cached.usable() {
                                debug!("adopted token refreshed by another process");
                                return Ok(LockOutcome::CacheFilled(cached));
                            }
                        }
                    }
                    if waited >= self.config.lock_wait_max_secs {
                        if self.break_stale_lock() {
                            continue;
                        }
                        bail!(
                            "timed out after {}s waiting for the token refresh lock",
                            waited
                        );
                    }
                    sleep(Duration::from_secs(self.config.lock_poll_secs)).await;
                    waited += self.config.lock_poll_secs;
                }
                Err(e) => {
                    return Err(e).context("creating token lock file");
                }
            }
        }
    }

    async fn refresh_token(&self) -> Result<CachedToken> {
        let url = format!("{}/oauth2/tokenP", self.config.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.config.app_key,
            "appsecret": self.config.app_secret,
        });

        let mut retried = false;
        loop {
            let resp = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .context("token request failed")?;
            let status = resp.status();
            let payload: Value = resp.json().await.context("token response body")?;

            let error_code = payload
                .get("error_code")
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if error_code == RATE_LIMIT_CODE && !retried {
                warn!(
                    wait_secs = RATE_LIMIT_WAIT_SECS,
                    "token issuance rate limited ({}), waiting before retry", RATE_LIMIT_CODE
                );
                sleep(Duration::from_secs(RATE_LIMIT_WAIT_SECS)).await;
                retried = true;
                continue;
            }

            if !status.is_success() {
                bail!("token endpoint returned {}: {}", status, payload);
            }
            let access_token = payload
                .get("access_token")
                .and_then(|t| t.as_str())
                .context("token response missing access_token")?;
            let expires_in = payload
                .get("expires_in")
                .and_then(|e| e.as_i64())
                .unwrap_or(86400);

            let now = Utc::now();
            let token = CachedToken {
                access_token: access_token.to_string(),
                issued_at: now,
                expires_at: now + ChronoDuration::seconds(expires_in),
            };
            info!(mode = self.mode(), expires_at = %token.expires_at, "✅ access token issued");
            return Ok(token);
        }
    }

    async fn fetch_approval_key(&self) -> Result<String> {
        let url = format!("{}/oauth2/Approval", self.config.base_url);
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": self.config.app_key,
            "secretkey": self.config.app_secret,
        });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("approval key request failed")?;
        let status = resp.status();
        let payload: Value = resp.json().await.context("approval key response body")?;
        if !status.is_success() {
            bail!("approval endpoint returned {}: {}", status, payload);
        }
        let key = payload
            .get("approval_key")
            .and_then(|k| k.as_str())
            .context("approval response missing approval_key")?;
        info!("✅ websocket approval key issued");
        Ok(key.to_string())
    }

    fn memory_token(&self) -> Option<String> {
        let guard = self.token.read();
        guard
            .as_ref()
            .filter(|t| t.usable())
            .map(|t| t.access_token.clone())
    }

    fn adopt(&self, token: CachedToken) -> String {
        let access = token.access_token.clone();
        *self.token.write() = Some(token);
        access
    }
}

#[async_trait]
impl BrokerAuth for KisAuth {
    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.memory_token() {
            return Ok(token);
        }
        if let Some(cached) = self.load_cache() {
            if cached.usable() {
                debug!("using cached access token");
                return Ok(self.adopt(cached));
            }
        }

        match self.acquire_refresh_lock(true).await? {
            LockOutcome::CacheFilled(cached) => Ok(self.adopt(cached)),
            LockOutcome::Locked(guard) => {
                // Another process may have finished between our cache check
                // and the lock grant.
                if let Some(cached) = self.load_cache() {
                    if cached.usable() {
                        drop(guard);
                        return Ok(self.adopt(cached));
                    }
                }
                let token = self.refresh_token().await?;
                self.save_cache(&token);
                let access = self.adopt(token);
                drop(guard);
                Ok(access)
            }
        }
    }

    async fn force_refresh(&self) -> Result<()> {
        let guard = match self.acquire_refresh_lock(false).await? {
            LockOutcome::Locked(guard) => guard,
            // Unreachable with adopt_cache = false, but harmless.
            LockOutcome::CacheFilled(_) => return Ok(()),
        };
        let token = self.refresh_token().await?;
        self.save_cache(&token);
        self.adopt(token);
        *self.approval_key.write() = None;
        drop(guard);
        info!(mode = self.mode(), "access token force-refreshed");
        Ok(())
    }

    async fn get_approval_key(&self) -> Result<String> {
        if let Some(key) = self.approval_key.read().clone() {
            return Ok(key);
        }
        // A valid token must exist before the gateway grants approval keys.
        self.ensure_token().await?;
        let key = self.fetch_approval_key().await?;
        *self.approval_key.write() = Some(key.clone());
        Ok(key)
    }
}

// =============================================================================
// TESTS
// =============================================================================
