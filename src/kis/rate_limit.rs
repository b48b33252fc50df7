//! REST call pacing. The gateway enforces both a per-second and a
//! per-minute budget; `acquire` blocks until a call fits in both windows.

use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_per_sec: usize,
    pub max_per_min: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_sec: 20,
            max_per_min: 1000,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_per_sec: std::env::var("KIS_RATE_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_per_sec),
            max_per_min: std::env::var("KIS_RATE_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.max_per_min),
        }
    }
}

#[derive(Debug, Default)]
struct CallWindows {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<CallWindows>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(CallWindows::default()),
        }
    }

    /// Wait until both windows admit a call, then record it in both.
    pub async fn acquire(&self) {
        loop {
            {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                Self::expire(&mut windows.second, now, Duration::from_secs(1));
                Self::expire(&mut windows.minute, now, Duration::from_secs(60));
                if windows.second.len() < self.config.max_per_sec
                    && windows.minute.len() < self.config.max_per_min
                {
                    windows.second.push_back(now);
                    windows.minute.push_back(now);
                    return;
                }
                debug!(
                    in_second = windows.second.len(),
                    in_minute = windows.minute.len(),
                    "rate limit window full, waiting"
                );
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    fn expire(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= span {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}
