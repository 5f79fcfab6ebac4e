//! Pacing in front of ledger writes.
//!
//! Every ledger write awaits [`Pacer::pace`] first. The default is a fixed
//! delay; a token bucket keyed to ledger throughput can replace it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_PACING_MS: u64 = 5_000;

#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pace(&self);
}

#[derive(Debug, Clone)]
pub struct FixedDelayPacer {
    delay: Duration,
}

impl FixedDelayPacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedDelayPacer {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PACING_MS))
    }
}

#[async_trait]
impl Pacer for FixedDelayPacer {
    async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Abstraction for deterministic testing.
pub trait TimeSource: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

/// Milliseconds on the tokio clock (follows paused time in tests).
#[derive(Debug)]
pub struct TokioTimeSource {
    origin: tokio::time::Instant,
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for TokioTimeSource {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens_scaled: u128,
    last_ms: u64,
}

const SCALE: u128 = 1_000_000;

/// Token bucket over ledger writes with integer fixed-point tokens.
pub struct TokenBucketPacer<T: TimeSource> {
    time: T,
    cap: u128,
    rate_per_ms: u128,
    bucket: Mutex<Bucket>,
}

impl<T: TimeSource> std::fmt::Debug for TokenBucketPacer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketPacer")
            .field("cap", &self.cap)
            .field("rate_per_ms", &self.rate_per_ms)
            .finish_non_exhaustive()
    }
}

impl<T: TimeSource> TokenBucketPacer<T> {
    pub fn new(writes_per_minute: u32, burst: u32, time: T) -> Self {
        let cap = u128::from(burst.max(1)) * SCALE;
        let rate_per_ms = (u128::from(writes_per_minute.max(1)) * SCALE / 60_000).max(1);
        let now = time.now_millis();
        Self {
            time,
            cap,
            rate_per_ms,
            bucket: Mutex::new(Bucket {
                tokens_scaled: cap,
                last_ms: now,
            }),
        }
    }

    /// Takes a token if one is available; otherwise returns the wait in ms.
    pub fn try_take(&self) -> Result<(), u64> {
        let now = self.time.now_millis();
        let mut b = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_sub(b.last_ms);
        if elapsed > 0 {
            b.tokens_scaled = (b.tokens_scaled + u128::from(elapsed) * self.rate_per_ms).min(self.cap);
            b.last_ms = now;
        }
        if b.tokens_scaled >= SCALE {
            b.tokens_scaled -= SCALE;
            Ok(())
        } else {
            let missing = SCALE - b.tokens_scaled;
            Err(u64::try_from(missing.div_ceil(self.rate_per_ms)).unwrap_or(u64::MAX))
        }
    }
}

#[async_trait]
impl<T: TimeSource> Pacer for TokenBucketPacer<T> {
    async fn pace(&self) {
        while let Err(wait_ms) = self.try_take() {
            tokio::time::sleep(Duration::from_millis(wait_ms.max(1))).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PacingConfig {
    Fixed {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    TokenBucket {
        writes_per_minute: u32,
        #[serde(default = "default_burst")]
        burst: u32,
    },
}

fn default_delay_ms() -> u64 {
    DEFAULT_PACING_MS
}

fn default_burst() -> u32 {
    1
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig::Fixed {
            delay_ms: DEFAULT_PACING_MS,
        }
    }
}

impl PacingConfig {
    pub fn build(&self) -> Arc<dyn Pacer> {
        match self {
            PacingConfig::Fixed { delay_ms } => {
                Arc::new(FixedDelayPacer::new(Duration::from_millis(*delay_ms)))
            }
            PacingConfig::TokenBucket {
                writes_per_minute,
                burst,
            } => Arc::new(TokenBucketPacer::new(
                *writes_per_minute,
                *burst,
                TokioTimeSource::default(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct FakeTime {
        now: AtomicU64,
    }

    impl FakeTime {
        fn new(start_ms: u64) -> Self {
            Self {
                now: AtomicU64::new(start_ms),
            }
        }
        fn advance_ms(&self, delta: u64) {
            self.now.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl TimeSource for FakeTime {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn bucket_allows_burst_then_reports_wait() {
        let p = TokenBucketPacer::new(60, 2, FakeTime::new(0));
        assert!(p.try_take().is_ok());
        assert!(p.try_take().is_ok());
        assert_eq!(p.try_take(), Err(1_000));

        p.time.advance_ms(400);
        assert_eq!(p.try_take(), Err(600));
        p.time.advance_ms(600);
        assert!(p.try_take().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_pacer_sleeps_its_delay() {
        let pacer = FixedDelayPacer::default();
        let start = tokio::time::Instant::now();
        pacer.pace().await;
        assert_eq!(start.elapsed(), Duration::from_millis(DEFAULT_PACING_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_writes_after_burst() {
        let pacer = TokenBucketPacer::new(12, 1, TokioTimeSource::default());
        let start = tokio::time::Instant::now();
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(1));
        pacer.pace().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn pacing_config_parses_tagged_modes() {
        let cfg: PacingConfig =
            serde_json::from_str(r#"{"mode":"token_bucket","writes_per_minute":30}"#).unwrap();
        assert_eq!(
            cfg,
            PacingConfig::TokenBucket {
                writes_per_minute: 30,
                burst: 1
            }
        );
        let cfg: PacingConfig = serde_json::from_str(r#"{"mode":"fixed"}"#).unwrap();
        assert_eq!(cfg, PacingConfig::default());
    }
}
