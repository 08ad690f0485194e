//! Fixed-interval retry with an injectable clock.
//!
//! The oracle returns empty result sets while its signers catch up to a
//! requested timestamp, so callers poll a bounded number of times. The sleep
//! is behind a trait so tests drive retry logic without real delays.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<T: Sleeper + ?Sized> Sleeper for &T {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded fixed-delay retry schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Oracle polling schedule: 10 attempts, 300 ms apart.
    pub fn oracle_default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records requested sleeps instead of waiting.
    #[derive(Default)]
    pub struct RecordingSleeper {
        pub slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }
}
