use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::utils::MessagingError;

/// Fixed wait schedule applied between publish attempts.
///
/// An operation is attempted once, then once more after each wait in the
/// schedule, as long as it keeps failing with a transient broker error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    schedule: Vec<Duration>,
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    pub fn from_millis(schedule: &[u64]) -> Self {
        Self::new(schedule.iter().copied().map(Duration::from_millis).collect())
    }

    /// A schedule that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn schedule(&self) -> &[Duration] {
        &self.schedule
    }

    pub fn max_attempts(&self) -> usize {
        self.schedule.len() + 1
    }

    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, MessagingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let mut waits = self.schedule.iter();
        loop {
            match op().await {
                Err(err) if err.is_transient() => match waits.next() {
                    Some(wait) => {
                        warn!("Transient broker error: {err}, next try in {wait:?}");
                        tokio::time::sleep(*wait).await;
                    }
                    None => return Err(err),
                },
                result => return result,
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(&[1_000, 3_000, 10_000])
    }
}
