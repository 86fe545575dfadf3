use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};

/// Spaces out the start of consecutive segment fetches.
///
/// Backed by a shared [`Interval`], so waiting never blocks a worker thread and paused-time tests
/// observe exact spacing. The first slot is available immediately.
pub struct Pacer {
    interval: Option<Mutex<Interval>>,
}

impl Pacer {
    pub fn new(spacing: Duration) -> Self {
        let interval = (!spacing.is_zero()).then(|| {
            let mut interval = tokio::time::interval(spacing);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Mutex::new(interval)
        });
        Self { interval }
    }

    /// Wait for the next start slot.
    pub async fn ready(&self) {
        if let Some(interval) = &self.interval {
            interval.lock().await.tick().await;
        }
    }
}
