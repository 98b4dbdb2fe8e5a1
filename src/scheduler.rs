//! Admission control for outbound pulls and pushes.
//!
//! Bounded concurrency per direction, implemented with a pair of
//! [`tokio::sync::Semaphore`]s rather than a hand-rolled queue — the permit
//! *is* the queue position, and `acquire`'s cooperative waiting already gives
//! unordered fairness, matching the design's "fairness is unordered" note on
//! the single-flight gate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Which direction a scheduled copy moves content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Pull,
    Push,
}

/// Diagnostics returned alongside a scheduled operation's result.
#[derive(Clone, Copy, Debug)]
pub struct CopySummary {
    pub queued_for: Duration,
}

/// Bounded-concurrency gate for outbound copy operations.
pub struct CopyScheduler {
    pulls: Arc<Semaphore>,
    pushes: Arc<Semaphore>,
    admission_timeout: Duration,
}

impl CopyScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            pulls: Arc::new(Semaphore::new(config.max_concurrent_pulls)),
            pushes: Arc::new(Semaphore::new(config.max_concurrent_pushes)),
            admission_timeout: config.admission_timeout,
        }
    }

    /// Runs `op` once a slot in `direction` is free, or fails with
    /// [`SchedulerError::Timeout`] if admission itself doesn't happen in time.
    ///
    /// `reason` and `attempt` are accepted for tracing/diagnostics only —
    /// admission order does not depend on them.
    pub async fn schedule<F, Fut, T>(
        &self,
        direction: Direction,
        reason: &str,
        attempt: u32,
        op: F,
    ) -> Result<(T, CopySummary), SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let semaphore = match direction {
            Direction::Pull => &self.pulls,
            Direction::Push => &self.pushes,
        };

        let queued_since = Instant::now();
        let permit = tokio::time::timeout(self.admission_timeout, semaphore.acquire())
            .await
            .map_err(|_| SchedulerError::Timeout)?
            .expect("scheduler semaphore is never closed");

        let summary = CopySummary {
            queued_for: queued_since.elapsed(),
        };
        tracing::debug!(
            direction = ?direction,
            reason,
            attempt,
            queued_for_ms = summary.queued_for.as_millis() as u64,
            "admitted copy operation"
        );

        let result = op().await;
        drop(permit);
        Ok((result, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn admits_within_concurrency_bound() {
        let scheduler = CopyScheduler::new(SchedulerConfig {
            max_concurrent_pulls: 2,
            max_concurrent_pushes: 2,
            admission_timeout: Duration::from_secs(5),
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let scheduler = Arc::new(scheduler);
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let scheduler = scheduler.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                scheduler
                    .schedule(Direction::Pull, "test", 0, || async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn admission_timeout_surfaces_as_scheduler_error() {
        let scheduler = CopyScheduler::new(SchedulerConfig {
            max_concurrent_pulls: 1,
            max_concurrent_pushes: 1,
            admission_timeout: Duration::from_millis(20),
        });
        let scheduler = Arc::new(scheduler);

        let holder = scheduler.clone();
        let hold_task = tokio::spawn(async move {
            holder
                .schedule(Direction::Pull, "hold", 0, || async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = scheduler
            .schedule(Direction::Pull, "blocked", 0, || async move {})
            .await;
        assert!(matches!(result, Err(SchedulerError::Timeout)));
        hold_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pulls_and_pushes_have_independent_budgets() {
        let scheduler = CopyScheduler::new(SchedulerConfig {
            max_concurrent_pulls: 1,
            max_concurrent_pushes: 1,
            admission_timeout: Duration::from_millis(50),
        });
        let scheduler = Arc::new(scheduler);

        let pull_holder = scheduler.clone();
        let hold_task = tokio::spawn(async move {
            pull_holder
                .schedule(Direction::Pull, "hold", 0, || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let push_result = scheduler
            .schedule(Direction::Push, "push", 0, || async move { 1 })
            .await;
        assert!(push_result.is_ok());
        hold_task.await.unwrap().unwrap();
    }
}
