use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};
use tracing::info;

use crate::error::Result;

/// What a probe observed on one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
    /// Not there yet, and the corrective action should be repeated once its
    /// backoff interval has passed.
    NeedsCorrection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
}

/// Doubling interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current interval and doubles it for next time.
    pub fn advance(&mut self) -> Duration {
        let interval = self.current;
        self.current = self.current.saturating_mul(2);
        interval
    }
}

/// Re-evaluates a probe every `poll_interval` until it is ready, fails, or
/// `timeout` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExecutor {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl RetryExecutor {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub async fn run<T, P, PFut>(&self, mut probe: P) -> Result<WaitOutcome<T>>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Probe<T>>>,
    {
        self.run_with_correction(
            &mut probe,
            Backoff::new(Duration::MAX),
            || async { Ok(()) },
        )
        .await
    }

    /// Like [`run`](Self::run), additionally re-issuing `corrective` whenever
    /// the probe asks for it and the backoff interval has passed since the
    /// previous correction. The first interval is counted from the start of
    /// the wait; the caller is expected to have issued the action once already.
    pub async fn run_with_correction<T, P, PFut, C, CFut>(
        &self,
        mut probe: P,
        mut backoff: Backoff,
        mut corrective: C,
    ) -> Result<WaitOutcome<T>>
    where
        P: FnMut() -> PFut,
        PFut: Future<Output = Result<Probe<T>>>,
        C: FnMut() -> CFut,
        CFut: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let mut last_correction = started;

        while started.elapsed() < self.timeout {
            match probe().await? {
                Probe::Ready(value) => return Ok(WaitOutcome::Ready(value)),
                Probe::Pending => {}
                Probe::NeedsCorrection => {
                    if last_correction.elapsed() > backoff.current() {
                        info!("Retry: repeating corrective action...");
                        corrective().await?;
                        last_correction = Instant::now();
                        backoff.advance();
                    }
                }
            }
            sleep(self.poll_interval).await;
        }

        Ok(WaitOutcome::TimedOut)
    }
}
