use rand::Rng;
use std::time::Duration;

/// Largest doubling applied to the poll interval after failed runs.
pub const MAX_BACKOFF_SHIFT: u32 = 4;

/// Sleep policy between batch runs.
///
/// Healthy runs wait one poll interval. Each consecutive failed run doubles
/// the wait, capped at `poll << MAX_BACKOFF_SHIFT`. With jitter the wait is
/// drawn from the upper half of that window so retries from several daemons
/// do not line up.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    poll: Duration,
    jitter: bool,
}

impl PollBackoff {
    pub fn new(poll: Duration, jitter: bool) -> Self {
        Self { poll, jitter }
    }

    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(consecutive_failures, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        consecutive_failures: u32,
        rng: &mut R,
    ) -> Duration {
        let poll_ms = self.poll.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = consecutive_failures.min(MAX_BACKOFF_SHIFT);
        let window = poll_ms.saturating_mul(1u64 << shift);
        let delay_ms = if self.jitter && consecutive_failures > 0 {
            rng.gen_range(window / 2..=window)
        } else {
            window
        };
        Duration::from_millis(delay_ms)
    }
}
