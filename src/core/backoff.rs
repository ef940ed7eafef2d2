use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Reconnect delay policy.
///
/// Kept behind a trait so tests can pin delays deterministically; the session
/// actor only sees `next_delay`/`reset`.
pub trait ReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
}

/// Decorrelated-jitter exponential backoff.
///
/// Each interval is drawn uniformly from `[base, prev * 3]` and clamped to
/// `cap`, so successive delays grow in expectation, never exceed the cap and
/// never fall below the base. `reset` is called on every successful transport
/// open.
#[derive(Clone, Debug)]
pub struct DecorrelatedJitter {
    base: Duration,
    cap: Duration,
    prev: Duration,
    rng: SmallRng,
}

impl DecorrelatedJitter {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            cap: cap.max(base),
            prev: base,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl ReconnectStrategy for DecorrelatedJitter {
    fn next_delay(&mut self) -> Duration {
        let lo = self.base.as_millis() as u64;
        let hi = (self.prev.as_millis() as u64).saturating_mul(3).max(lo + 1);
        let drawn = self.rng.gen_range(lo..=hi);
        let delay = Duration::from_millis(drawn).min(self.cap);
        self.prev = delay;
        delay
    }

    fn reset(&mut self) {
        self.prev = self.base;
    }
}

/// Uniform jitter in `[0, spread)` added to refresh retry delays.
pub fn uniform_jitter(spread: Duration) -> Duration {
    if spread.is_zero() {
        return spread;
    }
    let mut rng = SmallRng::from_entropy();
    Duration::from_millis(rng.gen_range(0..spread.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(20_000);
        let mut backoff = DecorrelatedJitter::new(base, cap);

        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= base, "delay {delay:?} below base");
            assert!(delay <= cap, "delay {delay:?} above cap");
        }
    }

    #[test]
    fn first_delay_after_reset_is_near_base() {
        let base = Duration::from_millis(100);
        let mut backoff = DecorrelatedJitter::new(base, Duration::from_millis(5000));

        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();

        // After reset the draw range collapses back to [base, 3*base].
        let delay = backoff.next_delay();
        assert!(delay <= base * 3);
    }

    #[test]
    fn uniform_jitter_respects_spread() {
        let spread = Duration::from_millis(1000);
        for _ in 0..100 {
            assert!(uniform_jitter(spread) < spread);
        }
        assert_eq!(uniform_jitter(Duration::ZERO), Duration::ZERO);
    }
}
