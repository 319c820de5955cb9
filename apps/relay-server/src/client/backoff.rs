use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay. The attempt count only resets after a
/// successful open, never on a failed one.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Unjittered delay for a given attempt, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.factor.powi(attempt.min(64) as i32);
        let secs = self.config.base.as_secs_f64() * exp;
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn peek_delay(&self) -> Duration {
        self.base_delay(self.attempt)
    }

    /// Delay for the next retry. Jitter is applied before the cap so the
    /// ceiling holds even at `1 + jitter`.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let scale = if self.config.jitter > 0.0 {
            rng.gen_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter))
        } else {
            1.0
        };
        let jittered = base.as_secs_f64() * scale;
        Duration::from_secs_f64(jittered.min(self.config.max_delay.as_secs_f64()))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Retries scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> Backoff {
        Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        })
    }

    fn close(a: Duration, b: f64) -> bool {
        (a.as_secs_f64() - b).abs() < 1e-6
    }

    #[test]
    fn test_unjittered_sequence_is_monotone_and_capped() {
        let mut backoff = no_jitter();
        let mut rng = StdRng::seed_from_u64(7);
        let expected = [1.0, 1.5, 2.25, 3.375, 5.0625, 7.59375, 10.0, 10.0];
        for want in expected {
            let got = backoff.next_delay(&mut rng);
            assert!(close(got, want), "got {:?}, want {}", got, want);
        }
        assert_eq!(backoff.attempts(), 8);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 0..12 {
            let base = backoff.base_delay(attempt).as_secs_f64();
            let got = backoff.next_delay(&mut rng).as_secs_f64();
            assert!(got >= base * 0.75 - 1e-9, "attempt {}: {} < {}", attempt, got, base * 0.75);
            assert!(got <= (base * 1.25).min(10.0) + 1e-9);
        }
    }

    #[test]
    fn test_reset_only_on_demand() {
        let mut backoff = no_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        backoff.next_delay(&mut rng);
        backoff.next_delay(&mut rng);
        assert!(close(backoff.peek_delay(), 2.25));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(close(backoff.next_delay(&mut rng), 1.0));
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let mut a = Backoff::new(BackoffConfig::default());
        let mut b = Backoff::new(BackoffConfig::default());
        let mut rng_a = StdRng::seed_from_u64(99);
        let mut rng_b = StdRng::seed_from_u64(99);
        for _ in 0..5 {
            assert_eq!(a.next_delay(&mut rng_a), b.next_delay(&mut rng_b));
        }
    }
}
