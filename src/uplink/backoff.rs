use rand::Rng;
use std::time::Duration;

use crate::config::UplinkSettings;

/// Exponential retry delay with an upper bound and optional ±10% jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

const JITTER_FRACTION: f64 = 0.1;

impl Backoff {
    pub fn from_settings(settings: &UplinkSettings) -> Self {
        Self {
            base: settings.backoff_base,
            max: settings.backoff_max,
            jitter: settings.backoff_jitter,
        }
    }

    /// Delay after the `failed_attempts`-th failure (1-based).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let shift = failed_attempts.saturating_sub(1).min(20);
        let nominal = self.base.saturating_mul(1u32 << shift).min(self.max);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        nominal.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: bool) -> Backoff {
        Backoff {
            base: Duration::from_millis(250),
            max: Duration::from_secs(10),
            jitter,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let b = backoff(false);
        assert_eq!(b.delay(1), Duration::from_millis(250));
        assert_eq!(b.delay(2), Duration::from_millis(500));
        assert_eq!(b.delay(3), Duration::from_millis(1000));
        assert_eq!(b.delay(6), Duration::from_millis(8000));
        assert_eq!(b.delay(7), Duration::from_secs(10));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let b = backoff(true);
        for _ in 0..200 {
            let d = b.delay(3);
            assert!(d >= Duration::from_millis(900), "{d:?}");
            assert!(d <= Duration::from_millis(1100), "{d:?}");
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let b = backoff(true);
        for _ in 0..200 {
            assert!(b.delay(30) <= Duration::from_secs(10));
        }
    }
}
