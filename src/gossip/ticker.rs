//! Jittered ticker for scheduling anti-entropy sessions.
//!
//! Each delay is drawn from a normal distribution around the mean interval
//! so replicas started together drift apart instead of gossiping in bursts.

use crate::probability::{with_rng, SharedRng};
use rand::Rng;
use std::f64::consts::PI;
use std::time::Duration;

/// Delays never drop below this.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct JitterTicker {
    interval: Duration,
    sigma: Duration,
    rng: SharedRng,
}

impl JitterTicker {
    pub fn new(interval: Duration, sigma: Duration, rng: SharedRng) -> Self {
        Self { interval, sigma, rng }
    }

    /// Next delay: `interval + N(0, 1) * sigma`, clamped to [`MIN_DELAY`].
    pub fn next_delay(&self) -> Duration {
        let z = with_rng(&self.rng, standard_normal);
        let secs = self.interval.as_secs_f64() + z * self.sigma.as_secs_f64();
        Duration::from_secs_f64(secs.max(MIN_DELAY.as_secs_f64()))
    }

    /// Sleep until the next tick.
    pub async fn tick(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

// Box-Muller transform.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probability::shared_rng;

    #[test]
    fn test_delays_center_on_interval() {
        let ticker = JitterTicker::new(Duration::from_secs(60), Duration::from_secs(5), shared_rng(Some(11)));
        let n = 2000;
        let mean = (0..n).map(|_| ticker.next_delay().as_secs_f64()).sum::<f64>() / n as f64;
        assert!((mean - 60.0).abs() < 1.0, "mean = {}", mean);
    }

    #[test]
    fn test_delays_vary() {
        let ticker = JitterTicker::new(Duration::from_secs(60), Duration::from_secs(5), shared_rng(Some(5)));
        let a = ticker.next_delay();
        let b = ticker.next_delay();
        assert_ne!(a, b);
    }

    #[test]
    fn test_never_below_minimum() {
        let ticker = JitterTicker::new(Duration::from_millis(1), Duration::from_secs(10), shared_rng(Some(2)));
        for _ in 0..500 {
            assert!(ticker.next_delay() >= MIN_DELAY);
        }
    }

    #[test]
    fn test_zero_sigma_is_fixed() {
        let ticker = JitterTicker::new(Duration::from_secs(3), Duration::ZERO, shared_rng(Some(1)));
        assert_eq!(ticker.next_delay(), Duration::from_secs(3));
    }
}
