//! Request pacing against the catalog site

use crate::config::validation::MIN_REQUESTS_PER_MINUTE;
use crate::config::CrawlerConfig;
use rand::Rng;
use std::time::Duration;

/// Computes the pause before each request from a target rate plus jitter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    base_interval: Duration,
    jitter_factor: f64,
}

impl RateLimiter {
    /// Creates a limiter for `requests_per_minute` with relative `jitter_factor`
    ///
    /// Rates below the validated minimum (or NaN) are raised to it.
    pub fn new(requests_per_minute: f64, jitter_factor: f64) -> Self {
        let rate = requests_per_minute.max(MIN_REQUESTS_PER_MINUTE);
        Self {
            base_interval: Duration::from_secs_f64(60.0 / rate),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(config.requests_per_minute, config.jitter_factor)
    }

    /// Delay with no jitter applied
    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Smallest and largest delay [`next_delay`](Self::next_delay) can return
    pub fn jitter_band(&self) -> (Duration, Duration) {
        (self.delay_for(-1.0), self.delay_for(1.0))
    }

    /// Draws the delay before the next request
    pub fn next_delay(&self) -> Duration {
        if self.jitter_factor == 0.0 {
            return self.base_interval;
        }
        let sample = rand::rng().random_range(-1.0..=1.0);
        self.delay_for(sample)
    }

    /// Delay for a given jitter sample in `[-1, 1]`
    pub fn delay_for(&self, sample: f64) -> Duration {
        let factor = 1.0 + self.jitter_factor * sample.clamp(-1.0, 1.0);
        self.base_interval.mul_f64(factor.max(0.0))
    }

    /// Sleeps for one drawn delay
    pub async fn wait(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}
