//! Delays between attempts to re-open a dropped backend connection.

use std::time::Duration;

use gatelink_config::ReconnectSettings;
use rand::Rng;

/// Backoff policy for the session loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Growth factor per failed attempt.
    pub backoff_multiplier: f64,
    /// Ceiling for any single wait, jitter included.
    pub max_delay: Duration,
    /// Retries allowed before the client exits.
    pub max_attempts: u32,
    /// Each wait is scaled by a random factor in `1 +/- jitter`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
            jitter: settings.jitter.clamp(0.0, 1.0),
        }
    }
}

/// Retry counter for one outage. Reset it once a connection succeeds.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Wait before the next retry, or `None` when retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX);
        self.attempts += 1;

        let cap = self.config.max_delay.as_secs_f64();
        let base = (self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent))
        .min(cap);
        let spread = self.config.jitter;
        let factor = if spread > 0.0 {
            rand::rng().random_range((1.0 - spread)..=(1.0 + spread))
        } else {
            1.0
        };
        Some(Duration::from_secs_f64((base * factor).min(cap)))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Retries handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
