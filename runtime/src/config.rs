// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Serialises durations as whole milliseconds so config files stay readable.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Retry policy for opening deal and query streams.
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            factor: 5.0,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (starting at zero), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).max(self.min_delay)
    }
}

/// Terms a storage provider offers before it has set an ask of its own.
#[derive(Builder, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct AskDefaults {
    /// attoFIL per GiB per epoch.
    pub price: u64,
    pub verified_price: u64,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    /// How many epochs a new ask stays valid.
    pub duration: i64,
}

impl Default for AskDefaults {
    fn default() -> Self {
        Self {
            price: 500_000_000,
            verified_price: 500_000_000,
            min_piece_size: 256,
            max_piece_size: 1 << 20,
            duration: 1_000_000,
        }
    }
}

/// Tunables shared by storage and retrieval clients and providers.
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct MarketConfig {
    pub stream_backoff: BackoffConfig,
    /// Bound on closing a transfer channel or deal stream when a deal is cancelled.
    #[serde(with = "duration_ms")]
    pub close_transfer_timeout: Duration,
    /// How often a storage client asks the provider for the status of a deal.
    #[serde(with = "duration_ms")]
    pub deal_status_poll_interval: Duration,
    /// Status poll failures tolerated before the deal fails. `None` never gives up.
    pub max_status_poll_errors: Option<u64>,
    /// How long a storage provider waits for a client to restart a stalled transfer.
    #[serde(with = "duration_ms")]
    pub transfer_restart_timeout: Duration,
    /// How long `stop` waits for running entry actions before aborting them.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    pub default_storage_ask: AskDefaults,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            stream_backoff: BackoffConfig::default(),
            close_transfer_timeout: Duration::from_secs(30),
            deal_status_poll_interval: Duration::from_secs(60),
            max_status_poll_errors: None,
            transfer_restart_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(10),
            default_storage_ask: AskDefaults::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        let b = BackoffConfig::default();
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(5));
        assert_eq!(b.delay(2), Duration::from_secs(25));
        assert_eq!(b.delay(3), Duration::from_secs(125));
        assert_eq!(b.delay(4), Duration::from_secs(300));
        assert_eq!(b.delay(40), Duration::from_secs(300));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: MarketConfig =
            serde_json::from_str(r#"{"close_transfer_timeout": 250, "stream_backoff": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(cfg.close_transfer_timeout, Duration::from_millis(250));
        assert_eq!(cfg.stream_backoff.max_attempts, 2);
        assert_eq!(cfg.stream_backoff.min_delay, Duration::from_secs(1));
        assert_eq!(cfg.default_storage_ask, AskDefaults::default());

        let built = MarketConfigBuilder::default()
            .deal_status_poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        assert_eq!(built.deal_status_poll_interval, Duration::from_millis(10));
        assert_eq!(built.shutdown_grace, Duration::from_secs(10));
    }
}
