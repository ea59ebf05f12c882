// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::{Arc, Mutex};

use crate::types::RetrievalStats;

/// Named counters and running averages kept by a client or provider.
#[derive(Clone, Default)]
pub struct StatsRecorder {
    stats: Arc<Mutex<RetrievalStats>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn increment(&self, name: &str, by: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats.entry(name.to_string()).or_default() += by;
        }
    }

    /// Folds `value` into `<name>_avg`, counting samples in `<name>_count`.
    pub fn record_average(&self, name: &str, value: u64) {
        if let Ok(mut stats) = self.stats.lock() {
            let count_key = format!("{}_count", name);
            let avg_key = format!("{}_avg", name);
            let count = stats.get(&count_key).copied().unwrap_or_default();
            let avg = stats.get(&avg_key).copied().unwrap_or_default();
            let next = (avg as u128 * count as u128 + value as u128) / (count as u128 + 1);
            stats.insert(count_key, count + 1);
            stats.insert(avg_key, next as u64);
        }
    }

    pub fn snapshot(&self) -> RetrievalStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_and_counters() {
        let stats = StatsRecorder::new();
        stats.increment("deals_completed", 1);
        stats.increment("deals_completed", 1);
        stats.record_average("bytes", 100);
        stats.record_average("bytes", 300);

        let snap = stats.snapshot();
        assert_eq!(snap["deals_completed"], 2);
        assert_eq!(snap["bytes_avg"], 200);
        assert_eq!(snap["bytes_count"], 2);
    }
}
