use serde::{Deserialize, Serialize};

use super::BundleStats;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Moving averages of a bundle traffic over at most `max_samples` samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAverageMessageData {
    pub max_samples: u32,
    pub num_samples: u32,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub msg_throughput_in: f64,
    pub msg_throughput_out: f64,
}

impl TimeAverageMessageData {
    pub fn new(max_samples: u32) -> Self {
        TimeAverageMessageData {
            max_samples: max_samples.max(1),
            num_samples: 0,
            msg_rate_in: 0.0,
            msg_rate_out: 0.0,
            msg_throughput_in: 0.0,
            msg_throughput_out: 0.0,
        }
    }

    // the first sample seeds the averages, then each sample weighs 1/n with n capped
    pub fn update(&mut self, stats: &BundleStats) {
        self.num_samples = (self.num_samples + 1).min(self.max_samples);
        let n = self.num_samples as f64;

        self.msg_rate_in += (stats.msg_rate_in - self.msg_rate_in) / n;
        self.msg_rate_out += (stats.msg_rate_out - self.msg_rate_out) / n;
        self.msg_throughput_in += (stats.msg_throughput_in - self.msg_throughput_in) / n;
        self.msg_throughput_out += (stats.msg_throughput_out - self.msg_throughput_out) / n;
    }

    pub fn total_msg_rate(&self) -> f64 {
        self.msg_rate_in + self.msg_rate_out
    }

    /// Throughput in + out, in MB/s.
    pub fn total_throughput_mbytes(&self) -> f64 {
        (self.msg_throughput_in + self.msg_throughput_out) / BYTES_PER_MB
    }

    fn halved(&self) -> Self {
        TimeAverageMessageData {
            max_samples: self.max_samples,
            num_samples: self.num_samples,
            msg_rate_in: self.msg_rate_in / 2.0,
            msg_rate_out: self.msg_rate_out / 2.0,
            msg_throughput_in: self.msg_throughput_in / 2.0,
            msg_throughput_out: self.msg_throughput_out / 2.0,
        }
    }
}

/// Aggregated statistics of a bundle, written by the leader at `/loadbalance/bundle-data/{bundle}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleData {
    pub short_term: TimeAverageMessageData,
    pub long_term: TimeAverageMessageData,
    pub topics: u64,
    pub sessions: u64,
    /// time of the broker report folded last
    pub last_update_ms: u64,
    /// set on the children of a split, the bundle they come from
    #[serde(default)]
    pub parent: Option<String>,
}

impl BundleData {
    pub fn new(short_term_samples: u32, long_term_samples: u32) -> Self {
        BundleData {
            short_term: TimeAverageMessageData::new(short_term_samples),
            long_term: TimeAverageMessageData::new(long_term_samples),
            topics: 0,
            sessions: 0,
            last_update_ms: 0,
            parent: None,
        }
    }

    pub fn update(&mut self, stats: &BundleStats, report_ms: u64) {
        self.short_term.update(stats);
        self.long_term.update(stats);
        self.topics = stats.topics;
        self.sessions = stats.sessions();
        self.last_update_ms = report_ms;
    }

    /// Statistics attributed to each of the two children of this bundle.
    pub fn split_half(&self, parent: &str, now_ms: u64) -> BundleData {
        BundleData {
            short_term: self.short_term.halved(),
            long_term: self.long_term.halved(),
            topics: self.topics.div_ceil(2),
            sessions: self.sessions.div_ceil(2),
            last_update_ms: now_ms,
            parent: Some(parent.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(msg_rate_in: f64) -> BundleStats {
        BundleStats {
            msg_rate_in,
            topics: 3,
            producer_count: 2,
            consumer_count: 4,
            ..Default::default()
        }
    }

    #[test]
    fn first_sample_seeds_the_average() {
        let mut data = TimeAverageMessageData::new(10);
        data.update(&stats(500.0));
        assert_eq!(data.msg_rate_in, 500.0);
        assert_eq!(data.num_samples, 1);
    }

    #[test]
    fn average_is_capped_by_max_samples() {
        let mut data = TimeAverageMessageData::new(2);
        data.update(&stats(100.0));
        data.update(&stats(200.0));
        assert_eq!(data.msg_rate_in, 150.0);

        // n stays at 2, the new sample weighs a half
        data.update(&stats(350.0));
        assert_eq!(data.num_samples, 2);
        assert_eq!(data.msg_rate_in, 250.0);
    }

    #[test]
    fn bundle_data_update_tracks_counts() {
        let mut data = BundleData::new(10, 1000);
        data.update(&stats(12000.0), 42);

        assert_eq!(data.topics, 3);
        assert_eq!(data.sessions, 6);
        assert_eq!(data.last_update_ms, 42);
        assert_eq!(data.long_term.total_msg_rate(), 12000.0);
    }

    #[test]
    fn split_half_is_attributable_to_parent() {
        let mut data = BundleData::new(10, 1000);
        data.update(&stats(12000.0), 42);

        let child = data.split_half("ns1/0x00-0xFF", 100);

        assert_eq!(child.long_term.msg_rate_in, 6000.0);
        assert_eq!(child.short_term.msg_rate_in, 6000.0);
        assert_eq!(child.topics, 2);
        assert_eq!(child.sessions, 3);
        assert_eq!(child.parent.as_deref(), Some("ns1/0x00-0xFF"));
        assert_eq!(child.last_update_ms, 100);
    }
}
