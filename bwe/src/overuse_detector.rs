//! Adaptive-threshold detector turning the estimated delay offset into a
//! bandwidth usage hypothesis.

use crate::BandwidthUsage;

const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const OVER_USING_TIME_THRESHOLD_MS: f64 = 10.0;
const MIN_NUM_DELTAS: usize = 60;
const MAX_TIME_DELTA_MS: i64 = 100;

const K_UP: f64 = 0.0087;
const K_DOWN: f64 = 0.039;

pub struct OveruseDetector {
    threshold: f64,
    last_update_ms: i64,
    prev_offset: f64,
    time_over_using: f64,
    overuse_counter: usize,
    hypothesis: BandwidthUsage,
}

impl Default for OveruseDetector {
    fn default() -> Self {
        Self {
            threshold: 12.5,
            last_update_ms: -1,
            prev_offset: 0.0,
            time_over_using: -1.0,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }
}

impl OveruseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current hypothesis.
    pub fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    /// Updates the detection state from the estimated inter-group delay
    /// offset. `ts_delta_ms` is the send-time delta the offset is based on
    /// and `num_of_deltas` the number of deltas behind the estimate.
    pub fn detect(
        &mut self,
        offset: f64,
        ts_delta_ms: f64,
        num_of_deltas: usize,
        now_ms: i64,
    ) -> BandwidthUsage {
        if num_of_deltas < 2 {
            return BandwidthUsage::Normal;
        }
        let t = num_of_deltas.min(MIN_NUM_DELTAS) as f64 * offset;
        if t > self.threshold {
            if self.time_over_using == -1.0 {
                // Initialize the timer: assume overuse since mid-group.
                self.time_over_using = ts_delta_ms / 2.0;
            } else {
                self.time_over_using += ts_delta_ms;
            }
            self.overuse_counter += 1;
            if self.time_over_using > OVER_USING_TIME_THRESHOLD_MS
                && self.overuse_counter > 1
                && offset >= self.prev_offset
            {
                self.time_over_using = 0.0;
                self.overuse_counter = 0;
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if t < -self.threshold {
            self.time_over_using = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }

        self.prev_offset = offset;
        self.update_threshold(t, now_ms);

        self.hypothesis
    }

    fn update_threshold(&mut self, modified_offset: f64, now_ms: i64) {
        if self.last_update_ms == -1 {
            self.last_update_ms = now_ms;
        }
        if modified_offset.abs() > self.threshold + MAX_ADAPT_OFFSET_MS {
            // Avoid adapting the threshold to spikes.
            self.last_update_ms = now_ms;
            return;
        }
        let k = if modified_offset.abs() < self.threshold {
            K_DOWN
        } else {
            K_UP
        };
        let time_delta_ms = (now_ms - self.last_update_ms).clamp(0, MAX_TIME_DELTA_MS);
        self.threshold += k * (modified_offset.abs() - self.threshold) * time_delta_ms as f64;
        self.threshold = self.threshold.clamp(6.0, 600.0);
        self.last_update_ms = now_ms;
    }
}
