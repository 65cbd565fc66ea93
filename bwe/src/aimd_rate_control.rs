//! Additive-increase/multiplicative-decrease control loop producing the
//! target bitrate reported back to the sender side.

use crate::{BandwidthUsage, RateControlInput};

const DEFAULT_RTT_MS: i64 = 200;
const MIN_FEEDBACK_INTERVAL_MS: i64 = 200;
const MAX_FEEDBACK_INTERVAL_MS: i64 = 1000;
/// Assumed size of one feedback packet; feedback gets 5% of the bandwidth.
const RTCP_SIZE_BYTES: f64 = 80.0;
/// Back-off factor applied on overuse.
const BETA: f64 = 0.85;
const INITIALIZATION_TIME_MS: i64 = 5000;
const MIN_CONFIGURED_BITRATE_BPS: u32 = 10_000;
const MAX_CONFIGURED_BITRATE_BPS: u32 = 30_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlRegion {
    MaxUnknown,
    NearMax,
}

pub struct AimdRateControl {
    min_configured_bitrate_bps: u32,
    max_configured_bitrate_bps: u32,
    current_bitrate_bps: u32,
    /// Moving average of the incoming bitrate seen at back-off, in kbps.
    /// Negative while unknown.
    avg_max_bitrate_kbps: f64,
    var_max_bitrate_kbps: f64,
    state: RateControlState,
    region: RateControlRegion,
    time_last_bitrate_change_ms: i64,
    current_input: RateControlInput,
    updated: bool,
    time_first_incoming_estimate_ms: i64,
    bitrate_is_initialized: bool,
    rtt_ms: i64,
}

impl Default for AimdRateControl {
    fn default() -> Self {
        Self {
            min_configured_bitrate_bps: MIN_CONFIGURED_BITRATE_BPS,
            max_configured_bitrate_bps: MAX_CONFIGURED_BITRATE_BPS,
            current_bitrate_bps: MAX_CONFIGURED_BITRATE_BPS,
            avg_max_bitrate_kbps: -1.0,
            var_max_bitrate_kbps: 0.4,
            state: RateControlState::Hold,
            region: RateControlRegion::MaxUnknown,
            time_last_bitrate_change_ms: -1,
            current_input: RateControlInput {
                bw_state: BandwidthUsage::Normal,
                incoming_bitrate_bps: 0,
                noise_var: 1.0,
            },
            updated: false,
            time_first_incoming_estimate_ms: -1,
            bitrate_is_initialized: false,
            rtt_ms: DEFAULT_RTT_MS,
        }
    }
}

impl AimdRateControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one measurement has converged into an estimate.
    pub fn valid_estimate(&self) -> bool {
        self.bitrate_is_initialized
    }

    /// Last committed target bitrate.
    pub fn latest_estimate(&self) -> u32 {
        self.current_bitrate_bps
    }

    pub fn set_rtt(&mut self, rtt_ms: i64) {
        self.rtt_ms = rtt_ms;
    }

    pub fn set_min_bitrate(&mut self, min_bitrate_bps: u32) {
        self.min_configured_bitrate_bps = min_bitrate_bps;
        self.current_bitrate_bps = self.current_bitrate_bps.max(min_bitrate_bps);
    }

    /// How often the estimate should be fed back upstream, assuming feedback
    /// packets may use 5% of the available bandwidth.
    pub fn feedback_interval_ms(&self) -> i64 {
        let interval =
            (RTCP_SIZE_BYTES * 8.0 * 1000.0 / (0.05 * self.current_bitrate_bps as f64) + 0.5) as i64;
        interval.clamp(MIN_FEEDBACK_INTERVAL_MS, MAX_FEEDBACK_INTERVAL_MS)
    }

    /// Whether reducing further is reasonable: enough time has passed since
    /// the last change, or the target has drifted far above what is actually
    /// being received.
    pub fn time_to_reduce_further(&self, now_ms: i64, incoming_bitrate_bps: u32) -> bool {
        let reduction_interval_ms = self.rtt_ms.clamp(10, 200);
        if now_ms - self.time_last_bitrate_change_ms >= reduction_interval_ms {
            return true;
        }
        if self.valid_estimate() {
            return self.current_bitrate_bps as u64 > 3 * incoming_bitrate_bps as u64;
        }
        false
    }

    /// Force-sets the estimate, e.g. from a successful probe cluster.
    pub fn set_estimate(&mut self, bitrate_bps: u32, now_ms: i64) {
        self.updated = true;
        self.bitrate_is_initialized = true;
        self.current_bitrate_bps = self.clamp_bitrate(bitrate_bps);
        self.time_last_bitrate_change_ms = now_ms;
    }

    /// Records a new measurement; the estimate itself only changes in
    /// [`update_bandwidth_estimate`](Self::update_bandwidth_estimate).
    pub fn update(&mut self, input: &RateControlInput, now_ms: i64) {
        if !self.bitrate_is_initialized {
            // Seed the estimate from what is received during the first
            // seconds of the session.
            if self.time_first_incoming_estimate_ms < 0 {
                if input.incoming_bitrate_bps > 0 {
                    self.time_first_incoming_estimate_ms = now_ms;
                }
            } else if now_ms - self.time_first_incoming_estimate_ms > INITIALIZATION_TIME_MS
                && input.incoming_bitrate_bps > 0
            {
                self.current_bitrate_bps = input.incoming_bitrate_bps;
                self.bitrate_is_initialized = true;
            }
        }

        if self.updated && self.current_input.bw_state == BandwidthUsage::Overusing {
            // A pending over-use must not be overwritten before it has been
            // acted upon.
            self.current_input.incoming_bitrate_bps = input.incoming_bitrate_bps;
            self.current_input.noise_var = input.noise_var;
        } else {
            self.updated = true;
            self.current_input = *input;
        }
    }

    /// Recomputes and returns the target bitrate.
    pub fn update_bandwidth_estimate(&mut self, now_ms: i64) -> u32 {
        self.current_bitrate_bps = self.change_bitrate(self.current_bitrate_bps, now_ms);
        self.current_bitrate_bps
    }

    fn change_bitrate(&mut self, current_bitrate_bps: u32, now_ms: i64) -> u32 {
        if !self.updated {
            return current_bitrate_bps;
        }
        // An over-use always triggers a reduction, even before the first
        // estimate has converged.
        if !self.bitrate_is_initialized
            && self.current_input.bw_state != BandwidthUsage::Overusing
        {
            return current_bitrate_bps;
        }
        self.updated = false;
        self.change_state(now_ms);

        let incoming_bitrate_bps = self.current_input.incoming_bitrate_bps;
        let incoming_bitrate_kbps = incoming_bitrate_bps as f64 / 1000.0;
        let std_max_bitrate = (self.var_max_bitrate_kbps * self.avg_max_bitrate_kbps).sqrt();
        let mut new_bitrate_bps = current_bitrate_bps;

        match self.state {
            RateControlState::Hold => {}
            RateControlState::Increase => {
                if self.avg_max_bitrate_kbps >= 0.0
                    && incoming_bitrate_kbps > self.avg_max_bitrate_kbps + 3.0 * std_max_bitrate
                {
                    // Incoming rate left the previously known max region.
                    self.region = RateControlRegion::MaxUnknown;
                    self.avg_max_bitrate_kbps = -1.0;
                }
                let increase_bps = match self.region {
                    RateControlRegion::NearMax => {
                        self.additive_rate_increase(now_ms, self.time_last_bitrate_change_ms)
                    }
                    RateControlRegion::MaxUnknown => self.multiplicative_rate_increase(
                        now_ms,
                        self.time_last_bitrate_change_ms,
                        current_bitrate_bps,
                    ),
                };
                new_bitrate_bps = current_bitrate_bps.saturating_add(increase_bps);
                self.time_last_bitrate_change_ms = now_ms;
            }
            RateControlState::Decrease => {
                self.bitrate_is_initialized = true;
                // Back off from the measured throughput or the current
                // target, whichever is higher.
                new_bitrate_bps = (BETA
                    * incoming_bitrate_bps.max(current_bitrate_bps) as f64
                    + 0.5) as u32;
                self.region = RateControlRegion::NearMax;
                if incoming_bitrate_kbps < self.avg_max_bitrate_kbps - 3.0 * std_max_bitrate {
                    self.avg_max_bitrate_kbps = -1.0;
                }
                self.update_max_bitrate_estimate(incoming_bitrate_kbps);
                // Hold until the queues have drained.
                self.state = RateControlState::Hold;
                self.time_last_bitrate_change_ms = now_ms;
            }
        }

        // Never run away from what is actually being received.
        let max_sane_bps = (1.5 * incoming_bitrate_bps as f64 + 10_000.0) as u32;
        if new_bitrate_bps > current_bitrate_bps && new_bitrate_bps > max_sane_bps {
            new_bitrate_bps = current_bitrate_bps.max(max_sane_bps);
            self.time_last_bitrate_change_ms = now_ms;
        }
        self.clamp_bitrate(new_bitrate_bps)
    }

    fn change_state(&mut self, now_ms: i64) {
        match self.current_input.bw_state {
            BandwidthUsage::Normal => {
                if self.state == RateControlState::Hold {
                    self.time_last_bitrate_change_ms = now_ms;
                    self.state = RateControlState::Increase;
                }
            }
            BandwidthUsage::Overusing => {
                self.state = RateControlState::Decrease;
            }
            BandwidthUsage::Underusing => {
                self.state = RateControlState::Hold;
            }
        }
    }

    fn multiplicative_rate_increase(
        &self,
        now_ms: i64,
        last_ms: i64,
        current_bitrate_bps: u32,
    ) -> u32 {
        let mut alpha = 1.08f64;
        if last_ms > -1 {
            let time_since_last_update_ms = (now_ms - last_ms).min(1000);
            alpha = alpha.powf(time_since_last_update_ms as f64 / 1000.0);
        }
        (current_bitrate_bps as f64 * (alpha - 1.0)).max(1000.0) as u32
    }

    fn additive_rate_increase(&self, now_ms: i64, last_ms: i64) -> u32 {
        ((now_ms - last_ms) as f64 * self.near_max_increase_rate_bps_per_s() / 1000.0) as u32
    }

    /// Near the statistical max the rate grows by roughly one packet per
    /// response time, with a 1000 bps floor.
    fn near_max_increase_rate_bps_per_s(&self) -> f64 {
        // Approximate one frame per 33 ms and packets of 1200 bytes.
        let bits_per_frame = self.current_bitrate_bps as f64 / 30.0;
        let packets_per_frame = (bits_per_frame / (8.0 * 1200.0)).ceil().max(1.0);
        let avg_packet_size_bits = bits_per_frame / packets_per_frame;
        let response_time_ms = (self.rtt_ms + 100) as f64;
        (avg_packet_size_bits * 1000.0 / response_time_ms).max(1000.0)
    }

    fn update_max_bitrate_estimate(&mut self, incoming_bitrate_kbps: f64) {
        const ALPHA: f64 = 0.05;
        if self.avg_max_bitrate_kbps < 0.0 {
            self.avg_max_bitrate_kbps = incoming_bitrate_kbps;
        } else {
            self.avg_max_bitrate_kbps =
                (1.0 - ALPHA) * self.avg_max_bitrate_kbps + ALPHA * incoming_bitrate_kbps;
        }
        // Estimate the variance normalized by the mean.
        let norm = self.avg_max_bitrate_kbps.max(1.0);
        self.var_max_bitrate_kbps = (1.0 - ALPHA) * self.var_max_bitrate_kbps
            + ALPHA * (self.avg_max_bitrate_kbps - incoming_bitrate_kbps).powi(2) / norm;
        self.var_max_bitrate_kbps = self.var_max_bitrate_kbps.clamp(0.4, 2.5);
    }

    fn clamp_bitrate(&self, bitrate_bps: u32) -> u32 {
        bitrate_bps.clamp(self.min_configured_bitrate_bps, self.max_configured_bitrate_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_estimate_until_initialized() {
        let control = AimdRateControl::new();
        assert!(!control.valid_estimate());
    }

    #[test]
    fn test_set_estimate_is_valid_immediately() {
        let mut control = AimdRateControl::new();
        control.set_estimate(1_920_000, 0);
        assert!(control.valid_estimate());
        assert_eq!(control.latest_estimate(), 1_920_000);
    }

    #[test]
    fn test_overuse_decreases_by_beta_of_max() {
        let mut control = AimdRateControl::new();
        control.set_estimate(500_000, 0);
        control.update(
            &RateControlInput {
                bw_state: BandwidthUsage::Overusing,
                incoming_bitrate_bps: 400_000,
                noise_var: 1.0,
            },
            100,
        );
        let target = control.update_bandwidth_estimate(100);
        // 0.85 * max(400_000, 500_000)
        assert_eq!(target, 425_000);
    }

    #[test]
    fn test_normal_increases_multiplicatively_while_max_unknown() {
        let mut control = AimdRateControl::new();
        control.set_estimate(1_000_000, 0);
        let input = RateControlInput {
            bw_state: BandwidthUsage::Normal,
            incoming_bitrate_bps: 900_000,
            noise_var: 1.0,
        };
        control.update(&input, 0);
        // Hold -> Increase happens on this update; no time has passed yet so
        // only the 1000 bps floor applies.
        let first = control.update_bandwidth_estimate(0);
        assert_eq!(first, 1_001_000);

        control.update(&input, 1000);
        let second = control.update_bandwidth_estimate(1000);
        // 8% per second while far from the statistical max.
        assert_eq!(second, 1_001_000 + 80_080);
    }

    #[test]
    fn test_increase_is_additive_near_max() {
        let mut control = AimdRateControl::new();
        control.set_estimate(1_000_000, 0);
        // A decrease marks the region as near-max.
        control.update(
            &RateControlInput {
                bw_state: BandwidthUsage::Overusing,
                incoming_bitrate_bps: 1_000_000,
                noise_var: 1.0,
            },
            0,
        );
        control.update_bandwidth_estimate(0);
        let after_decrease = control.latest_estimate();
        assert_eq!(after_decrease, 850_000);

        let input = RateControlInput {
            bw_state: BandwidthUsage::Normal,
            incoming_bitrate_bps: 1_000_000,
            noise_var: 1.0,
        };
        control.update(&input, 1000);
        control.update_bandwidth_estimate(1000);
        control.update(&input, 2000);
        let target = control.update_bandwidth_estimate(2000);
        // Additive growth is orders of magnitude slower than multiplicative.
        assert!(target > after_decrease);
        assert!(target < after_decrease + 50_000);
    }

    #[test]
    fn test_underuse_holds() {
        let mut control = AimdRateControl::new();
        control.set_estimate(1_000_000, 0);
        control.update(
            &RateControlInput {
                bw_state: BandwidthUsage::Underusing,
                incoming_bitrate_bps: 900_000,
                noise_var: 1.0,
            },
            100,
        );
        assert_eq!(control.update_bandwidth_estimate(100), 1_000_000);
    }

    #[test]
    fn test_time_to_reduce_further() {
        let mut control = AimdRateControl::new();
        control.set_estimate(3_100_000, 1000);
        // Before the reduction interval has elapsed: only a large gap between
        // target and incoming rate justifies another reduction.
        assert!(control.time_to_reduce_further(1010, 1_000_000));
        assert!(!control.time_to_reduce_further(1010, 2_000_000));
        // After the interval (default rtt 200 ms) it is always time.
        assert!(control.time_to_reduce_further(1200, 2_000_000));
    }

    #[test]
    fn test_feedback_interval_clamped() {
        let mut control = AimdRateControl::new();
        control.set_estimate(30_000_000, 0);
        assert_eq!(control.feedback_interval_ms(), 200);
        control.set_estimate(10_000, 0);
        assert_eq!(control.feedback_interval_ms(), 1000);
    }

    #[test]
    fn test_estimate_clamped_to_configured_range() {
        let mut control = AimdRateControl::new();
        control.set_estimate(1_000, 0);
        assert_eq!(control.latest_estimate(), 10_000);
        control.set_estimate(100_000_000, 0);
        assert_eq!(control.latest_estimate(), 30_000_000);
    }
}
