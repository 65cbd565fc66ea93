//! Kalman filter estimating the one-way delay gradient (queuing offset)
//! between send and receive clocks.

use std::collections::VecDeque;

use log::error;

use crate::BandwidthUsage;

const MIN_FRAME_PERIOD_HISTORY_LENGTH: usize = 60;
const DELTA_COUNTER_MAX: usize = 1000;

pub struct OveruseEstimator {
    num_of_deltas: usize,
    slope: f64,
    offset: f64,
    prev_offset: f64,
    e: [[f64; 2]; 2],
    process_noise: [f64; 2],
    avg_noise: f64,
    var_noise: f64,
    ts_delta_hist: VecDeque<f64>,
}

impl Default for OveruseEstimator {
    fn default() -> Self {
        Self {
            num_of_deltas: 0,
            slope: 8.0 / 512.0,
            offset: 0.0,
            prev_offset: 0.0,
            e: [[100.0, 0.0], [0.0, 1e-1]],
            process_noise: [1e-13, 1e-3],
            avg_noise: 0.0,
            var_noise: 50.0,
            ts_delta_hist: VecDeque::new(),
        }
    }
}

impl OveruseEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimated inter-group delay offset in milliseconds.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Estimated measurement noise variance.
    pub fn var_noise(&self) -> f64 {
        self.var_noise
    }

    /// Number of deltas the current estimate is based on.
    pub fn num_of_deltas(&self) -> usize {
        self.num_of_deltas
    }

    /// Updates the filter with one inter-group sample.
    pub fn update(
        &mut self,
        t_delta_ms: i64,
        ts_delta_ms: f64,
        size_delta: i64,
        current_hypothesis: BandwidthUsage,
        _now_ms: i64,
    ) {
        let min_frame_period = self.update_min_frame_period(ts_delta_ms);
        let t_ts_delta = t_delta_ms as f64 - ts_delta_ms;
        let fs_delta = size_delta as f64;

        self.num_of_deltas += 1;
        if self.num_of_deltas > DELTA_COUNTER_MAX {
            self.num_of_deltas = DELTA_COUNTER_MAX;
        }

        self.e[0][0] += self.process_noise[0];
        self.e[1][1] += self.process_noise[1];
        if (current_hypothesis == BandwidthUsage::Overusing && self.offset < self.prev_offset)
            || (current_hypothesis == BandwidthUsage::Underusing && self.offset > self.prev_offset)
        {
            self.e[1][1] += 10.0 * self.process_noise[1];
        }

        let h = [fs_delta, 1.0];
        let eh = [
            self.e[0][0] * h[0] + self.e[0][1] * h[1],
            self.e[1][0] * h[0] + self.e[1][1] * h[1],
        ];
        let residual = t_ts_delta - self.slope * h[0] - self.offset;

        let in_stable_state = current_hypothesis == BandwidthUsage::Normal;
        // Weed out very late frames: they do not fit the Gaussian model.
        let max_residual = 3.0 * self.var_noise.sqrt();
        if residual.abs() < max_residual {
            self.update_noise_estimate(residual, min_frame_period, in_stable_state);
        } else {
            let clamped = if residual < 0.0 { -max_residual } else { max_residual };
            self.update_noise_estimate(clamped, min_frame_period, in_stable_state);
        }

        let denom = self.var_noise + h[0] * eh[0] + h[1] * eh[1];
        let k = [eh[0] / denom, eh[1] / denom];
        let ikh = [
            [1.0 - k[0] * h[0], -k[0] * h[1]],
            [-k[1] * h[0], 1.0 - k[1] * h[1]],
        ];
        let e00 = self.e[0][0];
        let e01 = self.e[0][1];

        self.e[0][0] = e00 * ikh[0][0] + self.e[1][0] * ikh[0][1];
        self.e[0][1] = e01 * ikh[0][0] + self.e[1][1] * ikh[0][1];
        self.e[1][0] = e00 * ikh[1][0] + self.e[1][0] * ikh[1][1];
        self.e[1][1] = e01 * ikh[1][0] + self.e[1][1] * ikh[1][1];

        // The covariance matrix must stay positive semi-definite.
        let positive_semi_definite = self.e[0][0] + self.e[1][1] >= 0.0
            && self.e[0][0] * self.e[1][1] - self.e[0][1] * self.e[1][0] >= 0.0
            && self.e[0][0] >= 0.0;
        if !positive_semi_definite {
            error!("covariance lost positive semi-definiteness, resetting the estimator");
            *self = Self::default();
            return;
        }

        self.slope += k[0] * residual;
        self.prev_offset = self.offset;
        self.offset += k[1] * residual;
    }

    fn update_min_frame_period(&mut self, ts_delta_ms: f64) -> f64 {
        if self.ts_delta_hist.len() >= MIN_FRAME_PERIOD_HISTORY_LENGTH {
            self.ts_delta_hist.pop_front();
        }
        self.ts_delta_hist.push_back(ts_delta_ms);
        self.ts_delta_hist
            .iter()
            .copied()
            .fold(ts_delta_ms, f64::min)
    }

    fn update_noise_estimate(&mut self, residual: f64, ts_delta_ms: f64, stable_state: bool) {
        if !stable_state {
            return;
        }
        // Slow down the noise adaptation once the estimate has settled.
        let alpha: f64 = if self.num_of_deltas > 10 * 30 { 0.002 } else { 0.01 };
        let beta = (1.0 - alpha).powf(ts_delta_ms * 30.0 / 1000.0);
        self.avg_noise = beta * self.avg_noise + (1.0 - beta) * residual;
        self.var_noise = beta * self.var_noise
            + (1.0 - beta) * (self.avg_noise - residual) * (self.avg_noise - residual);
        if self.var_noise < 1.0 {
            self.var_noise = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_constant_positive_offset() {
        let mut estimator = OveruseEstimator::new();
        // Every group arrives 10 ms later than its send spacing suggests.
        // The gain is tiny while the noise variance is still at its initial
        // value, so give the filter room to converge.
        for i in 0..1000 {
            estimator.update(15, 5.0, 0, BandwidthUsage::Normal, i * 5);
        }
        assert!(estimator.offset() > 5.0);
        assert_eq!(estimator.num_of_deltas(), 1000);
    }

    #[test]
    fn test_zero_offset_stays_near_zero() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..60 {
            estimator.update(5, 5.0, 0, BandwidthUsage::Normal, i * 5);
        }
        assert!(estimator.offset().abs() < 1.0);
    }

    #[test]
    fn test_num_of_deltas_saturates() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..1100 {
            estimator.update(5, 5.0, 0, BandwidthUsage::Normal, i);
        }
        assert_eq!(estimator.num_of_deltas(), 1000);
    }

    #[test]
    fn test_var_noise_floor() {
        let mut estimator = OveruseEstimator::new();
        for i in 0..200 {
            estimator.update(5, 5.0, 0, BandwidthUsage::Normal, i * 5);
        }
        assert!(estimator.var_noise() >= 1.0);
    }
}
