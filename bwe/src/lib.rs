#![warn(rust_2018_idioms)]

pub mod abs_send_time;
pub mod aimd_rate_control;
pub mod inter_arrival;
pub mod overuse_detector;
pub mod overuse_estimator;
pub mod rate_statistics;

pub use abs_send_time::{RemoteBitrateEstimatorAbsSendTime, RemoteBitrateUpdate};
pub use aimd_rate_control::AimdRateControl;

/// Bandwidth usage hypothesis produced by the overuse detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthUsage {
    #[default]
    Normal,
    Underusing,
    Overusing,
}

/// Input fed to the AIMD rate controller on each estimate update.
#[derive(Debug, Clone, Copy)]
pub struct RateControlInput {
    pub bw_state: BandwidthUsage,
    pub incoming_bitrate_bps: u32,
    pub noise_var: f64,
}
