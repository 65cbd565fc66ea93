//! Remote bitrate estimator driven by the absolute-send-time header
//! extension: inter-arrival deltas feed the Kalman estimator and overuse
//! detector, probe packets are clustered for initial bandwidth discovery,
//! and the AIMD control loop produces the target bitrate.

use std::collections::HashMap;

use log::debug;

use crate::aimd_rate_control::AimdRateControl;
use crate::inter_arrival::InterArrival;
use crate::overuse_detector::OveruseDetector;
use crate::overuse_estimator::OveruseEstimator;
use crate::rate_statistics::RateStatistics;
use crate::{BandwidthUsage, RateControlInput};

const TIMESTAMP_GROUP_LENGTH_MS: u64 = 5;
/// Fractional bits of the 24-bit absolute send time.
const ABS_SEND_TIME_FRACTION: u32 = 18;
/// Upshift applied so the timestamp fills 32 bits and wrap-around detection
/// in the inter-arrival works.
const ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT: u32 = 8;
const INTER_ARRIVAL_SHIFT: u32 = ABS_SEND_TIME_FRACTION + ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT;
const TIMESTAMP_TO_MS: f64 = 1000.0 / (1u64 << INTER_ARRIVAL_SHIFT) as f64;

const INITIAL_PROBING_INTERVAL_MS: i64 = 2000;
const MIN_CLUSTER_SIZE: usize = 4;
const MAX_PROBE_PACKETS: usize = 15;
const EXPECTED_NUMBER_OF_PROBES: usize = 3;
/// Packets larger than this are assumed to be paced by the sender.
const MIN_PROBE_PACKET_SIZE: usize = 200;

const STREAM_TIMEOUT_MS: i64 = 2000;

const INCOMING_BITRATE_WINDOW_MS: usize = 1000;
const INCOMING_BITRATE_SCALE: f64 = 8000.0;

#[derive(Debug, Clone, Copy)]
struct Probe {
    send_time_ms: i64,
    recv_time_ms: i64,
    payload_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cluster {
    send_mean_ms: f64,
    recv_mean_ms: f64,
    mean_size: usize,
    count: usize,
    num_above_min_delta: usize,
}

impl Cluster {
    fn send_bitrate_bps(&self) -> f64 {
        self.mean_size as f64 * 8.0 * 1000.0 / self.send_mean_ms
    }

    fn recv_bitrate_bps(&self) -> f64 {
        self.mean_size as f64 * 8.0 * 1000.0 / self.recv_mean_ms
    }
}

/// Emitted when the target bitrate changed for the currently active streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBitrateUpdate {
    pub ssrcs: Vec<u32>,
    pub bitrate_bps: u32,
}

enum ProbeResult {
    BitrateUpdated,
    NoUpdate,
}

pub struct RemoteBitrateEstimatorAbsSendTime {
    /// Active streams with the time they were last seen.
    ssrcs: HashMap<u32, i64>,
    inter_arrival: InterArrival,
    estimator: OveruseEstimator,
    detector: OveruseDetector,
    remote_rate: AimdRateControl,
    incoming_bitrate: RateStatistics,
    incoming_bitrate_initialized: bool,
    probes: Vec<Probe>,
    total_probes_received: usize,
    first_packet_time_ms: i64,
    last_update_ms: i64,
}

fn make_inter_arrival() -> InterArrival {
    InterArrival::new(
        ((TIMESTAMP_GROUP_LENGTH_MS << INTER_ARRIVAL_SHIFT) / 1000) as u32,
        TIMESTAMP_TO_MS,
        true,
    )
}

impl Default for RemoteBitrateEstimatorAbsSendTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBitrateEstimatorAbsSendTime {
    pub fn new() -> Self {
        Self {
            ssrcs: HashMap::new(),
            inter_arrival: make_inter_arrival(),
            estimator: OveruseEstimator::new(),
            detector: OveruseDetector::new(),
            remote_rate: AimdRateControl::new(),
            incoming_bitrate: RateStatistics::new(
                INCOMING_BITRATE_WINDOW_MS,
                INCOMING_BITRATE_SCALE,
            ),
            incoming_bitrate_initialized: false,
            probes: vec![],
            total_probes_received: 0,
            first_packet_time_ms: -1,
            last_update_ms: -1,
        }
    }

    pub fn set_rtt(&mut self, rtt_ms: i64) {
        self.remote_rate.set_rtt(rtt_ms);
    }

    pub fn set_min_bitrate(&mut self, min_bitrate_bps: u32) {
        self.remote_rate.set_min_bitrate(min_bitrate_bps);
    }

    /// Last committed estimate together with the streams it applies to, once
    /// one exists.
    pub fn latest_estimate(&self) -> Option<RemoteBitrateUpdate> {
        if !self.remote_rate.valid_estimate() {
            return None;
        }
        let ssrcs = self.active_ssrcs();
        let bitrate_bps = if ssrcs.is_empty() {
            0
        } else {
            self.remote_rate.latest_estimate()
        };
        Some(RemoteBitrateUpdate { ssrcs, bitrate_bps })
    }

    /// Feeds one incoming media packet.
    ///
    /// `send_time_24bits` is the raw 24-bit absolute-send-time value from
    /// the header extension. Returns a bitrate update when the estimate was
    /// recomputed and is valid.
    pub fn incoming_packet(
        &mut self,
        arrival_time_ms: i64,
        payload_size: usize,
        ssrc: u32,
        send_time_24bits: u32,
        now_ms: i64,
    ) -> Option<RemoteBitrateUpdate> {
        assert!(send_time_24bits < (1 << 24), "invalid abs-send-time value");
        // Fill the full 32 bits so wrap-around is handled correctly.
        let timestamp = send_time_24bits << ABS_SEND_TIME_INTER_ARRIVAL_UPSHIFT;
        let send_time_ms = (timestamp as f64 * TIMESTAMP_TO_MS) as i64;

        let incoming_bitrate = self.incoming_bitrate.rate(arrival_time_ms);
        if incoming_bitrate > 0 {
            self.incoming_bitrate_initialized = true;
        } else if self.incoming_bitrate_initialized {
            // The window ran dry after having been valid; start over so it
            // only contains fresh data points.
            self.incoming_bitrate.reset();
            self.incoming_bitrate_initialized = false;
        }
        self.incoming_bitrate.update(payload_size, arrival_time_ms);

        if self.first_packet_time_ms == -1 {
            self.first_packet_time_ms = now_ms;
        }

        let mut update_estimate = false;

        self.timeout_streams(now_ms);
        self.ssrcs.insert(ssrc, now_ms);

        // Probes are only searched for while the estimate has not settled.
        if payload_size > MIN_PROBE_PACKET_SIZE
            && (!self.remote_rate.valid_estimate()
                || now_ms - self.first_packet_time_ms < INITIAL_PROBING_INTERVAL_MS)
            && self.total_probes_received < MAX_PROBE_PACKETS
        {
            debug!(
                "probe packet received [send:{}ms, recv:{}ms, size:{}]",
                send_time_ms, arrival_time_ms, payload_size
            );
            self.probes.push(Probe {
                send_time_ms,
                recv_time_ms: arrival_time_ms,
                payload_size,
            });
            self.total_probes_received += 1;
            // A probe that moved the bitrate must take effect immediately.
            if let ProbeResult::BitrateUpdated = self.process_clusters(now_ms) {
                update_estimate = true;
            }
        }

        if let Some(deltas) =
            self.inter_arrival
                .compute_deltas(timestamp, arrival_time_ms, now_ms, payload_size)
        {
            let ts_delta_ms = deltas.timestamp_delta as f64 * TIMESTAMP_TO_MS;
            self.estimator.update(
                deltas.arrival_time_delta_ms,
                ts_delta_ms,
                deltas.packet_size_delta,
                self.detector.state(),
                arrival_time_ms,
            );
            self.detector.detect(
                self.estimator.offset(),
                ts_delta_ms,
                self.estimator.num_of_deltas(),
                arrival_time_ms,
            );
        }

        if !update_estimate {
            // Periodic update, or a forced one when over-using and the
            // target has drifted above what is actually being received.
            if self.last_update_ms == -1
                || now_ms - self.last_update_ms > self.remote_rate.feedback_interval_ms()
            {
                update_estimate = true;
            } else if self.detector.state() == BandwidthUsage::Overusing {
                let incoming_rate = self.incoming_bitrate.rate(arrival_time_ms);
                if incoming_rate > 0
                    && self.remote_rate.time_to_reduce_further(now_ms, incoming_rate)
                {
                    update_estimate = true;
                }
            }
        }

        if update_estimate {
            let input = RateControlInput {
                bw_state: self.detector.state(),
                incoming_bitrate_bps: self.incoming_bitrate.rate(arrival_time_ms),
                noise_var: self.estimator.var_noise(),
            };
            self.remote_rate.update(&input, now_ms);
            let target_bitrate_bps = self.remote_rate.update_bandwidth_estimate(now_ms);
            if self.remote_rate.valid_estimate() {
                self.last_update_ms = now_ms;
                return Some(RemoteBitrateUpdate {
                    ssrcs: self.active_ssrcs(),
                    bitrate_bps: target_bitrate_bps,
                });
            }
        }
        None
    }

    fn active_ssrcs(&self) -> Vec<u32> {
        let mut ssrcs: Vec<u32> = self.ssrcs.keys().copied().collect();
        ssrcs.sort_unstable();
        ssrcs
    }

    fn timeout_streams(&mut self, now_ms: i64) {
        self.ssrcs
            .retain(|_, last_seen_ms| now_ms - *last_seen_ms <= STREAM_TIMEOUT_MS);
        if self.ssrcs.is_empty() {
            // Without any active stream the filters are meaningless; restart
            // them. first_packet_time_ms is kept since probing only happens
            // at the beginning of a session.
            self.inter_arrival = make_inter_arrival();
            self.estimator = OveruseEstimator::new();
        }
    }

    fn process_clusters(&mut self, now_ms: i64) -> ProbeResult {
        let clusters = self.compute_clusters();
        if clusters.is_empty() {
            // All probes spent without a cluster: make room for a new one.
            if self.probes.len() >= MAX_PROBE_PACKETS {
                self.probes.remove(0);
            }
            return ProbeResult::NoUpdate;
        }

        if let Some(best) = find_best_probe(&clusters) {
            let probe_bitrate_bps =
                best.send_bitrate_bps().min(best.recv_bitrate_bps()) as u32;
            // A probe sent at a lower bitrate than the estimate must not
            // reduce it.
            if self.is_bitrate_improving(probe_bitrate_bps) {
                debug!(
                    "probe successful [sent:{}bps, received:{}bps, probes:{}]",
                    best.send_bitrate_bps(),
                    best.recv_bitrate_bps(),
                    best.count
                );
                self.remote_rate.set_estimate(probe_bitrate_bps, now_ms);
                return ProbeResult::BitrateUpdated;
            }
        }

        if clusters.len() >= EXPECTED_NUMBER_OF_PROBES {
            // Probing epoch complete.
            self.probes.clear();
        }
        ProbeResult::NoUpdate
    }

    fn is_bitrate_improving(&self, new_bitrate_bps: u32) -> bool {
        let initial_probe = !self.remote_rate.valid_estimate() && new_bitrate_bps > 0;
        let bitrate_above_estimate = self.remote_rate.valid_estimate()
            && new_bitrate_bps > self.remote_rate.latest_estimate();
        initial_probe || bitrate_above_estimate
    }

    fn compute_clusters(&self) -> Vec<Cluster> {
        let mut clusters = vec![];
        let mut current = Cluster::default();
        let mut prev: Option<Probe> = None;
        for probe in &self.probes {
            if let Some(prev) = prev {
                let send_delta_ms = probe.send_time_ms - prev.send_time_ms;
                let recv_delta_ms = probe.recv_time_ms - prev.recv_time_ms;
                if send_delta_ms >= 1 && recv_delta_ms >= 1 {
                    current.num_above_min_delta += 1;
                }
                if !is_within_cluster_bounds(send_delta_ms, &current) {
                    if current.count >= MIN_CLUSTER_SIZE {
                        clusters.push(finish_cluster(current));
                    }
                    current = Cluster::default();
                }
                current.send_mean_ms += send_delta_ms as f64;
                current.recv_mean_ms += recv_delta_ms as f64;
                current.mean_size += probe.payload_size;
                current.count += 1;
            }
            prev = Some(*probe);
        }
        if current.count >= MIN_CLUSTER_SIZE {
            clusters.push(finish_cluster(current));
        }
        clusters
    }
}

fn finish_cluster(mut cluster: Cluster) -> Cluster {
    cluster.send_mean_ms /= cluster.count as f64;
    cluster.recv_mean_ms /= cluster.count as f64;
    cluster.mean_size /= cluster.count;
    cluster
}

fn is_within_cluster_bounds(send_delta_ms: i64, cluster: &Cluster) -> bool {
    if cluster.count == 0 {
        return true;
    }
    let cluster_mean_ms = cluster.send_mean_ms / cluster.count as f64;
    (send_delta_ms as f64 - cluster_mean_ms).abs() < 2.5
}

fn find_best_probe(clusters: &[Cluster]) -> Option<&Cluster> {
    let mut highest_probe_bitrate_bps = 0.0;
    let mut best = None;
    for cluster in clusters {
        if cluster.send_mean_ms == 0.0 || cluster.recv_mean_ms == 0.0 {
            continue;
        }
        if cluster.num_above_min_delta > cluster.count / 2
            && cluster.recv_mean_ms - cluster.send_mean_ms <= 2.0
            && cluster.send_mean_ms - cluster.recv_mean_ms <= 5.0
        {
            let probe_bitrate_bps = cluster.send_bitrate_bps().min(cluster.recv_bitrate_bps());
            if probe_bitrate_bps > highest_probe_bitrate_bps {
                highest_probe_bitrate_bps = probe_bitrate_bps;
                best = Some(cluster);
            }
        } else {
            debug!(
                "probe failed [sent:{}bps, received:{}bps, probes:{}]",
                cluster.send_bitrate_bps(),
                cluster.recv_bitrate_bps(),
                cluster.count
            );
            // Probes arrive as one contiguous burst: stop scanning at the
            // first failed cluster.
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_ms_to_24bits(time_ms: i64) -> u32 {
        ((((time_ms as u64) << ABS_SEND_TIME_FRACTION) + 500) / 1000) as u32 & 0x00FF_FFFF
    }

    fn probe(
        estimator: &mut RemoteBitrateEstimatorAbsSendTime,
        send_ms: i64,
        recv_ms: i64,
        size: usize,
        ssrc: u32,
    ) -> Option<RemoteBitrateUpdate> {
        estimator.incoming_packet(recv_ms, size, ssrc, convert_ms_to_24bits(send_ms), recv_ms)
    }

    #[test]
    fn test_no_estimate_before_any_measurement() {
        let estimator = RemoteBitrateEstimatorAbsSendTime::new();
        assert!(estimator.latest_estimate().is_none());
    }

    #[test]
    fn test_probe_cluster_produces_initial_estimate() {
        let mut estimator = RemoteBitrateEstimatorAbsSendTime::new();
        // Six probes, 1200 bytes each, 5 ms apart on both clocks:
        // 1200 * 8 * 1000 / 5 = 1_920_000 bps.
        for i in 0..6 {
            probe(&mut estimator, i * 5, 10 + i * 5, 1200, 0xCAFE);
        }
        let update = estimator.latest_estimate().expect("estimate after probing");
        assert_eq!(update.bitrate_bps, 1_920_000);
        assert_eq!(update.ssrcs, vec![0xCAFE]);
    }

    #[test]
    fn test_faster_probe_cluster_is_preferred() {
        let mut estimator = RemoteBitrateEstimatorAbsSendTime::new();
        for i in 0..6 {
            probe(&mut estimator, i * 5, 10 + i * 5, 1200, 0xCAFE);
        }
        assert_eq!(estimator.latest_estimate().unwrap().bitrate_bps, 1_920_000);

        // A second burst spaced 2 ms apart: 1200 * 8 * 1000 / 2 = 4_800_000.
        let base = 25;
        for i in 1..=6 {
            probe(&mut estimator, base + i * 2, 35 + i * 2, 1200, 0xCAFE);
        }
        assert_eq!(estimator.latest_estimate().unwrap().bitrate_bps, 4_800_000);
    }

    #[test]
    fn test_probe_emits_update_immediately() {
        let mut estimator = RemoteBitrateEstimatorAbsSendTime::new();
        let mut updates = vec![];
        for i in 0..6 {
            if let Some(update) = probe(&mut estimator, i * 5, 10 + i * 5, 1200, 1) {
                updates.push(update);
            }
        }
        // The cluster forms on the fifth probe and is flushed to the
        // observer without waiting for the feedback interval.
        assert!(!updates.is_empty());
        assert_eq!(updates[0].bitrate_bps, 1_920_000);
    }

    #[test]
    fn test_small_packets_are_not_probes() {
        let mut estimator = RemoteBitrateEstimatorAbsSendTime::new();
        for i in 0..10 {
            probe(&mut estimator, i * 5, 10 + i * 5, 100, 1);
        }
        assert!(estimator.latest_estimate().is_none());
    }

    #[test]
    fn test_ssrc_timeout() {
        let mut estimator = RemoteBitrateEstimatorAbsSendTime::new();
        for i in 0..6 {
            probe(&mut estimator, i * 5, 10 + i * 5, 1200, 1);
        }
        assert_eq!(estimator.latest_estimate().unwrap().ssrcs, vec![1]);

        // 2.5 s later stream 1 has expired; only stream 2 is active.
        probe(&mut estimator, 3000, 3010, 100, 2);
        assert_eq!(estimator.latest_estimate().unwrap().ssrcs, vec![2]);
    }
}
