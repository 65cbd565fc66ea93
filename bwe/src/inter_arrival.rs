//! Groups packets by send timestamp and yields send/receive/size deltas
//! between consecutive completed groups.
//!
//! Timestamps are 32-bit unsigned with a caller-defined rate; wrap-around is
//! handled via wrapping arithmetic.

use log::warn;

/// Deltas between the two most recently completed timestamp groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deltas {
    /// Send timestamp delta, in timestamp ticks.
    pub timestamp_delta: u32,
    /// Arrival time delta, in milliseconds.
    pub arrival_time_delta_ms: i64,
    /// Accumulated size delta, in bytes.
    pub packet_size_delta: i64,
}

#[derive(Debug, Clone, Copy)]
struct TimestampGroup {
    size: usize,
    first_timestamp: u32,
    timestamp: u32,
    first_arrival_ms: i64,
    complete_time_ms: i64,
    last_system_time_ms: i64,
}

impl TimestampGroup {
    fn is_first_packet(&self) -> bool {
        self.complete_time_ms == -1
    }
}

impl Default for TimestampGroup {
    fn default() -> Self {
        Self {
            size: 0,
            first_timestamp: 0,
            timestamp: 0,
            first_arrival_ms: -1,
            complete_time_ms: -1,
            last_system_time_ms: -1,
        }
    }
}

pub struct InterArrival {
    timestamp_group_length_ticks: u32,
    current_timestamp_group: TimestampGroup,
    prev_timestamp_group: TimestampGroup,
    timestamp_to_ms_coeff: f64,
    burst_grouping: bool,
    num_consecutive_reordered_packets: usize,
}

impl InterArrival {
    /// After this many groups received out of order the filter resets,
    /// assuming the clocks have made a jump.
    const REORDERED_RESET_THRESHOLD: usize = 3;
    const ARRIVAL_TIME_OFFSET_THRESHOLD_MS: i64 = 3000;

    const BURST_DELTA_THRESHOLD_MS: i64 = 5;
    const MAX_BURST_DURATION_MS: i64 = 100;

    /// A group contains all packets whose timestamp is at most
    /// `timestamp_group_length_ticks` newer than the group's first timestamp.
    pub fn new(
        timestamp_group_length_ticks: u32,
        timestamp_to_ms_coeff: f64,
        burst_grouping: bool,
    ) -> Self {
        Self {
            timestamp_group_length_ticks,
            current_timestamp_group: TimestampGroup::default(),
            prev_timestamp_group: TimestampGroup::default(),
            timestamp_to_ms_coeff,
            burst_grouping,
            num_consecutive_reordered_packets: 0,
        }
    }

    /// Feeds one packet. Returns the deltas between the two previous groups
    /// once the current group completes, or `None` while a group is still
    /// open, the packet is out of order, or the filter had to reset.
    pub fn compute_deltas(
        &mut self,
        timestamp: u32,
        arrival_time_ms: i64,
        system_time_ms: i64,
        packet_size: usize,
    ) -> Option<Deltas> {
        let mut deltas = None;
        if self.current_timestamp_group.is_first_packet() {
            self.current_timestamp_group.timestamp = timestamp;
            self.current_timestamp_group.first_timestamp = timestamp;
            self.current_timestamp_group.first_arrival_ms = arrival_time_ms;
        } else if !self.packet_in_order(timestamp) {
            return None;
        } else if self.new_timestamp_group(arrival_time_ms, timestamp) {
            // First packet of a later group: the previous sample is ready.
            if self.prev_timestamp_group.complete_time_ms >= 0 {
                let timestamp_delta = self
                    .current_timestamp_group
                    .timestamp
                    .wrapping_sub(self.prev_timestamp_group.timestamp);
                let arrival_time_delta_ms = self.current_timestamp_group.complete_time_ms
                    - self.prev_timestamp_group.complete_time_ms;
                let system_time_delta_ms = self.current_timestamp_group.last_system_time_ms
                    - self.prev_timestamp_group.last_system_time_ms;
                if arrival_time_delta_ms - system_time_delta_ms
                    >= Self::ARRIVAL_TIME_OFFSET_THRESHOLD_MS
                {
                    warn!(
                        "arrival time clock offset changed (diff={}ms), resetting",
                        arrival_time_delta_ms - system_time_delta_ms
                    );
                    self.reset();
                    return None;
                }
                if arrival_time_delta_ms < 0 {
                    // The group has been reordered since receiving its local
                    // arrival timestamp.
                    self.num_consecutive_reordered_packets += 1;
                    if self.num_consecutive_reordered_packets >= Self::REORDERED_RESET_THRESHOLD {
                        warn!("packets reordered between socket and estimator, resetting");
                        self.reset();
                    }
                    return None;
                }
                self.num_consecutive_reordered_packets = 0;
                let packet_size_delta = self.current_timestamp_group.size as i64
                    - self.prev_timestamp_group.size as i64;
                deltas = Some(Deltas {
                    timestamp_delta,
                    arrival_time_delta_ms,
                    packet_size_delta,
                });
            }
            self.prev_timestamp_group = self.current_timestamp_group;
            self.current_timestamp_group.first_timestamp = timestamp;
            self.current_timestamp_group.timestamp = timestamp;
            self.current_timestamp_group.first_arrival_ms = arrival_time_ms;
            self.current_timestamp_group.size = 0;
        } else {
            self.current_timestamp_group.timestamp =
                latest_timestamp(self.current_timestamp_group.timestamp, timestamp);
        }
        self.current_timestamp_group.size += packet_size;
        self.current_timestamp_group.complete_time_ms = arrival_time_ms;
        self.current_timestamp_group.last_system_time_ms = system_time_ms;

        deltas
    }

    fn packet_in_order(&self, timestamp: u32) -> bool {
        if self.current_timestamp_group.is_first_packet() {
            return true;
        }
        // A diff larger than half the timestamp interval is assumed to be
        // caused by reordering.
        let timestamp_diff = timestamp.wrapping_sub(self.current_timestamp_group.first_timestamp);
        timestamp_diff < 0x8000_0000
    }

    fn new_timestamp_group(&self, arrival_time_ms: i64, timestamp: u32) -> bool {
        if self.current_timestamp_group.is_first_packet() {
            false
        } else if self.belongs_to_burst(arrival_time_ms, timestamp) {
            false
        } else {
            let timestamp_diff =
                timestamp.wrapping_sub(self.current_timestamp_group.first_timestamp);
            timestamp_diff > self.timestamp_group_length_ticks
        }
    }

    fn belongs_to_burst(&self, arrival_time_ms: i64, timestamp: u32) -> bool {
        if !self.burst_grouping {
            return false;
        }
        let arrival_time_delta_ms =
            arrival_time_ms - self.current_timestamp_group.complete_time_ms;
        let timestamp_diff = timestamp.wrapping_sub(self.current_timestamp_group.timestamp);
        let ts_delta_ms = (self.timestamp_to_ms_coeff * timestamp_diff as f64 + 0.5) as i64;
        if ts_delta_ms == 0 {
            return true;
        }
        let propagation_delta_ms = arrival_time_delta_ms - ts_delta_ms;
        propagation_delta_ms < 0
            && arrival_time_delta_ms <= Self::BURST_DELTA_THRESHOLD_MS
            && arrival_time_ms - self.current_timestamp_group.first_arrival_ms
                < Self::MAX_BURST_DURATION_MS
    }

    fn reset(&mut self) {
        self.num_consecutive_reordered_packets = 0;
        self.current_timestamp_group = TimestampGroup::default();
        self.prev_timestamp_group = TimestampGroup::default();
    }
}

fn is_newer_timestamp(timestamp: u32, prev_timestamp: u32) -> bool {
    timestamp != prev_timestamp && timestamp.wrapping_sub(prev_timestamp) < 0x8000_0000
}

fn latest_timestamp(timestamp1: u32, timestamp2: u32) -> u32 {
    if is_newer_timestamp(timestamp2, timestamp1) {
        timestamp2
    } else {
        timestamp1
    }
}
