//! Sliding-window byte/packet rate measurement over per-millisecond buckets.

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    bytes: usize,
    packets: usize,
}

pub struct RateStatistics {
    buckets: Vec<Bucket>,
    accumulated_bytes: usize,
    accumulated_packets: usize,
    oldest_time_ms: i64,
    oldest_index: usize,
    /// Conversion from accumulated bytes to the returned rate unit.
    scale: f64,
    started: bool,
}

impl RateStatistics {
    /// `window_size_ms` is the window over which the rate is measured, and
    /// `scale` converts bytes-per-window to the output unit (8000 yields
    /// bits per second for a 1000 ms window).
    pub fn new(window_size_ms: usize, scale: f64) -> Self {
        Self {
            buckets: vec![Bucket::default(); window_size_ms],
            accumulated_bytes: 0,
            accumulated_packets: 0,
            oldest_time_ms: 0,
            oldest_index: 0,
            scale: scale / window_size_ms as f64,
            started: false,
        }
    }

    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        self.accumulated_bytes = 0;
        self.accumulated_packets = 0;
        self.oldest_time_ms = 0;
        self.oldest_index = 0;
        self.started = false;
    }

    pub fn update(&mut self, bytes: usize, now_ms: i64) {
        if !self.started {
            self.oldest_time_ms = now_ms;
            self.started = true;
        }
        if now_ms < self.oldest_time_ms {
            // Too old to fit the window.
            return;
        }
        self.erase_old(now_ms);

        let now_offset = (now_ms - self.oldest_time_ms) as usize;
        let mut index = self.oldest_index + now_offset;
        if index >= self.buckets.len() {
            index -= self.buckets.len();
        }
        self.buckets[index].bytes += bytes;
        self.buckets[index].packets += 1;
        self.accumulated_bytes += bytes;
        self.accumulated_packets += 1;
    }

    /// Current rate in the configured output unit; 0 while the window holds
    /// no samples.
    pub fn rate(&mut self, now_ms: i64) -> u32 {
        self.erase_old(now_ms);
        (self.accumulated_bytes as f64 * self.scale + 0.5) as u32
    }

    /// Number of packets currently inside the window.
    pub fn packet_count(&mut self, now_ms: i64) -> usize {
        self.erase_old(now_ms);
        self.accumulated_packets
    }

    fn erase_old(&mut self, now_ms: i64) {
        if !self.started {
            return;
        }
        let new_oldest_time_ms = now_ms - self.buckets.len() as i64 + 1;
        if new_oldest_time_ms <= self.oldest_time_ms {
            return;
        }
        while self.oldest_time_ms < new_oldest_time_ms {
            let old = self.buckets[self.oldest_index];
            self.accumulated_bytes -= old.bytes;
            self.accumulated_packets -= old.packets;
            self.buckets[self.oldest_index] = Bucket::default();
            self.oldest_index += 1;
            if self.oldest_index >= self.buckets.len() {
                self.oldest_index = 0;
            }
            self.oldest_time_ms += 1;
            if self.accumulated_bytes == 0 && self.accumulated_packets == 0 {
                // Everything is gone; skip ahead without touching each bucket.
                self.oldest_time_ms = new_oldest_time_ms;
                break;
            }
        }
    }
}
