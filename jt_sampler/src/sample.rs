use serde::Serialize;

/// Samples per frame. One frame spans exactly one reporting interval:
/// 10 ms at the default 1000 us sample period.
pub const SAMPLES_PER_FRAME: usize = 10;

/// One timestamped reading of an interface's packet/byte counters,
/// with deltas against the previous reading and the scheduling error
/// of the wake that captured it.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Sample {
    /// Monotonic capture time, nanoseconds.
    pub timestamp_ns: u64,
    /// Absolute deviation between the actual wake time and the
    /// scheduled deadline ("whoosh" - the sound of a missed deadline).
    pub whoosh_error_ns: u64,
    /// Cumulative counters as reported by the kernel.
    pub rx_bytes: u64,
    /// Cumulative transmitted bytes.
    pub tx_bytes: u64,
    /// Cumulative received packets (including compressed).
    pub rx_packets: u64,
    /// Cumulative transmitted packets (including compressed).
    pub tx_packets: u64,
    /// Change since the previous reading; zero after a re-baseline
    /// (interface switch or counter regression).
    pub rx_bytes_delta: u64,
    /// Transmitted-bytes delta.
    pub tx_bytes_delta: u64,
    /// Received-packets delta.
    pub rx_packets_delta: u64,
    /// Transmitted-packets delta.
    pub tx_packets_delta: u64,
}

/// A fixed batch of consecutive samples from one interface: the unit
/// handed from the sampling thread to the compute thread.
///
/// The whoosh aggregates are populated by the compute stage, not at
/// capture time.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// Interface the samples were read from.
    pub iface: String,
    /// Sample period in effect while the frame was captured.
    pub sample_period_us: u32,
    /// Exactly [`SAMPLES_PER_FRAME`] samples once the frame is complete.
    pub samples: Vec<Sample>,
    /// Mean whoosh error over the frame (filled by the compute stage).
    pub whoosh_err_mean: u64,
    /// Maximum whoosh error over the frame.
    pub whoosh_err_max: u64,
    /// Standard deviation of the whoosh error over the frame.
    pub whoosh_err_sd: u64,
}

impl Frame {
    /// An empty frame ready for capture on `iface`.
    pub fn begin(iface: String, sample_period_us: u32) -> Self {
        Self {
            iface,
            sample_period_us,
            samples: Vec::with_capacity(SAMPLES_PER_FRAME),
            whoosh_err_mean: 0,
            whoosh_err_max: 0,
            whoosh_err_sd: 0,
        }
    }

    /// The reporting interval this frame spans, in nanoseconds.
    pub fn interval_ns(&self) -> u64 {
        self.sample_period_us as u64 * 1000 * SAMPLES_PER_FRAME as u64
    }
}

/// Aggregate statistics computed over one frame (or a coarser span of
/// frames), ready for encoding into a wire message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameStats {
    /// Interface the statistics describe.
    pub iface: String,
    /// Span the aggregates cover, nanoseconds. Routes the message to
    /// its delivery tier.
    pub interval_ns: u64,
    /// Largest whoosh error in the span.
    pub max_whoosh: u64,
    /// Mean whoosh error (`sum / n`).
    pub mean_whoosh: u64,
    /// Whoosh standard deviation (`ceil(sqrt(sum_sq / n))`).
    pub sd_whoosh: u64,
    /// Smallest per-sample received-bytes delta.
    pub min_rx_bytes: u64,
    /// Largest per-sample received-bytes delta.
    pub max_rx_bytes: u64,
    /// Received bytes scaled to a per-second rate.
    pub mean_rx_bytes: u64,
    /// Smallest per-sample transmitted-bytes delta.
    pub min_tx_bytes: u64,
    /// Largest per-sample transmitted-bytes delta.
    pub max_tx_bytes: u64,
    /// Transmitted bytes scaled to a per-second rate.
    pub mean_tx_bytes: u64,
    /// Smallest per-sample received-packets delta.
    pub min_rx_packets: u64,
    /// Largest per-sample received-packets delta.
    pub max_rx_packets: u64,
    /// Received packets scaled to a per-second rate.
    pub mean_rx_packets: u64,
    /// Smallest per-sample transmitted-packets delta.
    pub min_tx_packets: u64,
    /// Largest per-sample transmitted-packets delta.
    pub max_tx_packets: u64,
    /// Transmitted packets scaled to a per-second rate.
    pub mean_tx_packets: u64,
}
