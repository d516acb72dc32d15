use crate::frame_ring::FrameRing;
use crate::sample::{Frame, FrameStats};
use crate::sampling::SamplerShared;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, warn};

/// Where computed statistics go. The daemon wires this to the message
/// bus; tests wire it to a vector.
pub type StatsSink = Arc<dyn Fn(FrameStats) + Send + Sync>;

/// Compute tick interval: 1 ms, decoupled from the sample period.
const TICK_NS: i64 = 1_000_000;

const NS_PER_SEC: i64 = 1_000_000_000;

/// Span covered by the coarse aggregate emitted alongside the
/// per-frame statistics.
const COARSE_INTERVAL_NS: u64 = 1_000_000_000;

/// Whether a frame's scheduling error is large enough to undermine the
/// statistics computed from it.
pub(crate) fn jitter_excessive(max_whoosh: u64, sd_whoosh: u64, interval_ns: u64) -> bool {
    max_whoosh >= interval_ns / 10 || sd_whoosh >= interval_ns
}

/// Aggregates per-frame statistics into coarser spans.
#[derive(Default)]
struct CoarseAggregate {
    span_ns: u64,
    frames: u64,
    acc: FrameStats,
}

impl CoarseAggregate {
    fn merge(&mut self, stats: &FrameStats) {
        if self.frames == 0 {
            self.acc = stats.clone();
            self.acc.interval_ns = 0;
        } else {
            let a = &mut self.acc;
            a.max_whoosh = a.max_whoosh.max(stats.max_whoosh);
            a.mean_whoosh += stats.mean_whoosh;
            a.sd_whoosh = a.sd_whoosh.max(stats.sd_whoosh);
            a.min_rx_bytes = a.min_rx_bytes.min(stats.min_rx_bytes);
            a.max_rx_bytes = a.max_rx_bytes.max(stats.max_rx_bytes);
            a.mean_rx_bytes += stats.mean_rx_bytes;
            a.min_tx_bytes = a.min_tx_bytes.min(stats.min_tx_bytes);
            a.max_tx_bytes = a.max_tx_bytes.max(stats.max_tx_bytes);
            a.mean_tx_bytes += stats.mean_tx_bytes;
            a.min_rx_packets = a.min_rx_packets.min(stats.min_rx_packets);
            a.max_rx_packets = a.max_rx_packets.max(stats.max_rx_packets);
            a.mean_rx_packets += stats.mean_rx_packets;
            a.min_tx_packets = a.min_tx_packets.min(stats.min_tx_packets);
            a.max_tx_packets = a.max_tx_packets.max(stats.max_tx_packets);
            a.mean_tx_packets += stats.mean_tx_packets;
        }
        self.frames += 1;
        self.span_ns += stats.interval_ns;
    }

    /// Emits the coarse statistics once a full span has accumulated.
    fn take_if_complete(&mut self) -> Option<FrameStats> {
        if self.span_ns < COARSE_INTERVAL_NS {
            return None;
        }
        let mut stats = std::mem::take(&mut self.acc);
        let frames = std::mem::replace(&mut self.frames, 0);
        self.span_ns = 0;
        stats.interval_ns = COARSE_INTERVAL_NS;
        stats.mean_whoosh /= frames;
        stats.mean_rx_bytes /= frames;
        stats.mean_tx_bytes /= frames;
        stats.mean_rx_packets /= frames;
        stats.mean_tx_packets /= frames;
        Some(stats)
    }
}

/// Turns one completed frame into its aggregate statistics.
pub(crate) fn frame_stats(frame: &Frame) -> FrameStats {
    let n = frame.samples.len().max(1) as u64;

    let mut stats = FrameStats {
        iface: frame.iface.clone(),
        interval_ns: frame.interval_ns(),
        min_rx_bytes: u64::MAX,
        min_tx_bytes: u64::MAX,
        min_rx_packets: u64::MAX,
        min_tx_packets: u64::MAX,
        ..FrameStats::default()
    };

    let mut whoosh_sum = 0u64;
    let mut whoosh_sum_sq = 0u64;
    let mut rx_bytes_sum = 0u64;
    let mut tx_bytes_sum = 0u64;
    let mut rx_packets_sum = 0u64;
    let mut tx_packets_sum = 0u64;
    for sample in &frame.samples {
        let w = sample.whoosh_error_ns;
        stats.max_whoosh = stats.max_whoosh.max(w);
        whoosh_sum += w;
        whoosh_sum_sq += w * w;

        stats.min_rx_bytes = stats.min_rx_bytes.min(sample.rx_bytes_delta);
        stats.max_rx_bytes = stats.max_rx_bytes.max(sample.rx_bytes_delta);
        rx_bytes_sum += sample.rx_bytes_delta;
        stats.min_tx_bytes = stats.min_tx_bytes.min(sample.tx_bytes_delta);
        stats.max_tx_bytes = stats.max_tx_bytes.max(sample.tx_bytes_delta);
        tx_bytes_sum += sample.tx_bytes_delta;
        stats.min_rx_packets = stats.min_rx_packets.min(sample.rx_packets_delta);
        stats.max_rx_packets = stats.max_rx_packets.max(sample.rx_packets_delta);
        rx_packets_sum += sample.rx_packets_delta;
        stats.min_tx_packets = stats.min_tx_packets.min(sample.tx_packets_delta);
        stats.max_tx_packets = stats.max_tx_packets.max(sample.tx_packets_delta);
        tx_packets_sum += sample.tx_packets_delta;
    }

    stats.mean_whoosh = whoosh_sum / n;
    stats.sd_whoosh = (whoosh_sum_sq as f64 / n as f64).sqrt().ceil() as u64;
    // Means are scaled by the samples-per-second factor so viewers see
    // a rate, not a per-sample delta.
    stats.mean_rx_bytes = 1000 * rx_bytes_sum / n;
    stats.mean_tx_bytes = 1000 * tx_bytes_sum / n;
    stats.mean_rx_packets = 1000 * rx_packets_sum / n;
    stats.mean_tx_packets = 1000 * tx_packets_sum / n;
    stats
}

pub(crate) struct ComputeCore {
    ring: Arc<FrameRing>,
    shared: Arc<SamplerShared>,
    sink: StatsSink,
    coarse: CoarseAggregate,
}

impl ComputeCore {
    pub(crate) fn new(ring: Arc<FrameRing>, shared: Arc<SamplerShared>, sink: StatsSink) -> Self {
        Self {
            ring,
            shared,
            sink,
            coarse: CoarseAggregate::default(),
        }
    }

    /// Processes every frame the sampling thread has completed since
    /// the last tick.
    pub(crate) fn drain(&mut self) {
        while self.shared.unsent_frames.load(Ordering::Acquire) > 0 {
            let Ok(frame) = self.ring.pop() else {
                break;
            };
            self.shared.unsent_frames.fetch_sub(1, Ordering::Release);

            let stats = frame_stats(&frame);
            if jitter_excessive(stats.max_whoosh, stats.sd_whoosh, stats.interval_ns) {
                warn!(
                    "excessive scheduling jitter on {}: max {} ns, sd {} ns over {} ns",
                    stats.iface, stats.max_whoosh, stats.sd_whoosh, stats.interval_ns
                );
            }
            self.coarse.merge(&stats);
            (self.sink)(stats);
            if let Some(coarse) = self.coarse.take_if_complete() {
                (self.sink)(coarse);
            }
        }
    }
}

/// Spawns the compute thread: a 1 ms absolute-deadline loop that drains
/// the frame ring and feeds the statistics sink.
pub fn spawn_compute_thread(
    ring: Arc<FrameRing>,
    shared: Arc<SamplerShared>,
    sink: StatsSink,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("jt-compute".to_string())
        .spawn(move || {
            let mut core = ComputeCore::new(ring, shared, sink);

            let now = match clock_gettime(ClockId::CLOCK_MONOTONIC) {
                Ok(now) => now,
                Err(err) => {
                    error!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
                    return;
                }
            };
            let mut deadline_sec = now.tv_sec();
            let mut deadline_nsec = now.tv_nsec();
            loop {
                deadline_nsec += TICK_NS;
                while deadline_nsec >= NS_PER_SEC {
                    deadline_nsec -= NS_PER_SEC;
                    deadline_sec += 1;
                }
                let deadline = TimeSpec::new(deadline_sec, deadline_nsec);
                loop {
                    match nix::time::clock_nanosleep(
                        ClockId::CLOCK_MONOTONIC,
                        nix::time::ClockNanosleepFlags::TIMER_ABSTIME,
                        &deadline,
                    ) {
                        Ok(_) => break,
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(err) => {
                            error!("clock_nanosleep failed: {err}");
                            return;
                        }
                    }
                }
                core.drain();
            }
        })
}

#[cfg(test)]
mod tests {
    use super::{frame_stats, jitter_excessive, ComputeCore};
    use crate::frame_ring::FrameRing;
    use crate::sample::{Frame, FrameStats, Sample, SAMPLES_PER_FRAME};
    use crate::sampling::SamplerShared;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn frame_with(whoosh: &[u64], rx_deltas: &[u64]) -> Frame {
        let mut frame = Frame::begin("em1".to_string(), 1000);
        for i in 0..whoosh.len() {
            frame.samples.push(Sample {
                whoosh_error_ns: whoosh[i],
                rx_bytes_delta: rx_deltas[i],
                tx_bytes_delta: rx_deltas[i] * 2,
                rx_packets_delta: 1,
                tx_packets_delta: 1,
                ..Sample::default()
            });
        }
        frame
    }

    #[test]
    fn whoosh_stats_match_hand_computed_values() {
        let frame = frame_with(&[3, 4, 0, 0, 0, 0, 0, 0, 0, 0], &[0; 10]);
        let stats = frame_stats(&frame);
        assert_eq!(stats.max_whoosh, 4);
        // sum 7 over 10 samples, integer division.
        assert_eq!(stats.mean_whoosh, 0);
        // ceil(sqrt((9 + 16) / 10)) = ceil(1.58) = 2.
        assert_eq!(stats.sd_whoosh, 2);
    }

    #[test]
    fn traffic_means_are_scaled_to_a_rate() {
        let frame = frame_with(&[0; 10], &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        let stats = frame_stats(&frame);
        assert_eq!(stats.min_rx_bytes, 10);
        assert_eq!(stats.max_rx_bytes, 100);
        // 1000 * 550 / 10.
        assert_eq!(stats.mean_rx_bytes, 55_000);
        assert_eq!(stats.mean_tx_bytes, 110_000);
        assert_eq!(stats.interval_ns, 10_000_000);
    }

    #[test]
    fn jitter_thresholds() {
        let interval = 10_000_000;
        assert!(!jitter_excessive(999_999, 0, interval));
        // Max error at a tenth of the interval is already a problem.
        assert!(jitter_excessive(1_000_000, 0, interval));
        assert!(jitter_excessive(0, interval, interval));
    }

    #[test]
    fn drain_emits_per_frame_and_coarse_stats() {
        let ring = Arc::new(FrameRing::new());
        let shared = Arc::new(SamplerShared::new("em1", 1000));
        let seen: Arc<Mutex<Vec<FrameStats>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let mut core = ComputeCore::new(
            ring.clone(),
            shared.clone(),
            Arc::new(move |stats| sink_seen.lock().unwrap().push(stats)),
        );

        // 100 frames of 10 ms each: exactly one second of data. The
        // ring only holds two, so feed and drain alternately.
        for _ in 0..100 {
            ring.push(frame_with(&[1; SAMPLES_PER_FRAME], &[10; SAMPLES_PER_FRAME]))
                .unwrap();
            shared.unsent_frames.fetch_add(1, Ordering::Release);
            core.drain();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 101);
        let coarse = seen.last().unwrap();
        assert_eq!(coarse.interval_ns, 1_000_000_000);
        assert_eq!(coarse.mean_rx_bytes, 10_000);
        assert_eq!(coarse.max_whoosh, 1);
        // Every other message is a per-frame aggregate.
        assert!(seen[..100].iter().all(|s| s.interval_ns == 10_000_000));
    }
}
