use crate::counters::{CounterError, CounterSource, InterfaceCounters};
use crate::frame_ring::FrameRing;
use crate::sample::{Frame, Sample, SAMPLES_PER_FRAME};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Shortest supported sample period. Requests below this are clamped.
pub const MIN_SAMPLE_PERIOD_US: u32 = 100;

const NS_PER_SEC: i64 = 1_000_000_000;

/// Errors from the sampling pipeline.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// Counter source failure.
    #[error(transparent)]
    Counter(#[from] CounterError),
    /// The sampling thread could not be spawned.
    #[error("unable to spawn sampling thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Control state shared between the sampling thread and the rest of the
/// daemon. Writers are the message handlers; the only reader that
/// matters for timing is the sampling thread, which re-reads this state
/// at each frame boundary.
pub struct SamplerShared {
    iface: Mutex<String>,
    period_us: AtomicU32,
    rebaseline: AtomicBool,
    /// Frames pushed to the ring but not yet consumed by the compute
    /// thread. The compute thread decrements as it pops.
    pub unsent_frames: AtomicU64,
}

impl SamplerShared {
    /// Shared state starting on `iface` at `period_us` (clamped).
    pub fn new(iface: &str, period_us: u32) -> Self {
        Self {
            iface: Mutex::new(iface.to_string()),
            period_us: AtomicU32::new(period_us.max(MIN_SAMPLE_PERIOD_US)),
            rebaseline: AtomicBool::new(true),
            unsent_frames: AtomicU64::new(0),
        }
    }

    /// Sets the sample period. Values below [`MIN_SAMPLE_PERIOD_US`]
    /// are clamped up; the new period takes effect at the next frame
    /// boundary. Returns the period actually applied.
    pub fn set_sample_period(&self, period_us: u32) -> u32 {
        let clamped = period_us.max(MIN_SAMPLE_PERIOD_US);
        if clamped != period_us {
            info!("sample period {period_us} us clamped to {clamped} us");
        }
        if self.period_us.swap(clamped, Ordering::Relaxed) != clamped {
            // Deltas against the old cadence would misstate rates.
            self.rebaseline.store(true, Ordering::Release);
        }
        clamped
    }

    /// The sample period currently in effect.
    pub fn sample_period_us(&self) -> u32 {
        self.period_us.load(Ordering::Relaxed)
    }

    /// Redirects sampling to another interface at the next frame
    /// boundary. Counter deltas re-baseline so the first reading on the
    /// new interface reports no phantom burst.
    pub fn switch_interface(&self, iface: &str) {
        let mut current = self.lock_iface();
        if *current == iface {
            return;
        }
        info!("switching sampled interface from {current} to {iface}");
        *current = iface.to_string();
        self.rebaseline.store(true, Ordering::Release);
    }

    /// The interface currently being sampled.
    pub fn interface(&self) -> String {
        self.lock_iface().clone()
    }

    fn take_rebaseline(&self) -> bool {
        self.rebaseline.swap(false, Ordering::AcqRel)
    }

    fn lock_iface(&self) -> std::sync::MutexGuard<'_, String> {
        self.iface.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The per-tick sampling logic, separated from the thread and its
/// clock so it can be driven directly in tests.
pub(crate) struct SamplerCore<C: CounterSource> {
    source: C,
    shared: Arc<SamplerShared>,
    ring: Arc<FrameRing>,
    frame: Frame,
    prev: Option<InterfaceCounters>,
}

impl<C: CounterSource> SamplerCore<C> {
    pub(crate) fn new(source: C, shared: Arc<SamplerShared>, ring: Arc<FrameRing>) -> Self {
        let frame = Frame::begin(shared.interface(), shared.sample_period_us());
        Self {
            source,
            shared,
            ring,
            frame,
            prev: None,
        }
    }

    /// The period the in-progress frame was started with, in
    /// nanoseconds. Drives the absolute deadlines until rollover.
    pub(crate) fn period_ns(&self) -> i64 {
        self.frame.sample_period_us as i64 * 1000
    }

    /// Captures one sample at `wake_ns` against the scheduled
    /// `deadline_ns` and, on the frame boundary, hands the completed
    /// frame to the ring.
    ///
    /// Returns `false` only on a ring separation violation, which the
    /// caller must treat as fatal.
    pub(crate) fn tick(&mut self, wake_ns: u64, deadline_ns: u64) -> bool {
        let counters = match self.source.read_counters(&self.frame.iface) {
            Ok(counters) => counters,
            Err(err) => {
                debug!("counter read failed on {}: {err}", self.frame.iface);
                self.prev = None;
                InterfaceCounters::default()
            }
        };

        let mut sample = Sample {
            timestamp_ns: wake_ns,
            whoosh_error_ns: wake_ns.abs_diff(deadline_ns),
            rx_bytes: counters.rx_bytes,
            tx_bytes: counters.tx_bytes,
            rx_packets: counters.rx_packets,
            tx_packets: counters.tx_packets,
            ..Sample::default()
        };
        if let Some(prev) = self.prev {
            // A cumulative counter running backwards means the kernel
            // reset it (device re-created, driver reload). Re-baseline
            // instead of reporting a wrapped delta.
            let regressed = counters.rx_bytes < prev.rx_bytes
                || counters.tx_bytes < prev.tx_bytes
                || counters.rx_packets < prev.rx_packets
                || counters.tx_packets < prev.tx_packets;
            if !regressed {
                sample.rx_bytes_delta = counters.rx_bytes - prev.rx_bytes;
                sample.tx_bytes_delta = counters.tx_bytes - prev.tx_bytes;
                sample.rx_packets_delta = counters.rx_packets - prev.rx_packets;
                sample.tx_packets_delta = counters.tx_packets - prev.tx_packets;
            }
        }
        self.prev = Some(counters);
        self.frame.samples.push(sample);

        if self.frame.samples.len() == SAMPLES_PER_FRAME {
            let next = self.begin_next_frame();
            let full = std::mem::replace(&mut self.frame, next);
            if self.ring.push(full).is_err() {
                return false;
            }
            self.shared.unsent_frames.fetch_add(1, Ordering::Release);
        }
        true
    }

    /// Re-snapshots the interface and period at the frame boundary, so
    /// control changes land between frames rather than inside one.
    fn begin_next_frame(&mut self) -> Frame {
        let iface = self.shared.interface();
        if self.shared.take_rebaseline() || iface != self.frame.iface {
            self.prev = None;
        }
        Frame::begin(iface, self.shared.sample_period_us())
    }
}

fn timespec_ns(ts: TimeSpec) -> u64 {
    (ts.tv_sec() * NS_PER_SEC + ts.tv_nsec()) as u64
}

/// Best-effort promotion of the calling thread to the real-time FIFO
/// scheduling class, optionally pinned to one CPU. Failures (typically
/// missing CAP_SYS_NICE) degrade to normal scheduling with a warning.
fn set_realtime(rt_cpu: Option<usize>) {
    let param = libc::sched_param { sched_priority: 5 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(
            "unable to set SCHED_FIFO (run as root or grant CAP_SYS_NICE): {}",
            std::io::Error::last_os_error()
        );
    }
    if let Some(cpu) = rt_cpu {
        let mut cpu_set = nix::sched::CpuSet::new();
        let pinned = cpu_set
            .set(cpu)
            .and_then(|_| nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set));
        if let Err(err) = pinned {
            warn!("unable to pin sampling thread to cpu {cpu}: {err}");
        }
    }
}

/// Spawns the deadline-scheduled sampling thread.
///
/// The thread wakes on absolute `CLOCK_MONOTONIC` deadlines spaced one
/// sample period apart, reads the counters, and pushes a completed
/// frame to `ring` every [`SAMPLES_PER_FRAME`] wakes. It never blocks
/// on any downstream consumer. A ring separation violation aborts the
/// process: by then the timing contract is already broken.
pub fn spawn_sampling_thread<C: CounterSource + 'static>(
    source: C,
    shared: Arc<SamplerShared>,
    ring: Arc<FrameRing>,
    rt_cpu: Option<usize>,
) -> Result<std::thread::JoinHandle<()>, SamplerError> {
    let handle = std::thread::Builder::new()
        .name("jt-sample".to_string())
        .spawn(move || {
            set_realtime(rt_cpu);
            let mut core = SamplerCore::new(source, shared, ring);

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
                // Advance the absolute deadline, normalizing the
                // nanosecond field across second boundaries.
                deadline_nsec += core.period_ns();
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

                let wake = match clock_gettime(ClockId::CLOCK_MONOTONIC) {
                    Ok(wake) => wake,
                    Err(err) => {
                        error!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
                        return;
                    }
                };
                if !core.tick(timespec_ns(wake), timespec_ns(deadline)) {
                    error!("frame ring separation violated; aborting");
                    std::process::abort();
                }
            }
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::{SamplerCore, SamplerShared, MIN_SAMPLE_PERIOD_US};
    use crate::counters::{CounterError, CounterSource, InterfaceCounters};
    use crate::frame_ring::FrameRing;
    use crate::sample::SAMPLES_PER_FRAME;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Counter source whose counters grow by a fixed step per read.
    struct SteadySource {
        reads: AtomicU64,
        step_bytes: u64,
        step_packets: u64,
    }

    impl SteadySource {
        fn new(step_bytes: u64, step_packets: u64) -> Self {
            Self {
                reads: AtomicU64::new(0),
                step_bytes,
                step_packets,
            }
        }
    }

    impl CounterSource for SteadySource {
        fn read_counters(&self, _iface: &str) -> Result<InterfaceCounters, CounterError> {
            let n = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(InterfaceCounters {
                rx_bytes: n * self.step_bytes,
                tx_bytes: n * self.step_bytes * 2,
                rx_packets: n * self.step_packets,
                tx_packets: n * self.step_packets * 2,
            })
        }
    }

    fn pipeline<C: CounterSource>(source: C) -> (SamplerCore<C>, Arc<SamplerShared>, Arc<FrameRing>) {
        let shared = Arc::new(SamplerShared::new("em1", 1000));
        let ring = Arc::new(FrameRing::new());
        let core = SamplerCore::new(source, shared.clone(), ring.clone());
        (core, shared, ring)
    }

    #[test]
    fn ten_ticks_produce_one_frame() {
        let (mut core, shared, ring) = pipeline(SteadySource::new(100, 2));
        let period = core.period_ns() as u64;
        for i in 0..SAMPLES_PER_FRAME as u64 {
            let deadline = (i + 1) * period;
            assert!(core.tick(deadline + 5_000, deadline));
        }
        assert_eq!(shared.unsent_frames.load(Ordering::Acquire), 1);

        let frame = ring.pop().unwrap();
        assert_eq!(frame.iface, "em1");
        assert_eq!(frame.samples.len(), SAMPLES_PER_FRAME);
        // First read is the baseline: no delta.
        assert_eq!(frame.samples[0].rx_bytes_delta, 0);
        for sample in &frame.samples[1..] {
            assert_eq!(sample.rx_bytes_delta, 100);
            assert_eq!(sample.tx_bytes_delta, 200);
            assert_eq!(sample.rx_packets_delta, 2);
            assert_eq!(sample.tx_packets_delta, 4);
            assert_eq!(sample.whoosh_error_ns, 5_000);
        }
        assert!(ring.pop().is_err());
    }

    #[test]
    fn interface_switch_lands_on_the_frame_boundary() {
        let (mut core, shared, ring) = pipeline(SteadySource::new(100, 2));
        for i in 0..5u64 {
            core.tick(i, i);
        }
        shared.switch_interface("wlan0");
        // The in-progress frame keeps its interface.
        for i in 5..SAMPLES_PER_FRAME as u64 {
            core.tick(i, i);
        }
        assert_eq!(ring.pop().unwrap().iface, "em1");

        for i in 0..SAMPLES_PER_FRAME as u64 {
            core.tick(i, i);
        }
        let frame = ring.pop().unwrap();
        assert_eq!(frame.iface, "wlan0");
        // Re-baselined: the first sample on the new interface shows no
        // phantom burst.
        assert_eq!(frame.samples[0].rx_bytes_delta, 0);
    }

    #[test]
    fn counter_regression_rebaselines() {
        struct ResettingSource {
            reads: AtomicU64,
        }
        impl CounterSource for ResettingSource {
            fn read_counters(&self, _iface: &str) -> Result<InterfaceCounters, CounterError> {
                let n = self.reads.fetch_add(1, Ordering::Relaxed) + 1;
                // Counters reset partway through the frame.
                let base = if n <= 3 { n * 1000 } else { (n - 3) * 10 };
                Ok(InterfaceCounters {
                    rx_bytes: base,
                    tx_bytes: base,
                    rx_packets: base,
                    tx_packets: base,
                })
            }
        }

        let (mut core, _shared, ring) = pipeline(ResettingSource {
            reads: AtomicU64::new(0),
        });
        for i in 0..SAMPLES_PER_FRAME as u64 {
            core.tick(i, i);
        }
        let frame = ring.pop().unwrap();
        // Sample 4 saw the reset: zero delta, not a huge wrapped one.
        assert_eq!(frame.samples[3].rx_bytes_delta, 0);
        assert_eq!(frame.samples[4].rx_bytes_delta, 10);
    }

    #[test]
    fn sample_period_is_clamped_to_the_floor() {
        let shared = SamplerShared::new("em1", 1000);
        assert_eq!(shared.set_sample_period(50), MIN_SAMPLE_PERIOD_US);
        assert_eq!(shared.sample_period_us(), MIN_SAMPLE_PERIOD_US);
        assert_eq!(shared.set_sample_period(250), 250);
        assert_eq!(shared.sample_period_us(), 250);
    }

    #[test]
    fn period_change_applies_at_rollover() {
        let (mut core, shared, ring) = pipeline(SteadySource::new(1, 1));
        shared.set_sample_period(500);
        // In-progress frame still runs at the old period.
        assert_eq!(core.period_ns(), 1_000_000);
        for i in 0..SAMPLES_PER_FRAME as u64 {
            core.tick(i, i);
        }
        assert_eq!(ring.pop().unwrap().sample_period_us, 1000);
        assert_eq!(core.period_ns(), 500_000);
    }
}
