//! The real-time producer pipeline for JitterTrap: a deadline-scheduled
//! sampling thread reads interface counters at sub-millisecond cadence,
//! hands completed frames through a tiny ring buffer to a compute thread,
//! and the compute thread turns frames into aggregate jitter statistics
//! for the message bus.
//!
//! The sampling path never blocks on downstream consumers. Its only
//! suspension point is its own absolute-deadline sleep.

mod compute;
mod counters;
mod frame_ring;
mod sample;
mod sampling;

pub use compute::{spawn_compute_thread, StatsSink};
pub use counters::{list_interfaces, CounterError, CounterSource, InterfaceCounters, SysClassNet};
pub use frame_ring::{FrameRing, RingError};
pub use sample::{Frame, FrameStats, Sample, SAMPLES_PER_FRAME};
pub use sampling::{spawn_sampling_thread, SamplerError, SamplerShared, MIN_SAMPLE_PERIOD_US};
