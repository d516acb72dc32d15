//! The `jt_mq` crate provides the message fan-out data plane for
//! JitterTrap. The producer side (the compute thread) runs at kilohertz
//! and must never wait for a viewer; consumers (WebSocket sessions) run
//! inside a cooperative event loop and may stall arbitrarily.
//!
//! The building block is [`MultiQueue`]: a fixed-capacity circular buffer
//! with one producer and many independent consumer cursors. A consumer
//! that falls a full lap behind is skipped forward rather than blocking
//! the producer, and every skip is counted against that consumer.
//!
//! [`TieredQueues`] arranges five of these queues into latency tiers
//! (5/10/20/50/100+ ms). Messages are routed to a tier by their declared
//! interval; sessions subscribe to a contiguous range of tiers and shed
//! the fastest ones when their measured drop rate climbs.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]

mod queue;
mod tiers;

pub use queue::{ConsumerId, MqError, MqStats, MultiQueue};
pub use tiers::{Tier, TieredQueues, NUM_TIERS};
