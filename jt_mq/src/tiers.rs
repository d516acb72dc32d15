use crate::queue::{ConsumerId, MqError, MqStats, MultiQueue};
use strum::{Display, EnumIter};

/// Number of latency tiers.
pub const NUM_TIERS: usize = 5;

/// Interval ceilings for tiers 1-4, in nanoseconds. Tier 5 takes
/// everything slower, plus control messages (interval 0).
const TIER_1_MAX_NS: u64 = 5_000_000;
const TIER_2_MAX_NS: u64 = 10_000_000;
const TIER_3_MAX_NS: u64 = 20_000_000;
const TIER_4_MAX_NS: u64 = 50_000_000;

/// Queue shapes per tier. The fast tiers carry many small messages and
/// get more depth to absorb producer bursts; tier 5 is low-rate.
const TIER_DEPTH: [usize; NUM_TIERS] = [64, 64, 32, 32, 16];
const TIER_MAX_CONSUMERS: usize = 8;

/// One of the five latency tiers of the message bus.
///
/// Each tier is bound to a minimum delivery interval; a session
/// subscribed to tier N receives messages no more often than that
/// tier's interval allows. Tier 5 additionally carries control
/// messages and is never shed by the adaptive controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, Display)]
pub enum Tier {
    /// 5 ms messages (~200/sec).
    T1,
    /// 10 ms messages.
    T2,
    /// 20 ms messages.
    T3,
    /// 50 ms messages.
    T4,
    /// 100 ms and slower, plus control/config messages.
    T5,
}

impl Tier {
    /// Routes a message's declared interval to its tier. Total and
    /// deterministic; interval 0 means a control message and maps to
    /// tier 5.
    pub fn from_interval_ns(interval_ns: u64) -> Tier {
        if interval_ns == 0 {
            return Tier::T5;
        }
        if interval_ns <= TIER_1_MAX_NS {
            Tier::T1
        } else if interval_ns <= TIER_2_MAX_NS {
            Tier::T2
        } else if interval_ns <= TIER_3_MAX_NS {
            Tier::T3
        } else if interval_ns <= TIER_4_MAX_NS {
            Tier::T4
        } else {
            Tier::T5
        }
    }

    /// Minimum message interval for this tier, in milliseconds.
    pub fn min_interval_ms(self) -> u64 {
        match self {
            Tier::T1 => 5,
            Tier::T2 => 10,
            Tier::T3 => 20,
            Tier::T4 => 50,
            Tier::T5 => 100,
        }
    }

    /// Tier number, 1-5.
    pub fn number(self) -> usize {
        self.index() + 1
    }

    /// Zero-based index, for addressing per-tier arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tier from a zero-based index.
    pub fn from_index(index: usize) -> Option<Tier> {
        match index {
            0 => Some(Tier::T1),
            1 => Some(Tier::T2),
            2 => Some(Tier::T3),
            3 => Some(Tier::T4),
            4 => Some(Tier::T5),
            _ => None,
        }
    }

    /// The next faster tier, if any.
    pub fn faster(self) -> Option<Tier> {
        self.index().checked_sub(1).and_then(Tier::from_index)
    }

    /// The next slower tier, if any.
    pub fn slower(self) -> Option<Tier> {
        Tier::from_index(self.index() + 1)
    }
}

/// The five per-tier [`MultiQueue`] instances, owned as one unit for the
/// lifetime of the process. Constructed once in `main` and shared by
/// reference with the producer pipeline and every WebSocket session.
pub struct TieredQueues<T> {
    queues: [MultiQueue<T>; NUM_TIERS],
}

impl<T: Default> Default for TieredQueues<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> TieredQueues<T> {
    /// Builds the tier set with the per-tier queue shapes.
    pub fn new() -> Self {
        Self {
            queues: std::array::from_fn(|i| {
                MultiQueue::new(TIER_DEPTH[i], TIER_MAX_CONSUMERS)
            }),
        }
    }

    /// The queue bound to `tier`.
    pub fn queue(&self, tier: Tier) -> &MultiQueue<T> {
        &self.queues[tier.index()]
    }

    /// Routes by interval and publishes via the tier's queue.
    /// See [`MultiQueue::produce_with`] for the slot contract.
    pub fn produce_with<F, E>(&self, interval_ns: u64, serialize: F) -> Result<Tier, MqError>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
    {
        let tier = Tier::from_interval_ns(interval_ns);
        self.queue(tier).produce_with(serialize)?;
        Ok(tier)
    }

    /// Subscribes a consumer to one tier.
    pub fn subscribe(&self, tier: Tier) -> Result<ConsumerId, MqError> {
        self.queue(tier).subscribe()
    }

    /// Unsubscribes a consumer from one tier.
    pub fn unsubscribe(&self, tier: Tier, id: ConsumerId) -> Result<(), MqError> {
        self.queue(tier).unsubscribe(id)
    }

    /// Reads and clears the windowed counters for one subscription.
    pub fn take_stats(&self, tier: Tier, id: ConsumerId) -> Result<MqStats, MqError> {
        self.queue(tier).take_stats(id)
    }
}

#[cfg(test)]
mod tests {
    use super::{Tier, TieredQueues};
    use strum::IntoEnumIterator;

    #[test]
    fn routing_matches_threshold_table() {
        let cases = [
            (0u64, Tier::T5),
            (1, Tier::T1),
            (5_000_000, Tier::T1),
            (5_000_001, Tier::T2),
            (10_000_000, Tier::T2),
            (20_000_000, Tier::T3),
            (50_000_000, Tier::T4),
            (50_000_001, Tier::T5),
            (999_000_000, Tier::T5),
        ];
        for (interval_ns, want) in cases {
            assert_eq!(Tier::from_interval_ns(interval_ns), want, "{interval_ns}ns");
            // Pure: same input, same output.
            assert_eq!(
                Tier::from_interval_ns(interval_ns),
                Tier::from_interval_ns(interval_ns)
            );
        }
    }

    #[test]
    fn tier_ordering_and_neighbours() {
        assert!(Tier::T1 < Tier::T5);
        assert_eq!(Tier::T3.faster(), Some(Tier::T2));
        assert_eq!(Tier::T3.slower(), Some(Tier::T4));
        assert_eq!(Tier::T1.faster(), None);
        assert_eq!(Tier::T5.slower(), None);
        for tier in Tier::iter() {
            assert_eq!(Tier::from_index(tier.index()), Some(tier));
        }
    }

    #[test]
    fn produce_routes_to_the_interval_tier() {
        let tiers: TieredQueues<String> = TieredQueues::new();
        let id = tiers.subscribe(Tier::T2).unwrap();
        let placed = tiers
            .produce_with(10_000_000, |slot: &mut String| {
                *slot = "stats".into();
                Ok::<(), ()>(())
            })
            .unwrap();
        assert_eq!(placed, Tier::T2);
        assert_eq!(tiers.queue(Tier::T2).consume(id).unwrap(), "stats");
    }
}
