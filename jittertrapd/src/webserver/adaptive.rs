use crate::webserver::messages::WsPayload;
use jt_mq::{ConsumerId, MqError, Tier, TieredQueues, NUM_TIERS};
use tracing::{debug, warn};

/// New sessions start here: fast enough to be useful, slow enough to
/// survive a mediocre link while the controller gathers evidence.
pub const INITIAL_MIN_TIER: Tier = Tier::T3;

/// Window drop fraction above which the session sheds its fastest tier.
pub const HIGH_WATERMARK: f64 = 0.30;

/// Window drop fraction below which the session tries one tier faster.
pub const LOW_WATERMARK: f64 = 0.05;

/// Per-session tier subscriptions plus the controller that moves the
/// session between tiers based on its own drop rate.
///
/// A session always holds every tier from `min_tier` through tier 5.
/// Tier 5 carries control messages and is never shed, so the session
/// keeps receiving interface and period changes no matter how slow its
/// link is.
pub struct AdaptiveSession {
    consumers: [Option<ConsumerId>; NUM_TIERS],
    min_tier: Tier,
}

impl AdaptiveSession {
    /// Subscribes a new session to tiers [`INITIAL_MIN_TIER`]..=5.
    ///
    /// Fails (and leaves no subscriptions behind) when any tier is at
    /// its consumer limit; the caller should refuse the connection.
    pub fn new(queues: &TieredQueues<WsPayload>) -> Result<Self, MqError> {
        let mut session = Self {
            consumers: [None; NUM_TIERS],
            min_tier: INITIAL_MIN_TIER,
        };
        for index in INITIAL_MIN_TIER.index()..NUM_TIERS {
            let tier = Tier::from_index(index).ok_or(MqError::UnknownConsumer)?;
            match queues.subscribe(tier) {
                Ok(id) => session.consumers[index] = Some(id),
                Err(err) => {
                    session.unsubscribe_all(queues);
                    return Err(err);
                }
            }
        }
        Ok(session)
    }

    /// The slowest-delivery-first list of active subscriptions.
    pub fn subscribed(&self) -> impl Iterator<Item = (Tier, ConsumerId)> + '_ {
        (0..NUM_TIERS)
            .rev()
            .filter_map(|index| Some((Tier::from_index(index)?, self.consumers[index]?)))
    }

    /// The consumer handle for one tier, if subscribed.
    pub fn consumer(&self, tier: Tier) -> Option<ConsumerId> {
        self.consumers[tier.index()]
    }

    /// The fastest tier this session currently receives.
    pub fn min_tier(&self) -> Tier {
        self.min_tier
    }

    /// Runs one control decision over the drop/delivery counters
    /// accumulated since the previous call.
    ///
    /// Returns the new minimum tier when the session moved, `None` when
    /// it stayed put.
    pub fn adapt(&mut self, queues: &TieredQueues<WsPayload>) -> Option<Tier> {
        let mut dropped = 0u64;
        let mut delivered = 0u64;
        for (tier, id) in self.subscribed() {
            match queues.take_stats(tier, id) {
                Ok(stats) => {
                    dropped += stats.dropped;
                    delivered += stats.delivered;
                }
                Err(err) => warn!("tier {tier} stats unavailable: {err}"),
            }
        }
        let total = dropped + delivered;
        // An empty window counts as clean delivery: an idle client is
        // not a struggling one.
        let drop_pct = if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64
        };
        if drop_pct > HIGH_WATERMARK {
            self.degrade(queues, drop_pct)
        } else if drop_pct < LOW_WATERMARK {
            self.upgrade(queues, drop_pct)
        } else {
            None
        }
    }

    /// Sheds the current fastest tier. Tier 5 is the floor.
    fn degrade(&mut self, queues: &TieredQueues<WsPayload>, drop_pct: f64) -> Option<Tier> {
        let slower = self.min_tier.slower()?;
        if let Some(id) = self.consumers[self.min_tier.index()].take() {
            if let Err(err) = queues.unsubscribe(self.min_tier, id) {
                warn!("unable to leave tier {}: {err}", self.min_tier);
            }
        }
        debug!(
            "dropping {:.0}% of messages, degrading {} -> {slower}",
            drop_pct * 100.0,
            self.min_tier
        );
        self.min_tier = slower;
        Some(slower)
    }

    /// Takes on the next faster tier, if one exists and has room.
    fn upgrade(&mut self, queues: &TieredQueues<WsPayload>, drop_pct: f64) -> Option<Tier> {
        let faster = self.min_tier.faster()?;
        match queues.subscribe(faster) {
            Ok(id) => {
                debug!(
                    "dropping {:.0}% of messages, upgrading {} -> {faster}",
                    drop_pct * 100.0,
                    self.min_tier
                );
                self.consumers[faster.index()] = Some(id);
                self.min_tier = faster;
                Some(faster)
            }
            Err(err) => {
                debug!("tier {faster} not joinable: {err}");
                None
            }
        }
    }

    /// Releases every subscription this session holds.
    pub fn unsubscribe_all(&mut self, queues: &TieredQueues<WsPayload>) {
        for index in 0..NUM_TIERS {
            if let (Some(tier), Some(id)) = (Tier::from_index(index), self.consumers[index].take())
            {
                if let Err(err) = queues.unsubscribe(tier, id) {
                    warn!("unable to leave tier {tier}: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AdaptiveSession, INITIAL_MIN_TIER};
    use crate::webserver::messages::WsPayload;
    use jt_mq::{Tier, TieredQueues};

    fn produce_n(queues: &TieredQueues<WsPayload>, tier: Tier, n: usize) {
        for i in 0..n {
            queues
                .queue(tier)
                .produce(WsPayload(format!("m{i}")))
                .unwrap();
        }
    }

    fn consume_n(queues: &TieredQueues<WsPayload>, session: &AdaptiveSession, tier: Tier, n: usize) {
        let id = session.consumer(tier).unwrap();
        for _ in 0..n {
            queues.queue(tier).consume(id).unwrap();
        }
    }

    #[test]
    fn new_session_holds_initial_through_control_tier() {
        let queues = TieredQueues::new();
        let session = AdaptiveSession::new(&queues).unwrap();
        assert_eq!(session.min_tier(), INITIAL_MIN_TIER);
        assert!(session.consumer(Tier::T1).is_none());
        assert!(session.consumer(Tier::T2).is_none());
        assert!(session.consumer(Tier::T3).is_some());
        assert!(session.consumer(Tier::T4).is_some());
        assert!(session.consumer(Tier::T5).is_some());
        let slowest_first: Vec<Tier> = session.subscribed().map(|(t, _)| t).collect();
        assert_eq!(slowest_first, vec![Tier::T5, Tier::T4, Tier::T3]);
    }

    #[test]
    fn high_drop_rate_degrades_one_tier() {
        let queues = TieredQueues::new();
        let mut session = AdaptiveSession::new(&queues).unwrap();

        // Keep up for a while, then stall: half the window's messages
        // are lost, well past the high watermark.
        let capacity = queues.queue(Tier::T3).capacity();
        produce_n(&queues, Tier::T3, capacity - 1);
        consume_n(&queues, &session, Tier::T3, capacity - 1);
        produce_n(&queues, Tier::T3, 2 * (capacity - 1));

        assert_eq!(session.adapt(&queues), Some(Tier::T4));
        assert_eq!(session.min_tier(), Tier::T4);
        assert!(session.consumer(Tier::T3).is_none());
        assert_eq!(queues.queue(Tier::T3).consumer_count(), 0);
    }

    #[test]
    fn clean_delivery_upgrades_one_tier() {
        let queues = TieredQueues::new();
        let mut session = AdaptiveSession::new(&queues).unwrap();
        produce_n(&queues, Tier::T3, 10);
        consume_n(&queues, &session, Tier::T3, 10);

        assert_eq!(session.adapt(&queues), Some(Tier::T2));
        assert_eq!(session.min_tier(), Tier::T2);
        assert!(session.consumer(Tier::T2).is_some());
        assert!(session.consumer(Tier::T3).is_some());
    }

    #[test]
    fn idle_windows_upgrade_until_the_fastest_tier() {
        let queues = TieredQueues::new();
        let mut session = AdaptiveSession::new(&queues).unwrap();
        assert_eq!(session.adapt(&queues), Some(Tier::T2));
        assert_eq!(session.adapt(&queues), Some(Tier::T1));
        // Nothing faster than tier 1.
        assert_eq!(session.adapt(&queues), None);
        assert_eq!(session.min_tier(), Tier::T1);
    }

    #[test]
    fn control_tier_is_never_shed() {
        let queues = TieredQueues::new();
        let mut session = AdaptiveSession::new(&queues).unwrap();

        // Force total loss until the session bottoms out at tier 5.
        for expect in [Tier::T4, Tier::T5] {
            let tier = session.min_tier();
            produce_n(&queues, tier, queues.queue(tier).capacity() + 8);
            assert_eq!(session.adapt(&queues), Some(expect));
        }
        assert_eq!(session.min_tier(), Tier::T5);

        // Still losing everything, but there is nowhere left to go and
        // the control tier stays subscribed.
        produce_n(&queues, Tier::T5, queues.queue(Tier::T5).capacity() + 8);
        assert_eq!(session.adapt(&queues), None);
        assert!(session.consumer(Tier::T5).is_some());
    }

    #[test]
    fn teardown_releases_every_tier() {
        let queues = TieredQueues::new();
        let mut session = AdaptiveSession::new(&queues).unwrap();
        session.unsubscribe_all(&queues);
        assert_eq!(queues.queue(Tier::T3).consumer_count(), 0);
        assert_eq!(queues.queue(Tier::T4).consumer_count(), 0);
        assert_eq!(queues.queue(Tier::T5).consumer_count(), 0);
    }
}
