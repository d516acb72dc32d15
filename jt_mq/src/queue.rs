use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by [`MultiQueue`] operations.
///
/// `Empty` and `NoConsumers` are normal flow-control conditions, not
/// faults: `Empty` tells a consumer it has drained its backlog, and
/// `NoConsumers` tells the producer there is nothing useful to do.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqError {
    /// Produce was attempted while nobody is subscribed. The slot
    /// contents are untouched.
    #[error("no consumers subscribed")]
    NoConsumers,
    /// Every consumer cursor slot is already claimed.
    #[error("consumer limit reached")]
    ConsumerLimitReached,
    /// The consumer's cursor has caught up with the producer.
    #[error("queue empty for this consumer")]
    Empty,
    /// The serialize/deserialize callback failed; the queue state is
    /// unchanged by the failed call.
    #[error("message callback failed")]
    CallbackError,
    /// The consumer id does not refer to an active subscription.
    #[error("unknown consumer id")]
    UnknownConsumer,
}

/// Handle identifying one subscribed consumer of a [`MultiQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(usize);

/// One windowed reading of a consumer's drop/delivery counters, as
/// returned by [`MultiQueue::take_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MqStats {
    /// Messages this consumer was skipped past since the last call.
    pub dropped: u64,
    /// Messages this consumer successfully consumed since the last call.
    pub delivered: u64,
}

#[derive(Clone, Default)]
struct Cursor {
    /// Index of the last slot this consumer has read.
    pos: usize,
    /// Sticky drop count; forgiven once the consumer drains its backlog.
    dropped: u64,
    /// Lifetime delivery count.
    delivered: u64,
    /// Window counters, read-and-cleared by `take_stats`.
    window_dropped: u64,
    window_delivered: u64,
}

struct Inner<T> {
    slots: Vec<T>,
    /// Index of the slot most recently written.
    produce: usize,
    consumers: Vec<Option<Cursor>>,
    consumer_count: usize,
}

/// A bounded, lossy, single-producer / multi-consumer message queue.
///
/// Capacity and the consumer limit are fixed at construction. All
/// operations are O(1) short critical sections behind one mutex; none of
/// them block beyond that. The producer always makes progress: a consumer
/// whose cursor occupies the slot about to be written is advanced past it
/// and the lost message is counted against that consumer alone.
///
/// New subscribers start at the current produce cursor and therefore see
/// only messages produced after they joined.
pub struct MultiQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Default> MultiQueue<T> {
    /// Creates a queue with `capacity` message slots and room for
    /// `max_consumers` concurrent subscribers.
    ///
    /// # Panics
    /// Panics if `capacity <= max_consumers`: with one slot per lagging
    /// consumer plus the produce cursor, a smaller capacity would make
    /// "everyone is caught up" indistinguishable from "everyone is about
    /// to be overwritten".
    pub fn new(capacity: usize, max_consumers: usize) -> Self {
        assert!(
            capacity > max_consumers,
            "queue capacity ({capacity}) must exceed max_consumers ({max_consumers})"
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        Self {
            inner: Mutex::new(Inner {
                slots,
                produce: 0,
                consumers: vec![None; max_consumers],
                consumer_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // A panic while holding the lock leaves no partially-updated
        // cursor state worth preserving; recover the guard.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims a consumer cursor slot, starting at the current produce
    /// cursor (future messages only).
    pub fn subscribe(&self) -> Result<ConsumerId, MqError> {
        let mut q = self.lock();
        let produce = q.produce;
        let index = q
            .consumers
            .iter()
            .position(|c| c.is_none())
            .ok_or(MqError::ConsumerLimitReached)?;
        q.consumers[index] = Some(Cursor {
            pos: produce,
            ..Cursor::default()
        });
        q.consumer_count += 1;
        debug!("consumer {index} joined");
        Ok(ConsumerId(index))
    }

    /// Releases a consumer cursor slot and clears its counters.
    pub fn unsubscribe(&self, id: ConsumerId) -> Result<(), MqError> {
        let mut q = self.lock();
        let slot = q
            .consumers
            .get_mut(id.0)
            .ok_or(MqError::UnknownConsumer)?;
        if slot.take().is_none() {
            return Err(MqError::UnknownConsumer);
        }
        q.consumer_count -= 1;
        debug!("consumer {} left", id.0);
        Ok(())
    }

    /// Publishes one message by invoking `serialize` on the next slot.
    ///
    /// Any consumer whose cursor occupies that slot is advanced one slot
    /// further first, losing exactly one message (counted, never blocking
    /// the producer). If `serialize` fails the produce cursor is not
    /// advanced and the call returns [`MqError::CallbackError`]. With no
    /// subscribers the call returns [`MqError::NoConsumers`] without
    /// touching any slot.
    pub fn produce_with<F, E>(&self, serialize: F) -> Result<(), MqError>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
    {
        let mut q = self.lock();
        if q.consumer_count == 0 {
            return Err(MqError::NoConsumers);
        }
        let capacity = q.slots.len();
        let next = (q.produce + 1) % capacity;

        // Skip any consumer that would be overwritten: it loses the one
        // message in `next`, and only that one.
        for cursor in q.consumers.iter_mut().flatten() {
            if cursor.pos == next {
                cursor.pos = (next + 1) % capacity;
                cursor.dropped += 1;
                cursor.window_dropped += 1;
            }
        }

        serialize(&mut q.slots[next]).map_err(|_| MqError::CallbackError)?;
        q.produce = next;
        Ok(())
    }

    /// Publishes one message by value.
    pub fn produce(&self, message: T) -> Result<(), MqError> {
        self.produce_with(|slot| {
            *slot = message;
            Ok::<(), MqError>(())
        })
    }

    /// Consumes the next unread message for `id`, invoking `read` on it.
    ///
    /// Returns [`MqError::Empty`] when the cursor has caught up with the
    /// producer. A consumer that reaches emptiness after having been
    /// skipped has its sticky drop counter forgiven; the windowed
    /// counters read by [`MultiQueue::take_stats`] are unaffected.
    pub fn consume_with<F, E>(&self, id: ConsumerId, read: F) -> Result<(), MqError>
    where
        F: FnOnce(&T) -> Result<(), E>,
    {
        let mut q = self.lock();
        let capacity = q.slots.len();
        let produce = q.produce;
        let pos = {
            let cursor = q
                .consumers
                .get(id.0)
                .and_then(|c| c.as_ref())
                .ok_or(MqError::UnknownConsumer)?;
            if cursor.pos == produce {
                return Err(MqError::Empty);
            }
            (cursor.pos + 1) % capacity
        };

        read(&q.slots[pos]).map_err(|_| MqError::CallbackError)?;

        let cursor = q.consumers[id.0]
            .as_mut()
            .ok_or(MqError::UnknownConsumer)?;
        cursor.pos = pos;
        cursor.delivered += 1;
        cursor.window_delivered += 1;
        if cursor.pos == produce && cursor.dropped > 0 {
            // Backlog cleared; the transient slowdown is forgiven.
            cursor.dropped = 0;
        }
        Ok(())
    }

    /// Consumes the next unread message for `id` by value.
    pub fn consume(&self, id: ConsumerId) -> Result<T, MqError>
    where
        T: Clone,
    {
        let mut out = None;
        self.consume_with(id, |slot| {
            out = Some(slot.clone());
            Ok::<(), MqError>(())
        })?;
        out.ok_or(MqError::CallbackError)
    }

    /// Atomically reads and clears the windowed drop/delivery counters
    /// for `id`. This is the sole input to the adaptive tier controller.
    pub fn take_stats(&self, id: ConsumerId) -> Result<MqStats, MqError> {
        let mut q = self.lock();
        let cursor = q
            .consumers
            .get_mut(id.0)
            .and_then(|c| c.as_mut())
            .ok_or(MqError::UnknownConsumer)?;
        let stats = MqStats {
            dropped: cursor.window_dropped,
            delivered: cursor.window_delivered,
        };
        cursor.window_dropped = 0;
        cursor.window_delivered = 0;
        Ok(stats)
    }

    /// Current sticky drop count for `id` (zero after the consumer has
    /// caught up with the producer).
    pub fn dropped(&self, id: ConsumerId) -> Result<u64, MqError> {
        let q = self.lock();
        q.consumers
            .get(id.0)
            .and_then(|c| c.as_ref())
            .map(|c| c.dropped)
            .ok_or(MqError::UnknownConsumer)
    }

    /// Lifetime delivery count for `id`.
    pub fn delivered(&self, id: ConsumerId) -> Result<u64, MqError> {
        let q = self.lock();
        q.consumers
            .get(id.0)
            .and_then(|c| c.as_ref())
            .map(|c| c.delivered)
            .ok_or(MqError::UnknownConsumer)
    }

    /// Number of active subscribers.
    pub fn consumer_count(&self) -> usize {
        self.lock().consumer_count
    }

    /// Total message slots.
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }
}
