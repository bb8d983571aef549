//! # Pre-allocated Multi-Producer Ring Buffer
//!
//! A fixed arena of reusable slots indexed by `sequence & mask`. Producers
//! claim sequences with a single atomic increment; exactly one consumer walks
//! the sequences in order.
//!
//! ## Slot protocol
//!
//! Each slot carries a state word derived from the sequence that owns it
//! (the same idea as a Vyukov bounded queue, doubled so that "published" and
//! "free for the next lap" never collide, even with a capacity of one):
//!
//! - `2·s`      the slot is free for the producer that claimed `s`
//! - `2·s + 1`  the producer of `s` has committed; the consumer may read it
//! - `2·(s + capacity)` after the consumer is done, the slot belongs to the
//!   next lap
//!
//! A producer that claims `s` waits until the slot reads `2·s`, which is the
//! backpressure: it cannot overwrite an occupant the consumer has not
//! released. The per-slot mutex is only ever taken by the one party the state
//! word currently grants access to, so it is never contended.
//!
//! A producer that is still waiting when the ring halts gives up and marks its
//! sequence abandoned on the slot. The consumer steps over an abandoned
//! sequence instead of stopping at it, so later sequences that did commit are
//! still handed out (and answered) by [`Poller::drain`].
//!
//! Before any translator runs, the ring calls [`EventSlot::clear`] on the slot.
//! Clear-before-populate is therefore a property of the ring, not a rule each
//! translator has to remember.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::wait::Doorbell;

/// A record that can live in a ring slot and be recycled.
pub trait EventSlot: Default + Send + 'static {
    /// Resets every field to its zero value. Allocations may be retained.
    fn clear(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    #[error("ring buffer capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("ring buffer has been halted")]
    Halted,

    #[error("ring buffer is full")]
    Full,

    #[error("ring buffer already has its consumer")]
    ConsumerAlreadyAttached,

    #[error("translator panicked while populating sequence {0}")]
    TranslatorPanicked(u64),
}

/// Marks a slot with no abandoned sequence.
const NOT_ABANDONED: u64 = u64::MAX;

struct Slot<E> {
    state: AtomicU64,
    /// Sequence whose producer gave up on this slot after a halt.
    abandoned: AtomicU64,
    /// Rung when the consumer releases the slot.
    released: Doorbell,
    event: Mutex<E>,
}

impl<E> Slot<E> {
    fn lock(&self) -> MutexGuard<'_, E> {
        self.event.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RingBuffer<E: EventSlot> {
    slots: Box<[Slot<E>]>,
    mask: u64,
    /// Next sequence a producer will claim.
    claim_cursor: AtomicU64,
    /// Next sequence the consumer will read.
    consumer_cursor: AtomicU64,
    consumer_attached: AtomicBool,
    halted: AtomicBool,
    /// Rung on every commit; the consumer parks on it.
    committed: Doorbell,
}

impl<E: EventSlot> std::fmt::Debug for RingBuffer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("claimed", &self.claim_cursor.load(Ordering::Relaxed))
            .field("consumed", &self.consumer_cursor.load(Ordering::Relaxed))
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl<E: EventSlot> RingBuffer<E> {
    /// Allocates `capacity` slots up front with `E::default()`.
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(RingBufferError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity)
            .map(|i| Slot {
                state: AtomicU64::new(2 * i as u64),
                abandoned: AtomicU64::new(NOT_ABANDONED),
                released: Doorbell::default(),
                event: Mutex::new(E::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            claim_cursor: AtomicU64::new(0),
            consumer_cursor: AtomicU64::new(0),
            consumer_attached: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            committed: Doorbell::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, sequence: u64) -> &Slot<E> {
        &self.slots[(sequence & self.mask) as usize]
    }

    /// Slots not currently claimed by a producer or held by the consumer.
    pub fn remaining_capacity(&self) -> usize {
        let claimed = self.claim_cursor.load(Ordering::Acquire);
        let consumed = self.consumer_cursor.load(Ordering::Acquire);
        self.capacity().saturating_sub(claimed.saturating_sub(consumed) as usize)
    }

    /// Highest sequence claimed so far plus one.
    pub fn cursor(&self) -> u64 {
        self.claim_cursor.load(Ordering::Acquire)
    }

    /// Sequence the consumer will read next.
    pub fn consumer_sequence(&self) -> u64 {
        self.consumer_cursor.load(Ordering::Acquire)
    }

    /// Claims the next sequence, blocking while the ring is full, then clears
    /// the slot, runs `translator` on it and commits it to the consumer.
    pub fn publish_event<A, T>(&self, translator: T, arg: A) -> Result<u64, RingBufferError>
    where
        T: FnOnce(&mut E, u64, A),
    {
        if self.is_halted() {
            return Err(RingBufferError::Halted);
        }
        let sequence = self.claim_cursor.fetch_add(1, Ordering::AcqRel);
        let slot = self.slot(sequence);
        let free = 2 * sequence;
        if !slot.released.wait_until(&self.halted, || slot.state.load(Ordering::Acquire) == free) {
            slot.abandoned.store(sequence, Ordering::Release);
            return Err(RingBufferError::Halted);
        }
        self.populate_and_commit(slot, sequence, translator, arg)
    }

    /// Like [`publish_event`](Self::publish_event) but returns
    /// [`RingBufferError::Full`] instead of waiting for a slot.
    pub fn try_publish_event<A, T>(&self, translator: T, arg: A) -> Result<u64, RingBufferError>
    where
        T: FnOnce(&mut E, u64, A),
    {
        loop {
            if self.is_halted() {
                return Err(RingBufferError::Halted);
            }
            let sequence = self.claim_cursor.load(Ordering::Acquire);
            let slot = self.slot(sequence);
            let state = slot.state.load(Ordering::Acquire);
            let free = 2 * sequence;

            if state == free {
                if self
                    .claim_cursor
                    .compare_exchange_weak(sequence, sequence + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return self.populate_and_commit(slot, sequence, translator, arg);
                }
            } else if state < free {
                // The previous lap's occupant has not been released yet.
                return Err(RingBufferError::Full);
            }
            // Another producer got there first; retry with the new cursor.
            std::hint::spin_loop();
        }
    }

    fn populate_and_commit<A, T>(&self, slot: &Slot<E>, sequence: u64, translator: T, arg: A) -> Result<u64, RingBufferError>
    where
        T: FnOnce(&mut E, u64, A),
    {
        let outcome = {
            let mut event = slot.lock();
            event.clear();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| translator(&mut *event, sequence, arg)));
            if outcome.is_err() {
                // Commit an empty slot so the consumer can step over it.
                event.clear();
            }
            outcome
        };
        slot.state.store(2 * sequence + 1, Ordering::Release);
        self.committed.ring();

        match outcome {
            Ok(()) => Ok(sequence),
            Err(_) => {
                tracing::error!(sequence, "translator panicked, committed an empty slot");
                Err(RingBufferError::TranslatorPanicked(sequence))
            }
        }
    }

    /// Attaches the single consumer of this ring.
    pub fn new_poller(self: &Arc<Self>) -> Result<Poller<E>, RingBufferError> {
        if self.consumer_attached.swap(true, Ordering::AcqRel) {
            return Err(RingBufferError::ConsumerAlreadyAttached);
        }
        Ok(Poller { ring: Arc::clone(self) })
    }

    /// Stops accepting publishes and wakes every waiting producer and consumer.
    /// Events already committed stay readable through [`Poller::drain`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.committed.ring();
        for slot in self.slots.iter() {
            slot.released.ring();
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn is_published(&self, sequence: u64) -> bool {
        self.slot(sequence).state.load(Ordering::Acquire) == 2 * sequence + 1
    }

    fn is_abandoned(&self, sequence: u64) -> bool {
        self.slot(sequence).abandoned.load(Ordering::Acquire) == sequence
    }

    /// True when the consumer has read everything that was claimed. After a
    /// halt, a claimed sequence that was never committed no longer counts,
    /// unless its producer abandoned it and the consumer has yet to step over it.
    pub fn is_drained(&self) -> bool {
        let next = self.consumer_sequence();
        if next >= self.cursor() {
            return true;
        }
        !self.is_published(next) && self.is_halted() && !self.is_abandoned(next)
    }
}

/// Outcome of one [`Poller::poll`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// An event was handed to the handler.
    Processing,
    /// Nothing committed at the consumer's sequence.
    Idle,
    /// Ring halted and nothing is left to read.
    Halted,
}

/// # Poller
///
/// The consumer side of a ring. There is exactly one per ring, so the thread
/// holding it is the only reader and the events it sees are in strict
/// sequence order.
pub struct Poller<E: EventSlot> {
    ring: Arc<RingBuffer<E>>,
}

impl<E: EventSlot> Poller<E> {
    pub fn ring(&self) -> &Arc<RingBuffer<E>> {
        &self.ring
    }

    /// Handles at most one committed event without blocking. The handler gets
    /// the event, its sequence, and whether it was the last one available.
    pub fn poll<F>(&mut self, handler: F) -> PollState
    where
        F: FnOnce(&mut E, u64, bool),
    {
        let sequence = self.skip_abandoned();
        if !self.ring.is_published(sequence) {
            return if self.ring.is_halted() && self.ring.is_drained() {
                PollState::Halted
            } else {
                PollState::Idle
            };
        }
        self.consume(sequence, handler);
        PollState::Processing
    }

    /// Blocks until an event is committed (handles it, `true`) or the ring is
    /// halted (`false`). A halted ring stops new processing even if events
    /// remain; those are left for [`drain`](Self::drain).
    pub fn wait_and_poll<F>(&mut self, handler: F) -> bool
    where
        F: FnOnce(&mut E, u64, bool),
    {
        let sequence = self.skip_abandoned();
        let ring = &self.ring;
        if !ring.committed.wait_until(&ring.halted, || ring.is_published(sequence)) {
            return false;
        }
        if ring.is_halted() {
            return false;
        }
        self.consume(sequence, handler);
        true
    }

    /// Hands every already-committed event to `handler`, ignoring the halt
    /// flag. Returns how many were handled.
    pub fn drain<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&mut E, u64),
    {
        let mut drained = 0;
        loop {
            let sequence = self.skip_abandoned();
            if !self.ring.is_published(sequence) {
                return drained;
            }
            self.consume(sequence, |event, seq, _| handler(event, seq));
            drained += 1;
        }
    }

    /// Steps over sequences abandoned at halt. Returns the sequence to read next.
    fn skip_abandoned(&mut self) -> u64 {
        loop {
            let sequence = self.ring.consumer_sequence();
            let slot = self.ring.slot(sequence);
            // The previous lap is released by the time the consumer gets here,
            // so an abandoned slot reads exactly `2·s`.
            if !self.ring.is_abandoned(sequence) || slot.state.load(Ordering::Acquire) != 2 * sequence {
                return sequence;
            }
            tracing::debug!(sequence, "stepping over sequence abandoned at halt");
            self.release(sequence);
        }
    }

    fn release(&mut self, sequence: u64) {
        let slot = self.ring.slot(sequence);
        let capacity = self.ring.capacity() as u64;
        slot.state.store(2 * (sequence + capacity), Ordering::Release);
        self.ring.consumer_cursor.store(sequence + 1, Ordering::Release);
        slot.released.ring();
    }

    fn consume<F>(&mut self, sequence: u64, handler: F)
    where
        F: FnOnce(&mut E, u64, bool),
    {
        let slot = self.ring.slot(sequence);
        let end_of_batch = !self.ring.is_published(sequence + 1);
        {
            let mut event = slot.lock();
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&mut *event, sequence, end_of_batch))).is_err() {
                tracing::error!(sequence, "event handler panicked, releasing slot");
            }
        }
        self.release(sequence);
    }
}
