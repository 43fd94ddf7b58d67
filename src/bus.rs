//! The two channels between the input context and the rest of the system.
//!
//! The realtime channel is a fixed-capacity SPSC ring of packed [`NoteEvent`]
//! words. Push and pop are wait-free; when the ring is full the *oldest*
//! pending event is evicted (fresh note-offs matter more than stale note-ons)
//! and a monotonic drop counter is bumped. The telemetry channel is a plain
//! bounded crossbeam channel that loses events under pressure without ever
//! touching the pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::event::{NoteEvent, TelemetryEvent};

pub const DEFAULT_CAPACITY: usize = 4096;
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

// All ring atomics use SeqCst. The producer-side eviction CAS races against
// the consumer's pop CAS on the same index, and the proof that a slot can
// never be observed twice leans on a single total order of those operations.
// Traffic through this ring is a few hundred words a second, so the fence
// cost is noise.
struct RingShared {
    slots: Box<[AtomicU64]>,
    mask: usize,
    /// Index of the next slot to pop. Advanced by the consumer, and by the
    /// producer when it evicts the oldest event from a full ring.
    head: AtomicUsize,
    /// Index of the next slot to push. Advanced only by the producer.
    tail: AtomicUsize,
    dropped: AtomicU64,
    panic_pending: AtomicBool,
}

/// Input-thread half of the realtime channel.
pub struct BusProducer {
    shared: Arc<RingShared>,
}

/// Audio-thread half of the realtime channel.
pub struct BusConsumer {
    shared: Arc<RingShared>,
}

/// Read-only view of the ring's drop counter, handed to the health probe and
/// the telemetry fan-out.
#[derive(Clone)]
pub struct BusMetrics {
    shared: Arc<RingShared>,
}

/// Creates the realtime channel. `capacity` is rounded up to a power of two.
pub fn note_channel(capacity: usize) -> (BusProducer, BusConsumer) {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice();

    let shared = Arc::new(RingShared {
        slots,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
        panic_pending: AtomicBool::new(false),
    });

    (BusProducer { shared: Arc::clone(&shared) }, BusConsumer { shared })
}

impl BusProducer {
    /// Wait-free push. Never blocks, never allocates; a full ring sheds its
    /// oldest event and counts the loss.
    pub fn push(&mut self, ev: NoteEvent) {
        if ev.is_panic() {
            // Head promotion: the consumer checks this flag before draining
            // the ring, so a panic always arrives ahead of queued events.
            self.shared.panic_pending.store(true, Ordering::SeqCst);
            return;
        }

        let s = &*self.shared;
        let tail = s.tail.load(Ordering::SeqCst);
        loop {
            let head = s.head.load(Ordering::SeqCst);
            if tail.wrapping_sub(head) <= s.mask {
                break;
            }
            if s
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                s.dropped.fetch_add(1, Ordering::SeqCst);
                break;
            }
            // The consumer advanced concurrently; re-check, there is room now.
        }

        s.slots[tail & s.mask].store(ev.pack(), Ordering::SeqCst);
        s.tail.store(tail.wrapping_add(1), Ordering::SeqCst);
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics { shared: Arc::clone(&self.shared) }
    }
}

impl BusConsumer {
    /// Wait-free pop in submission order, except that a pending panic is
    /// returned ahead of everything queued.
    pub fn pop(&mut self) -> Option<NoteEvent> {
        let s = &*self.shared;

        if s.panic_pending.swap(false, Ordering::SeqCst) {
            return Some(NoteEvent::Panic);
        }

        loop {
            let head = s.head.load(Ordering::SeqCst);
            let tail = s.tail.load(Ordering::SeqCst);
            if head == tail {
                return None;
            }
            let word = s.slots[head & s.mask].load(Ordering::SeqCst);
            if s
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return NoteEvent::unpack(word);
            }
            // The producer evicted the slot we just read; take the next oldest.
        }
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics { shared: Arc::clone(&self.shared) }
    }
}

impl BusMetrics {
    /// Total events shed by the ring since startup. Monotonic.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::SeqCst)
    }
}

/// Lossy diagnostics feed for the UI. `send` never blocks; an overfull
/// channel silently discards.
#[derive(Clone)]
pub struct TelemetrySender {
    tx: Sender<TelemetryEvent>,
}

impl TelemetrySender {
    pub fn send(&self, ev: TelemetryEvent) {
        let _ = self.tx.try_send(ev);
    }
}

pub fn telemetry_channel(capacity: usize) -> (TelemetrySender, Receiver<TelemetryEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (TelemetrySender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventOrigin;

    fn on(pitch: u8) -> NoteEvent {
        NoteEvent::On { pitch, velocity: 64, channel: 0, origin: EventOrigin::Keyboard }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let (mut tx, mut rx) = note_channel(8);
        for p in 0..5 {
            tx.push(on(p));
        }
        for p in 0..5 {
            assert_eq!(rx.pop(), Some(on(p)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_ring_sheds_oldest_and_counts() {
        let (mut tx, mut rx) = note_channel(4);
        for p in 0..6 {
            tx.push(on(p));
        }
        assert_eq!(tx.metrics().dropped(), 2);
        // Events 0 and 1 were evicted; 2..6 survive in order.
        for p in 2..6 {
            assert_eq!(rx.pop(), Some(on(p)));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn panic_is_promoted_to_the_head() {
        let (mut tx, mut rx) = note_channel(8);
        tx.push(on(60));
        tx.push(NoteEvent::Panic);
        assert_eq!(rx.pop(), Some(NoteEvent::Panic));
        assert_eq!(rx.pop(), Some(on(60)));
    }

    #[test]
    fn drop_counter_is_monotonic_when_consumer_keeps_up() {
        let (mut tx, mut rx) = note_channel(4);
        for p in 0..100 {
            tx.push(on(p % 128));
            assert!(rx.pop().is_some());
        }
        assert_eq!(tx.metrics().dropped(), 0);
    }

    #[test]
    fn concurrent_push_pop_loses_nothing_when_consumer_keeps_up() {
        let (mut tx, mut rx) = note_channel(1024);
        let writer = std::thread::spawn(move || {
            for p in 0u32..10_000 {
                tx.push(on((p % 128) as u8));
            }
            tx
        });
        let mut seen = 0u32;
        loop {
            match rx.pop() {
                Some(_) => seen += 1,
                None => {
                    if writer.is_finished() {
                        while rx.pop().is_some() {
                            seen += 1;
                        }
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }
        let tx = writer.join().unwrap();
        assert_eq!(u64::from(seen) + tx.metrics().dropped(), 10_000);
    }
}
