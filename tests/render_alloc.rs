//! The audio callback must not allocate once warm. A counting global
//! allocator wraps the system one; the render path runs with events in
//! flight and the counter must not move.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use keysynth::bus::note_channel;
use keysynth::engine::{AudioSharedFlags, RendererAdapter};
use keysynth::event::{EventOrigin, NoteEvent};
use keysynth::render::Renderer;
use keysynth::time::SampleRate;

/// A renderer that does real-shaped work without any bookkeeping that
/// could allocate.
struct ToneRenderer;

impl Renderer for ToneRenderer {
    fn program_change(&mut self, _: u8, _: u8) {}
    fn note_on(&mut self, _: u8, _: u8, _: u8) {}
    fn note_off(&mut self, _: u8, _: u8) {}
    fn cc(&mut self, _: u8, _: u8, _: u8) {}
    fn pitch_bend(&mut self, _: u8, _: i16) {}
    fn panic(&mut self) {}
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.1);
    }
}

struct CountingAllocator;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::SeqCst);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

#[test]
fn render_path_does_not_allocate_after_warmup() {
    let (mut bus_tx, bus_rx) = note_channel(4096);
    let (tick_tx, _tick_rx) = rtrb::RingBuffer::new(64);
    let (latency_tx, mut latency_rx) = rtrb::RingBuffer::new(64);

    let mut adapter = RendererAdapter::new(
        Some(Box::new(ToneRenderer)),
        bus_rx,
        tick_tx,
        latency_tx,
        AudioSharedFlags::new(),
        SampleRate(48_000),
        512,
        6_000,
    );

    let mut out = vec![0.0f32; 512 * 2];

    // Warm-up: first calls may fault in lazily-initialized state.
    for _ in 0..8 {
        adapter.process(&mut out, 2);
        while latency_rx.pop().is_ok() {}
    }

    let before = ALLOCATIONS.load(Ordering::SeqCst);

    for round in 0u8..100 {
        bus_tx.push(NoteEvent::On {
            pitch: 40 + round % 40,
            velocity: 100,
            channel: 0,
            origin: EventOrigin::Keyboard,
        });
        bus_tx.push(NoteEvent::Off {
            pitch: 40 + round % 40,
            channel: 0,
            origin: EventOrigin::Keyboard,
        });
        adapter.process(&mut out, 2);
        while latency_rx.pop().is_ok() {}
    }

    let after = ALLOCATIONS.load(Ordering::SeqCst);
    assert_eq!(after - before, 0, "render path allocated {} times", after - before);
}
