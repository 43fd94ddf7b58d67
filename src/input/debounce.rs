//! Keyboard-matrix ghost filtering.
//!
//! Some laptop matrices emit sub-millisecond down/up flurries on one
//! scan-code when adjacent keys land together. The filter collapses any
//! alternation faster than [`GHOST_WINDOW`] to the first down and the last
//! up: edges inside the window are swallowed, and a settle pass (driven by
//! the fan-in tick) emits the trailing edge once the key goes quiet.

use fnv::FnvHashMap;
use smallvec::SmallVec;

use crate::event::{DeviceId, RawKey};
use crate::time::MonotonicNanos;

pub const GHOST_WINDOW_NANOS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
struct KeyTrace {
    /// What the kernel last said.
    physical_down: bool,
    /// What we last forwarded downstream.
    emitted_down: bool,
    last_change: MonotonicNanos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Emit,
    Suppress,
}

/// A deferred edge from the settle pass, stamped with the time the physical
/// transition actually happened.
pub type SettledEdges = SmallVec<[(RawKey, bool, MonotonicNanos); 4]>;

#[derive(Debug, Default)]
pub struct KeyFilter {
    traces: FnvHashMap<RawKey, KeyTrace>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether one key edge passes through. Suppressed edges are
    /// still recorded so the settle pass can emit the final state.
    pub fn filter(&mut self, raw: RawKey, down: bool, t: MonotonicNanos) -> FilterDecision {
        match self.traces.get_mut(&raw) {
            None => {
                if !down {
                    // An up with no tracked down: stray edge, drop it.
                    return FilterDecision::Suppress;
                }
                self.traces
                    .insert(raw, KeyTrace { physical_down: down, emitted_down: down, last_change: t });
                FilterDecision::Emit
            }
            Some(trace) => {
                let since = t.since(trace.last_change).as_nanos() as u64;
                trace.physical_down = down;
                trace.last_change = t;

                if down == trace.emitted_down {
                    FilterDecision::Suppress
                } else if since < GHOST_WINDOW_NANOS {
                    FilterDecision::Suppress
                } else {
                    trace.emitted_down = down;
                    FilterDecision::Emit
                }
            }
        }
    }

    /// Emit the trailing edge for keys whose suppressed flurry has gone
    /// quiet for a full ghost window.
    pub fn settle(&mut self, now: MonotonicNanos) -> SettledEdges {
        let mut out = SettledEdges::new();
        for (raw, trace) in self.traces.iter_mut() {
            if trace.physical_down != trace.emitted_down
                && now.since(trace.last_change).as_nanos() as u64 >= GHOST_WINDOW_NANOS
            {
                trace.emitted_down = trace.physical_down;
                out.push((*raw, trace.physical_down, trace.last_change));
            }
        }
        out
    }

    /// Forget every key of a removed device.
    pub fn purge_device(&mut self, device: DeviceId) {
        self.traces.retain(|raw, _| raw.device != device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw() -> RawKey {
        RawKey { device: DeviceId(1), code: 30 }
    }

    fn us(v: u64) -> MonotonicNanos {
        MonotonicNanos(v * 1_000)
    }

    #[test]
    fn clean_edges_pass_through() {
        let mut f = KeyFilter::new();
        assert_eq!(f.filter(raw(), true, us(0)), FilterDecision::Emit);
        assert_eq!(f.filter(raw(), false, us(200_000)), FilterDecision::Emit);
        assert_eq!(f.filter(raw(), true, us(400_000)), FilterDecision::Emit);
    }

    #[test]
    fn ghost_flurry_collapses_to_first_down_and_last_up() {
        let mut f = KeyFilter::new();
        assert_eq!(f.filter(raw(), true, us(0)), FilterDecision::Emit);
        assert_eq!(f.filter(raw(), false, us(300)), FilterDecision::Suppress);
        assert_eq!(f.filter(raw(), true, us(500)), FilterDecision::Suppress);
        assert_eq!(f.filter(raw(), false, us(700)), FilterDecision::Suppress);

        // Nothing settles while the window is still open.
        assert!(f.settle(us(1_000)).is_empty());

        let settled = f.settle(us(1_800));
        assert_eq!(settled.as_slice(), &[(raw(), false, us(700))]);

        // Settled state is sticky; no double emission.
        assert!(f.settle(us(3_000)).is_empty());
    }

    #[test]
    fn duplicate_downs_are_suppressed() {
        let mut f = KeyFilter::new();
        f.filter(raw(), true, us(0));
        assert_eq!(f.filter(raw(), true, us(50_000)), FilterDecision::Suppress);
    }

    #[test]
    fn stray_up_without_down_is_dropped() {
        let mut f = KeyFilter::new();
        assert_eq!(f.filter(raw(), false, us(0)), FilterDecision::Suppress);
    }

    #[test]
    fn purge_forgets_a_device() {
        let mut f = KeyFilter::new();
        f.filter(raw(), true, us(0));
        f.filter(raw(), false, us(100));
        f.purge_device(DeviceId(1));
        assert!(f.settle(us(10_000)).is_empty());
    }
}
