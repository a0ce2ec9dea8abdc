//! Ordered collector: reorders `(position, payload)` tuples arriving from
//! workers in arbitrary completion order back into strictly increasing
//! position order for the downstream sink.

use std::collections::BTreeMap;
use std::sync::Mutex;

enum Slot<T> {
    Payload(T),
    Skipped { reason: String },
}

struct Inner<T> {
    next_expected: u64,
    buffered: BTreeMap<u64, Slot<T>>,
}

/// Accepts completions out of order, emits them in order. `submit` is
/// idempotent per position; `drain` never emits the same position twice and
/// never emits out of order.
pub struct OrderedCollector<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> OrderedCollector<T> {
    /// `start_position` is the first position this collector expects,
    /// normally 1 for a fresh batch or `checkpoint.last_contiguous_position + 1`
    /// on resume.
    pub fn new(start_position: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_expected: start_position,
                buffered: BTreeMap::new(),
            }),
        }
    }

    /// Idempotent by position: a second `submit` for an already-buffered or
    /// already-drained position is a no-op.
    pub fn submit(&self, position: u64, payload: T) {
        let mut inner = self.inner.lock().unwrap();
        if position < inner.next_expected {
            return;
        }
        inner.buffered.entry(position).or_insert(Slot::Payload(payload));
    }

    /// Records that `position` will never produce a payload. The cursor may
    /// advance past it; it will never appear in `drain`'s output.
    pub fn mark_skipped(&self, position: u64, reason: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if position < inner.next_expected {
            return;
        }
        inner
            .buffered
            .entry(position)
            .or_insert(Slot::Skipped { reason: reason.into() });
    }

    /// Emits the longest contiguous prefix starting at the next expected
    /// position, advancing the internal cursor past it (including any
    /// skipped positions within that prefix).
    pub fn drain(&self) -> Vec<(u64, T)> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();

        loop {
            let next = inner.next_expected;
            match inner.buffered.remove(&next) {
                Some(Slot::Payload(payload)) => {
                    out.push((next, payload));
                    inner.next_expected += 1;
                }
                Some(Slot::Skipped { .. }) => {
                    inner.next_expected += 1;
                }
                None => break,
            }
        }

        out
    }

    /// The position the next `drain` would start looking from; equal to one
    /// past the last contiguous position emitted or skipped so far.
    pub fn next_expected(&self) -> u64 {
        self.inner.lock().unwrap().next_expected
    }

    /// Number of positions buffered but not yet drained (gaps waiting on an
    /// earlier position), used to apply collector backpressure.
    pub fn buffered_len(&self) -> usize {
        self.inner.lock().unwrap().buffered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_contiguous_prefix_in_order() {
        let collector = OrderedCollector::new(1);
        collector.submit(2, "b");
        collector.submit(1, "a");
        collector.submit(4, "d");

        let drained = collector.drain();
        assert_eq!(drained, vec![(1, "a"), (2, "b")]);
        assert_eq!(collector.next_expected(), 3);
    }

    #[test]
    fn submit_is_idempotent_per_position() {
        let collector = OrderedCollector::new(1);
        collector.submit(1, "a");
        collector.submit(1, "a-duplicate");
        assert_eq!(collector.drain(), vec![(1, "a")]);
    }

    #[test]
    fn mark_skipped_advances_cursor_without_emitting() {
        let collector = OrderedCollector::new(1);
        collector.submit(1, "a");
        collector.mark_skipped(2, "quarantined");
        collector.submit(3, "c");

        assert_eq!(collector.drain(), vec![(1, "a"), (3, "c")]);
    }

    #[test]
    fn drain_never_emits_out_of_order_or_twice() {
        let collector = OrderedCollector::new(1);
        collector.submit(3, "c");
        assert!(collector.drain().is_empty());

        collector.submit(1, "a");
        assert_eq!(collector.drain(), vec![(1, "a")]);

        collector.submit(2, "b");
        assert_eq!(collector.drain(), vec![(2, "b"), (3, "c")]);
        assert!(collector.drain().is_empty());
    }

    #[test]
    fn resumed_collector_rejects_positions_before_start() {
        let collector = OrderedCollector::new(5);
        collector.submit(3, "stale");
        assert_eq!(collector.buffered_len(), 0);
        assert_eq!(collector.drain(), Vec::<(u64, &str)>::new());
    }
}
