//! Piece completion and priority bookkeeping shared by peers and readers.
//!
//! Peer sessions pick what to request from here; blocking readers park on
//! the table's condition variable until the piece they need is verified.

use std::ops::Range;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{PiecePriority, PieceState};

/// Why a blocked reader gave up waiting for a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("torrent closed")]
    Closed,
    #[error("timed out waiting for piece")]
    TimedOut,
    #[error("piece index out of range")]
    OutOfRange,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    state: PieceState,
    /// A peer session is currently downloading this piece
    reserved: bool,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    closed: bool,
}

/// Completion, priority and reservation state for every piece of a torrent.
#[derive(Debug)]
pub struct PieceTable {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl PieceTable {
    /// Creates a table where every piece awaits its initial hash check.
    pub fn new(count: usize) -> Self {
        let slot = Slot {
            state: PieceState {
                checking: true,
                ..PieceState::default()
            },
            reserved: false,
        };
        Self {
            inner: Mutex::new(Inner {
                slots: vec![slot; count],
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pieces in `range`; indices past the end are skipped.
    pub fn states(&self, range: Range<usize>) -> Vec<PieceState> {
        let inner = self.inner.lock();
        let end = range.end.min(inner.slots.len());
        let start = range.start.min(end);
        inner.slots[start..end].iter().map(|s| s.state).collect()
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.inner
            .lock()
            .slots
            .get(index)
            .is_some_and(|s| s.state.complete)
    }

    pub fn completed(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.state.complete)
            .count()
    }

    /// Records the result of hashing data already on disk.
    pub fn finish_check(&self, index: usize, verified: bool) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(index) {
            slot.state.checking = false;
            slot.state.complete |= verified;
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Marks a downloaded and verified piece complete.
    ///
    /// Returns `false` if it was already complete.
    pub fn mark_complete(&self, index: usize) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(index) else {
            return false;
        };
        let newly = !slot.state.complete;
        slot.state.complete = true;
        slot.state.checking = false;
        slot.reserved = false;
        drop(inner);
        self.changed.notify_all();
        newly
    }

    /// Gives up a reservation so another peer can fetch the piece.
    pub fn release(&self, index: usize) {
        if let Some(slot) = self.inner.lock().slots.get_mut(index) {
            slot.reserved = false;
        }
    }

    /// Raises every piece in `range` to at least `priority`. Never lowers.
    pub fn raise_priority(&self, range: Range<usize>, priority: PiecePriority) {
        let mut inner = self.inner.lock();
        let end = range.end.min(inner.slots.len());
        for slot in &mut inner.slots[range.start.min(end)..end] {
            if !slot.state.complete && slot.state.priority < priority {
                slot.state.priority = priority;
            }
        }
    }

    /// Reserves the most urgent wanted piece that `available` says the peer has.
    ///
    /// Ties go to the lowest index so downloads progress front to back.
    pub fn pick(&self, available: impl Fn(usize) -> bool) -> Option<usize> {
        let mut inner = self.inner.lock();
        let mut best: Option<(usize, PiecePriority)> = None;

        for (index, slot) in inner.slots.iter().enumerate() {
            if !Self::wanted(slot) || slot.reserved || !available(index) {
                continue;
            }
            if best.is_none_or(|(_, priority)| slot.state.priority > priority) {
                best = Some((index, slot.state.priority));
            }
        }

        let (index, _) = best?;
        inner.slots[index].reserved = true;
        Some(index)
    }

    /// Whether the peer has anything we still want.
    pub fn wants_any(&self, available: impl Fn(usize) -> bool) -> bool {
        self.inner
            .lock()
            .slots
            .iter()
            .enumerate()
            .any(|(index, slot)| Self::wanted(slot) && available(index))
    }

    /// BEP 3 bitfield of complete pieces, high bit first.
    pub fn bitfield(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut bits = vec![0u8; inner.slots.len().div_ceil(8)];
        for (index, slot) in inner.slots.iter().enumerate() {
            if slot.state.complete {
                bits[index / 8] |= 0x80 >> (index % 8);
            }
        }
        bits
    }

    /// Blocks until piece `index` is complete.
    ///
    /// The piece is raised to [`PiecePriority::Now`] while waiting.
    ///
    /// # Errors
    /// - `WaitError::Closed` - The table was closed before the piece arrived
    /// - `WaitError::TimedOut` - `deadline` passed first
    /// - `WaitError::OutOfRange` - No such piece
    pub fn wait_for(&self, index: usize, deadline: Option<Instant>) -> Result<(), WaitError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(WaitError::Closed);
            }
            let slot = inner.slots.get_mut(index).ok_or(WaitError::OutOfRange)?;
            if slot.state.complete {
                return Ok(());
            }
            slot.state.priority = PiecePriority::Now;

            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut inner, deadline).timed_out() {
                        let complete = inner.slots.get(index).is_some_and(|s| s.state.complete);
                        return if complete {
                            Ok(())
                        } else {
                            Err(WaitError::TimedOut)
                        };
                    }
                }
                None => self.changed.wait(&mut inner),
            }
        }
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn wanted(slot: &Slot) -> bool {
        !slot.state.complete && !slot.state.checking && slot.state.priority > PiecePriority::None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn checked_table(count: usize) -> PieceTable {
        let table = PieceTable::new(count);
        for index in 0..count {
            table.finish_check(index, false);
        }
        table
    }

    #[test]
    fn test_new_table_is_checking() {
        let table = PieceTable::new(3);
        assert!(table.states(0..3).iter().all(|s| s.checking && !s.complete));
        assert_eq!(table.pick(|_| true), None);
    }

    #[test]
    fn test_pick_prefers_priority_then_lowest_index() {
        let table = checked_table(6);
        table.raise_priority(0..6, PiecePriority::Normal);
        table.raise_priority(3..5, PiecePriority::High);

        assert_eq!(table.pick(|_| true), Some(3));
        assert_eq!(table.pick(|_| true), Some(4));
        assert_eq!(table.pick(|_| true), Some(0));
        assert_eq!(table.pick(|index| index == 5), Some(5));
    }

    #[test]
    fn test_pick_skips_unwanted_and_released_is_pickable_again() {
        let table = checked_table(2);
        assert_eq!(table.pick(|_| true), None);

        table.raise_priority(1..2, PiecePriority::Normal);
        assert_eq!(table.pick(|_| true), Some(1));
        assert_eq!(table.pick(|_| true), None);

        table.release(1);
        assert_eq!(table.pick(|_| true), Some(1));
    }

    #[test]
    fn test_raise_priority_never_lowers() {
        let table = checked_table(1);
        table.raise_priority(0..1, PiecePriority::High);
        table.raise_priority(0..1, PiecePriority::Normal);
        assert_eq!(table.states(0..1)[0].priority, PiecePriority::High);
    }

    #[test]
    fn test_bitfield_high_bit_first() {
        let table = checked_table(10);
        table.mark_complete(0);
        table.mark_complete(9);
        assert_eq!(table.bitfield(), vec![0b1000_0000, 0b0100_0000]);
        assert_eq!(table.completed(), 2);
    }

    #[test]
    fn test_wait_for_wakes_when_piece_completes() {
        let table = Arc::new(checked_table(4));
        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.wait_for(2, None))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.states(2..3)[0].priority, PiecePriority::Now);
        assert!(table.mark_complete(2));
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_wait_for_times_out() {
        let table = checked_table(1);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(table.wait_for(0, Some(deadline)), Err(WaitError::TimedOut));
    }

    #[test]
    fn test_close_fails_blocked_readers() {
        let table = Arc::new(checked_table(1));
        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.wait_for(0, None))
        };

        thread::sleep(Duration::from_millis(20));
        table.close();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Closed));
    }

    #[test]
    fn test_wait_for_complete_piece_returns_immediately() {
        let table = checked_table(1);
        table.mark_complete(0);
        assert_eq!(table.wait_for(0, None), Ok(()));
        assert_eq!(table.wait_for(5, None), Err(WaitError::OutOfRange));
    }

    proptest! {
        #[test]
        fn prop_pick_only_returns_wanted_pieces(
            priorities in proptest::collection::vec(0u8..4, 1..64),
            complete in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let table = checked_table(priorities.len());
            for (index, level) in priorities.iter().enumerate() {
                let priority = match level {
                    0 => PiecePriority::None,
                    1 => PiecePriority::Normal,
                    2 => PiecePriority::High,
                    _ => PiecePriority::Now,
                };
                table.raise_priority(index..index + 1, priority);
                if complete[index] {
                    table.mark_complete(index);
                }
            }

            let mut seen = Vec::new();
            while let Some(index) = table.pick(|_| true) {
                let state = table.states(index..index + 1)[0];
                prop_assert!(!state.complete);
                prop_assert!(state.priority > PiecePriority::None);
                prop_assert!(!seen.contains(&index));
                seen.push(index);
            }

            let picked_priorities: Vec<_> = seen
                .iter()
                .map(|&index| table.states(index..index + 1)[0].priority)
                .collect();
            prop_assert!(picked_priorities.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
