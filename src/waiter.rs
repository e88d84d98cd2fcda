//! The per-suspension waiter cell.
//!
//! A cell is the hand-off point between one suspended task and the single
//! resumption funnel (the dispatch thread for selector waiters, the
//! checking-in caller for pool waiters). Its state is three monotone bits:
//!
//! - `CANCELLED`: set by `cancel`, from any thread, lock- and
//!   allocation-free. Never resumes anything.
//! - `ARMED`: a suspension handle is stored. Set after the handle is in the
//!   slot, so an armed cell always has a handle to take.
//! - `DRAINED`: the handle was taken. Exactly one `take_for_resume` per cell
//!   observes the transition; everything after it sees a dead cell.
//!
//! The payload travels in the slot next to the handle: the resumer stores it
//! before draining, the owner reads it after observing `DRAINED`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::Waker;

const CANCELLED: u8 = 0b001;
const ARMED: u8 = 0b010;
const DRAINED: u8 = 0b100;

pub(crate) struct WaiterCell<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
}

struct Slot<T> {
    waker: Option<Waker>,
    value: Option<T>,
}

/// What the owner finds in a drained cell.
pub(crate) enum Resumption<T> {
    /// The funnel delivered a payload.
    Delivered(T),
    /// The cell was drained without a payload: a cancellation drain.
    Cancelled,
}

impl<T> WaiterCell<T> {
    pub(crate) fn new() -> WaiterCell<T> {
        WaiterCell {
            state: AtomicU8::new(0),
            slot: Mutex::new(Slot {
                waker: None,
                value: None,
            }),
        }
    }

    /// Stores the suspension handle and publishes eligibility.
    ///
    /// Re-arming while still armed refreshes the handle; arming a drained
    /// cell returns false and the caller must consult [`try_take`] instead.
    ///
    /// [`try_take`]: WaiterCell::try_take
    pub(crate) fn arm(&self, waker: &Waker) -> bool {
        {
            let mut slot = self.slot.lock().unwrap();
            if self.state.load(Ordering::Acquire) & DRAINED != 0 {
                return false;
            }
            match &mut slot.waker {
                Some(current) if current.will_wake(waker) => {}
                other => *other = Some(waker.clone()),
            }
        }
        // The handle is in the slot before ARMED becomes visible.
        let prior = self.state.fetch_or(ARMED, Ordering::AcqRel);
        prior & DRAINED == 0
    }

    /// Synchronous cancellation intent. Never resumes; safe from any thread.
    pub(crate) fn cancel(&self) {
        self.state.fetch_or(CANCELLED, Ordering::AcqRel);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) & CANCELLED != 0
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.state.load(Ordering::Acquire) & DRAINED != 0
    }

    /// True while the cell can still be handed a resumption:
    /// `armed && !cancelled && !drained`.
    pub(crate) fn is_eligible(&self) -> bool {
        self.state.load(Ordering::Acquire) & (ARMED | CANCELLED | DRAINED) == ARMED
    }

    /// The `armed, !drained -> drained` transition. At most one call per
    /// cell succeeds, returning the state it observed.
    fn drain(&self) -> Option<u8> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state & ARMED == 0 || state & DRAINED != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                state,
                state | DRAINED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(current) => state = current,
            }
        }
    }

    /// Funnel-side: drains the cell if it is armed and not yet drained.
    ///
    /// Returns the stored handle and whether the cancelled bit was set at the
    /// moment of draining. At most one call per cell returns `Some`.
    pub(crate) fn take_for_resume(&self) -> Option<(Waker, bool)> {
        let state = self.drain()?;
        // ARMED is set only after the handle is stored, and only this call
        // observed the ARMED -> DRAINED transition.
        let waker = self.slot.lock().unwrap().waker.take();
        waker.map(|waker| (waker, state & CANCELLED != 0))
    }

    /// Funnel-side: stores `value` and drains the cell.
    ///
    /// Returns the handle to wake (outside any lock) and whether the cell was
    /// cancelled at the moment of draining. Cancellation dominates: a
    /// cancelled cell is still drained and woken, but no payload is stored,
    /// so the owner observes the cancellation. The drain happens under the
    /// slot lock, so an owner that saw the drained bit always reads a
    /// consistent payload.
    pub(crate) fn resume(&self, value: T) -> Option<(Waker, bool)> {
        let mut slot = self.slot.lock().unwrap();
        let state = self.drain()?;
        let was_cancelled = state & CANCELLED != 0;
        if !was_cancelled {
            slot.value = Some(value);
        }
        let waker = slot.waker.take();
        waker.map(|waker| (waker, was_cancelled))
    }

    /// Owner-side: observes the outcome once the cell has drained.
    ///
    /// `None` means the cell is still in flight and the owner should keep
    /// waiting.
    pub(crate) fn try_take(&self) -> Option<Resumption<T>> {
        if self.state.load(Ordering::Acquire) & DRAINED == 0 {
            return None;
        }
        let mut slot = self.slot.lock().unwrap();
        match slot.value.take() {
            Some(value) => Some(Resumption::Delivered(value)),
            None => Some(Resumption::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct CountWaker(std::sync::atomic::AtomicUsize);

    impl Wake for CountWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn waker_pair() -> (Arc<CountWaker>, Waker) {
        let count = Arc::new(CountWaker(std::sync::atomic::AtomicUsize::new(0)));
        let waker = Waker::from(count.clone());
        (count, waker)
    }

    #[test]
    fn take_before_arm_is_none() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        assert!(cell.take_for_resume().is_none());
        assert!(cell.try_take().is_none());
    }

    #[test]
    fn exactly_one_take() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (_count, waker) = waker_pair();
        assert!(cell.arm(&waker));
        assert!(cell.take_for_resume().is_some());
        assert!(cell.take_for_resume().is_none());
        assert!(cell.is_drained());
    }

    #[test]
    fn resume_delivers_payload() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (count, waker) = waker_pair();
        assert!(cell.arm(&waker));
        let (resume, was_cancelled) = cell.resume(7).expect("eligible cell");
        assert!(!was_cancelled);
        resume.wake();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        match cell.try_take() {
            Some(Resumption::Delivered(7)) => {}
            _ => panic!("expected delivered payload"),
        }
    }

    #[test]
    fn resume_after_cancel_drops_payload() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (_count, waker) = waker_pair();
        assert!(cell.arm(&waker));
        cell.cancel();
        let (_waker, was_cancelled) = cell.resume(7).expect("armed cell");
        assert!(was_cancelled);
        match cell.try_take() {
            Some(Resumption::Cancelled) => {}
            _ => panic!("cancellation dominates the payload"),
        }
    }

    #[test]
    fn cancel_then_arm_stays_takeable_as_cancelled() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        cell.cancel();
        let (_count, waker) = waker_pair();
        assert!(cell.arm(&waker));
        assert!(!cell.is_eligible());
        let (_waker, was_cancelled) = cell.take_for_resume().unwrap();
        assert!(was_cancelled);
        match cell.try_take() {
            Some(Resumption::Cancelled) => {}
            _ => panic!("expected cancelled resumption"),
        }
    }

    #[test]
    fn cancel_after_drain_is_noop() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (_count, waker) = waker_pair();
        cell.arm(&waker);
        let (_waker, was_cancelled) = cell.take_for_resume().unwrap();
        assert!(!was_cancelled);
        cell.cancel();
        // Drained before the cancel; the owner still observes a delivery
        // shape, not a cancellation, once a payload was stored.
        assert!(cell.take_for_resume().is_none());
    }

    #[test]
    fn arm_after_drain_reports_dead_cell() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (_count, waker) = waker_pair();
        cell.arm(&waker);
        cell.take_for_resume().unwrap();
        assert!(!cell.arm(&waker));
    }

    #[test]
    fn resume_on_drained_cell_drops_value() {
        let cell: WaiterCell<u32> = WaiterCell::new();
        let (_count, waker) = waker_pair();
        cell.arm(&waker);
        cell.take_for_resume().unwrap();
        assert!(cell.resume(9).is_none());
        match cell.try_take() {
            Some(Resumption::Cancelled) => {}
            _ => panic!("late payload must not surface"),
        }
    }
}
