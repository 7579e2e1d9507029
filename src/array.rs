//! Array-slot ticket lock.
//!
//! A ring of `N` cache-line-isolated slots forms a strictly FIFO lock.
//! Each acquirer draws a ticket from a shared counter and spins on the
//! slot the ticket maps to; a releaser wakes exactly the next slot. There
//! is no queue to maintain, so acquire and release are constant-time and
//! allocation-free.
//!
//! The ring only seats `N` acquirers. A ticket that wraps onto a slot
//! whose earlier holder is still seated means more than `N` acquisitions
//! are in flight; that acquisition fails fast with
//! [`AcquireError::Overflow`] instead of corrupting the rotation.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::{AtomicBool, AtomicUsize};
use crate::lock::{AcquireError, RawLock};
use crate::relax::{Relax, Spin};

/// One position of the ring.
///
/// `ready` grants the slot its turn; `busy` seats the acquirer that won
/// the slot until its releaser clears it, which is what makes a wrapped
/// ticket detectable.
struct Slot {
    ready: AtomicBool,
    busy: AtomicBool,
}

impl Slot {
    fn new(ready: bool) -> Self {
        Self { ready: AtomicBool::new(ready), busy: AtomicBool::new(false) }
    }
}

/// Proof of a held [`ArrayMutex`]; consumed on release.
#[derive(Debug)]
#[must_use = "a token must be passed back to `unlock`, or the lock stays held"]
pub struct ArrayToken {
    index: usize,
}

/// A strictly FIFO ticket lock over `N` cache-padded slots.
///
/// `N` must be a power of two (enforced at compile time): tickets are
/// mapped to slots with a mask, and the ticket counter stays aligned with
/// the ring across its wrap-around only when `N` divides the counter's
/// range evenly.
///
/// Acquisitions are served in ticket order, so the lock cannot starve a
/// waiter. Once a ticket is drawn there is no way to give it back; this
/// lock has no timed or cancellable acquisition.
///
/// # Example
///
/// ```
/// use exclusive::{ArrayMutex, RawLock};
///
/// let mutex = ArrayMutex::<4>::new();
///
/// let token = mutex.lock().unwrap();
/// // critical section
/// unsafe { mutex.unlock(token) };
/// ```
pub struct ArrayMutex<const N: usize, R = Spin> {
    slots: [CachePadded<Slot>; N],
    /// The last drawn ticket. Allowed to run ahead of the ring and wrap;
    /// slots are indexed modulo `N`.
    tail: AtomicUsize,
    relax: PhantomData<R>,
}

impl<const N: usize, R> ArrayMutex<N, R> {
    /// Creates the lock with slot 0 ready to be claimed.
    pub fn new() -> Self {
        const {
            assert!(N.is_power_of_two(), "the number of slots must be a power of two");
        }
        Self {
            slots: core::array::from_fn(|index| CachePadded::new(Slot::new(index == 0))),
            tail: AtomicUsize::new(0),
            relax: PhantomData,
        }
    }
}

impl<const N: usize, R> Default for ArrayMutex<N, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, R> Debug for ArrayMutex<N, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayMutex").field("slots", &N).finish_non_exhaustive()
    }
}

// SAFETY: tickets order acquisitions totally; the `busy` flag refuses the
// only way two acquirers could be granted one slot (a wrapped ticket), so
// at most one token per instant exists between `lock` and `unlock`.
unsafe impl<const N: usize, R: Relax> RawLock for ArrayMutex<N, R> {
    type Token = ArrayToken;

    fn lock(&self) -> Result<Self::Token, AcquireError> {
        let ticket = self.tail.fetch_add(1, Relaxed);
        let index = ticket & (N - 1);
        let slot = &self.slots[index];

        // The slot's turn is granted by the release store in `unlock`;
        // this acquire pairs with it and orders the critical section.
        let mut relax = R::new();
        while !slot.ready.load(Acquire) {
            relax.relax();
        }

        if slot.busy.swap(true, Acquire) {
            // An earlier ticket is still seated here: the ring has more
            // acquirers in flight than slots. The failed draw consumes
            // nothing; the seated holder proceeds untouched.
            return Err(AcquireError::Overflow);
        }

        Ok(ArrayToken { index })
    }

    unsafe fn unlock(&self, token: ArrayToken) {
        let slot = &self.slots[token.index];
        slot.ready.store(false, Relaxed);

        let next = &self.slots[(token.index + 1) & (N - 1)];
        next.busy.store(false, Relaxed);
        // Publishes the critical section and the `busy` clear above to
        // the next holder's acquire spin.
        next.ready.store(true, Release);
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use crate::lock::{AcquireError, RawLock};
    use crate::relax::Yield;

    use super::ArrayMutex;

    type Mutex<const N: usize> = ArrayMutex<N, Yield>;

    #[test]
    fn smoke() {
        let mutex = Mutex::<4>::new();
        for _ in 0..8 {
            let token = mutex.lock().unwrap();
            unsafe { mutex.unlock(token) };
        }
    }

    #[test]
    fn wrapped_ticket_overflows() {
        let mutex = Mutex::<1>::new();

        let held = mutex.lock().unwrap();
        // The second ticket wraps onto the held slot and must be refused.
        assert_eq!(Some(AcquireError::Overflow), mutex.lock().err());

        // The refusal does not disturb the holder or the rotation.
        unsafe { mutex.unlock(held) };
        let token = mutex.lock().unwrap();
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn release_restores_the_initial_state() {
        let mutex = Mutex::<2>::new();

        // Walk the ring a few full turns; every fresh acquire must
        // succeed without spinning.
        for _ in 0..6 {
            let token = mutex.lock().unwrap();
            unsafe { mutex.unlock(token) };
        }
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::lock_join;
    use crate::relax::Yield;

    use super::ArrayMutex;

    #[test]
    fn serializes_increments() {
        lock_join::<ArrayMutex<4, Yield>>();
    }
}
