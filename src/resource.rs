//! A value guarded by one of this crate's locks.
//!
//! [`SharedResource`] owns a `T` and a lock, and only hands the value out
//! through RAII [`Access`] guards, so every read and write of the value
//! happens inside a critical section. Any primitive implementing
//! [`RawLock`] can guard the value; timed access additionally requires
//! [`RawTimedLock`].

use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::time::Duration;

use crate::lock::{AcquireError, RawLock, RawTimedLock};

/// A default-constructed value coupled with the lock that serializes all
/// access to it.
///
/// # Example
///
/// ```
/// use exclusive::{ClhMutex, SharedResource};
///
/// let resource = SharedResource::<Vec<u32>, ClhMutex<2>>::new();
///
/// resource.access().unwrap().push(7);
/// assert_eq!(1, resource.access().unwrap().len());
/// ```
pub struct SharedResource<T, L> {
    mutex: L,
    resource: UnsafeCell<T>,
}

// SAFETY: same argument as `std::sync::Mutex`. The lock serializes every
// access to the value, so sharing the wrapper across threads only
// requires that the value itself may move between them.
unsafe impl<T: Send, L: Send> Send for SharedResource<T, L> {}
unsafe impl<T: Send, L: Sync> Sync for SharedResource<T, L> {}

impl<T: Default, L: Default> SharedResource<T, L> {
    /// Creates the resource with `T`'s default value and a fresh lock.
    pub fn new() -> Self {
        Self { mutex: L::default(), resource: UnsafeCell::new(T::default()) }
    }
}

impl<T: Default, L: Default> Default for SharedResource<T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, L: RawLock> SharedResource<T, L> {
    /// Acquires the lock and returns a guard borrowing the value.
    ///
    /// Spins until the lock is held.
    ///
    /// # Errors
    ///
    /// Propagates the underlying lock's acquisition failure; see
    /// [`AcquireError`].
    pub fn access(&self) -> Result<Access<'_, T, L>, AcquireError> {
        let token = self.mutex.lock()?;
        Ok(Access::new(self, token))
    }

    /// Returns a mutable reference to the value without locking.
    ///
    /// The exclusive borrow statically guarantees no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.resource.get_mut()
    }
}

impl<T, L: RawTimedLock> SharedResource<T, L> {
    /// Acquires the lock within `timeout` and returns a guard borrowing
    /// the value.
    ///
    /// # Errors
    ///
    /// [`AcquireError::TimedOut`] when the timeout elapses first, plus
    /// the underlying lock's own failures. No guard exists on the error
    /// path, so the value stays unreachable.
    pub fn access_within(&self, timeout: Duration) -> Result<Access<'_, T, L>, AcquireError> {
        let token = self.mutex.try_lock_for(timeout)?;
        Ok(Access::new(self, token))
    }
}

impl<T, L> Debug for SharedResource<T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResource").finish_non_exhaustive()
    }
}

/// An RAII guard granting exclusive access to a [`SharedResource`]'s
/// value.
///
/// The value is reached through [`Deref`] and [`DerefMut`], valid only
/// for the guard's lifetime. Dropping the guard releases the lock on
/// every exit path, panics included.
#[must_use = "if unused the lock is immediately released"]
pub struct Access<'a, T, L: RawLock> {
    shared: &'a SharedResource<T, L>,
    token: ManuallyDrop<L::Token>,
    /// Keeps the auto traits from being derived off the raw parts; the
    /// impls below state the actual bounds.
    marker: PhantomData<*mut T>,
}

// SAFETY: the guard witnesses exclusive access to the value, so sending
// it moves that exclusive access whole; the token releases correctly
// from any thread since the locks keep no per-thread state.
unsafe impl<T: Send, L: RawLock + Sync> Send for Access<'_, T, L> where L::Token: Send {}
// SAFETY: sharing the guard only shares `&T`.
unsafe impl<T: Sync, L: RawLock + Sync> Sync for Access<'_, T, L> where L::Token: Sync {}

impl<'a, T, L: RawLock> Access<'a, T, L> {
    fn new(shared: &'a SharedResource<T, L>, token: L::Token) -> Self {
        Self { shared, token: ManuallyDrop::new(token), marker: PhantomData }
    }
}

impl<T, L: RawLock> Deref for Access<'_, T, L> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the token witnesses that the lock is held by this
        // guard, so no other reference to the value can exist.
        unsafe { &*self.shared.resource.get() }
    }
}

impl<T, L: RawLock> DerefMut for Access<'_, T, L> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`, plus the exclusive borrow of the guard.
        unsafe { &mut *self.shared.resource.get() }
    }
}

impl<T, L: RawLock> Drop for Access<'_, T, L> {
    fn drop(&mut self) {
        // SAFETY: the token is taken exactly once, here; drop runs once.
        let token = unsafe { ManuallyDrop::take(&mut self.token) };
        // SAFETY: the token was minted by this very lock in `new`.
        unsafe { self.shared.mutex.unlock(token) };
    }
}

impl<T: Debug, L: RawLock> Debug for Access<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: Display, L: RawLock> Display for Access<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::array::ArrayMutex;
    use crate::clh::{ClhMutex, Retry};
    use crate::lock::AcquireError;
    use crate::relax::Yield;
    use crate::test::lots_and_lots;

    use super::SharedResource;

    #[test]
    fn increments_serialized_array() {
        assert_eq!(4_000, lots_and_lots::<ArrayMutex<4, Yield>>(4, 1_000));
    }

    #[test]
    fn increments_serialized_clh() {
        // One more thread than provisioned nodes: the retry policy makes
        // latecomers wait for a recycled node instead of failing.
        assert_eq!(4_000, lots_and_lots::<ClhMutex<3, Retry, Yield>>(4, 1_000));
    }

    #[test]
    fn overflow_when_slots_exceeded() {
        let resource = Arc::new(SharedResource::<u32, ArrayMutex<2, Yield>>::new());

        let (outcome, outcomes) = channel();
        let mut releases = Vec::new();
        let mut accessors = Vec::new();
        for _ in 0..3 {
            let resource = Arc::clone(&resource);
            let outcome = outcome.clone();
            let (release, held_until) = channel::<()>();
            releases.push(release);
            accessors.push(thread::spawn(move || match resource.access() {
                Ok(access) => {
                    outcome.send(Ok(())).unwrap();
                    held_until.recv().unwrap();
                    drop(access);
                }
                Err(error) => outcome.send(Err(error)).unwrap(),
            }));
        }
        drop(outcome);

        // Two slots, three accessors: one holds, one waits on its slot,
        // and the third wraps onto the held slot and must be refused.
        let mut first_two = vec![outcomes.recv().unwrap(), outcomes.recv().unwrap()];
        assert!(first_two.contains(&Err(AcquireError::Overflow)));
        assert!(first_two.contains(&Ok(())));

        // Releasing the holder lets the waiting accessor through.
        for release in &releases {
            let _ = release.send(());
        }
        first_two.push(outcomes.recv().unwrap());
        assert_eq!(1, first_two.iter().filter(|result| result.is_err()).count());

        for accessor in accessors {
            accessor.join().unwrap();
        }
    }

    #[test]
    fn access_within_fails_while_held() {
        let resource = Arc::new(SharedResource::<u32, ClhMutex<2, Retry, Yield>>::new());

        let (release, held_until) = channel::<()>();
        let (held, acquired) = channel();
        let holder = {
            let resource = Arc::clone(&resource);
            thread::spawn(move || {
                let access = resource.access().unwrap();
                held.send(()).unwrap();
                held_until.recv().unwrap();
                drop(access);
            })
        };
        acquired.recv().unwrap();

        assert_eq!(
            Some(AcquireError::TimedOut),
            resource.access_within(Duration::ZERO).err()
        );

        release.send(()).unwrap();
        holder.join().unwrap();

        *resource.access_within(Duration::ZERO).unwrap() += 1;
        assert_eq!(1, *resource.access().unwrap());
    }

    #[test]
    fn guard_releases_during_unwind() {
        let resource = Arc::new(SharedResource::<u32, ArrayMutex<4, Yield>>::new());

        let cloned = Arc::clone(&resource);
        let _ = thread::spawn(move || {
            let _access = cloned.access().unwrap();
            panic!("dropped while held");
        })
        .join();

        // The panicking thread's guard released on unwind.
        *resource.access().unwrap() += 1;
        assert_eq!(1, *resource.access().unwrap());
    }

    #[test]
    fn get_mut_bypasses_the_lock() {
        let mut resource = SharedResource::<u32, ArrayMutex<2, Yield>>::new();
        *resource.get_mut() = 42;
        assert_eq!(42, *resource.access().unwrap());
    }

    #[test]
    fn guard_formats_like_the_value() {
        let resource = SharedResource::<u32, ArrayMutex<2, Yield>>::new();
        let access = resource.access().unwrap();
        assert_eq!("0", format!("{access}"));
        assert_eq!("0", format!("{access:?}"));
    }
}
