//! The contract between the locks and the code composing over them.

use core::time::Duration;

use thiserror::Error;

use crate::clock::Clock;

/// The ways an acquisition can fail.
///
/// Release never fails, and none of these conditions are retried
/// internally; the caller decides whether to back off, retry or escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AcquireError {
    /// More acquirers in flight than the lock's slot ring can seat.
    ///
    /// Raised by [`ArrayMutex`](crate::array::ArrayMutex) when a ticket
    /// wraps onto a slot that is still occupied. Fatal to the call, not to
    /// the lock: later acquisitions may succeed once current holders
    /// release.
    #[error("more in-flight acquirers than lock slots")]
    Overflow,

    /// No free queue node was available.
    ///
    /// Raised by [`ClhMutex`](crate::clh::ClhMutex) built with the
    /// [`Die`](crate::clh::Die) policy when its pool is empty.
    #[error("the lock's node pool is exhausted")]
    Exhausted,

    /// The deadline elapsed before the lock could be acquired.
    ///
    /// The outcome of every timed acquisition that ran out of time; not a
    /// fault of the lock.
    #[error("deadline elapsed while waiting for the lock")]
    TimedOut,
}

/// A mutual exclusion primitive that hands out a token per acquisition.
///
/// The token is the proof of ownership: `lock` mints it, `unlock` consumes
/// it. Carrying the per-acquisition state in a value instead of in
/// thread-local storage means any number of lock instances can be held by
/// one thread at once, and a guard may release from a different thread
/// than the one that acquired.
///
/// # Safety
///
/// Implementations must guarantee mutual exclusion: between a `lock` call
/// returning `Ok(token)` and the matching `unlock(token)`, no other
/// acquisition on the same instance may succeed.
pub unsafe trait RawLock {
    /// Proof of a successful acquisition; consumed on release.
    type Token;

    /// Acquires the lock, spinning until it is held.
    ///
    /// # Errors
    ///
    /// Returns the lock's acquisition failure, if it has one; see
    /// [`AcquireError`]. Implementations for which acquisition cannot fail
    /// always return `Ok`.
    fn lock(&self) -> Result<Self::Token, AcquireError>;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// `token` must have been returned by an acquisition on this same
    /// instance and must not be reused afterwards.
    unsafe fn unlock(&self, token: Self::Token);
}

/// A [`RawLock`] whose acquisition can be bounded by a deadline.
///
/// All three methods behave like [`lock`] up to the moment waiting becomes
/// necessary; the clock is only read where progress is impossible, so an
/// uncontested acquisition succeeds even with a deadline already in the
/// past.
///
/// # Safety
///
/// Same contract as [`RawLock`]; the timed methods mint tokens under the
/// same exclusivity guarantee.
///
/// [`lock`]: RawLock::lock
pub unsafe trait RawTimedLock: RawLock {
    /// The clock deadlines are measured against.
    type Clock: Clock;

    /// Acquires the lock only if that requires no waiting.
    ///
    /// Never reads the clock.
    ///
    /// # Errors
    ///
    /// [`AcquireError::TimedOut`] when the lock is contended, plus the
    /// lock's own failures.
    fn try_lock(&self) -> Result<Self::Token, AcquireError>;

    /// Acquires the lock, giving up `timeout` from now.
    ///
    /// # Errors
    ///
    /// [`AcquireError::TimedOut`] when the timeout elapses first, plus the
    /// lock's own failures.
    fn try_lock_for(&self, timeout: Duration) -> Result<Self::Token, AcquireError>;

    /// Acquires the lock, giving up once `deadline` is reached.
    ///
    /// # Errors
    ///
    /// [`AcquireError::TimedOut`] when the deadline passes first, plus the
    /// lock's own failures.
    fn try_lock_until(
        &self,
        deadline: <Self::Clock as Clock>::Instant,
    ) -> Result<Self::Token, AcquireError>;
}

#[cfg(all(not(loom), test))]
mod tests {
    use super::AcquireError;

    #[test]
    fn errors_describe_themselves() {
        assert_eq!(
            "more in-flight acquirers than lock slots",
            AcquireError::Overflow.to_string()
        );
        assert_eq!(
            "the lock's node pool is exhausted",
            AcquireError::Exhausted.to_string()
        );
        assert_eq!(
            "deadline elapsed while waiting for the lock",
            AcquireError::TimedOut.to_string()
        );
    }
}
