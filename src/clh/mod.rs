//! Bounded CLH queue lock with deadline-based acquisition.
//!
//! The classic Craig-Landin-Hagersten lock chains waiters into an
//! implicit queue: each one spins on a flag owned by its predecessor, so
//! all waiting traffic stays on a local cache line and hand-off needs no
//! shake between releaser and successor. This variant adds two things:
//!
//! - **A fixed node pool.** Queue nodes live in a slab of `N + 2` entries
//!   owned by the mutex; nothing is allocated after construction. A free
//!   queue recycles them: a waiter that watches its predecessor unlock
//!   returns that predecessor to the pool.
//! - **Abandonment.** A waiter whose deadline expires records the
//!   predecessor it was spinning on in its own node and unlocks it. Its
//!   successor then recycles the abandoned node and inherits the
//!   recorded predecessor, so the queue stays FIFO among the waiters
//!   that remain.
//!
//! `N` should cover the largest number of threads contending for the
//! lock at once. What happens when it does not is the construction-time
//! [`ExhaustionPolicy`].

mod queue;

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::time::Duration;

use crossbeam_utils::CachePadded;

use crate::cfg::atomic::{AtomicBool, AtomicU32, AtomicUsize};
use crate::clock::{Clock, Steady};
use crate::lock::{AcquireError, RawLock, RawTimedLock};
use crate::relax::{Relax, Spin};

use queue::{FreeQueue, NIL};

/// One entry of the node slab.
struct Node {
    /// Link used while the node sits in the free queue.
    next: AtomicUsize,
    /// The predecessor an abandoning owner was spinning on, recorded for
    /// the successor to inherit. `NIL` on every other path.
    pred: AtomicUsize,
    /// True from the moment an owner declares intent until it releases
    /// or abandons.
    locked: AtomicBool,
}

impl Node {
    fn new() -> Self {
        Self {
            next: AtomicUsize::new(NIL),
            pred: AtomicUsize::new(NIL),
            locked: AtomicBool::new(false),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// What an acquisition does when the node pool is momentarily empty.
///
/// Chosen at construction through a type parameter; implemented by
/// [`Retry`] and [`Die`].
pub trait ExhaustionPolicy: sealed::Sealed {
    /// Whether an empty pool fails the acquisition immediately.
    const FAIL_FAST: bool;
}

/// Keep polling the pool until a node is recycled or the deadline
/// expires.
pub struct Retry;

impl sealed::Sealed for Retry {}

impl ExhaustionPolicy for Retry {
    const FAIL_FAST: bool = false;
}

/// Fail the acquisition with [`AcquireError::Exhausted`] at once.
pub struct Die;

impl sealed::Sealed for Die {}

impl ExhaustionPolicy for Die {
    const FAIL_FAST: bool = true;
}

/// Proof of a held [`ClhMutex`]; consumed on release.
///
/// The token carries the holder's active queue node, which is what lets
/// release work from any thread and lets one thread hold several
/// instances at once.
#[derive(Debug)]
#[must_use = "a token must be passed back to `unlock`, or the lock stays held"]
pub struct ClhToken {
    node: usize,
}

/// The deadline a single acquisition runs under.
///
/// The clock is consulted only through [`expired`](Self::expired), and
/// the lock only calls that where progress is impossible, so `Never` and
/// `Elapsed` acquisitions never read the clock at all.
enum Deadline<C: Clock> {
    /// Wait forever.
    Never,
    /// Give up wherever a wait would begin.
    Elapsed,
    /// Give up once the clock reaches the instant.
    At(C::Instant),
}

impl<C: Clock> Deadline<C> {
    fn expired(&self) -> bool {
        match self {
            Self::Never => false,
            Self::Elapsed => true,
            Self::At(instant) => C::now() >= *instant,
        }
    }
}

/// A CLH queue lock over a pool of `N + 2` nodes, with timed
/// acquisition.
///
/// `N` is the number of waiters the pool is provisioned for; the two
/// extra nodes serve as the initial queue tail and the free queue's
/// sentinel. `F` picks the [`ExhaustionPolicy`], `R` the
/// [`Relax`](crate::relax::Relax) policy, and `C` the [`Clock`] deadlines
/// are measured against.
///
/// Acquisitions are FIFO in the order their enqueue succeeds; a timed
/// waiter that gives up leaves the line without disturbing the order of
/// those behind it.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use exclusive::{ClhMutex, RawLock, RawTimedLock};
///
/// let mutex = ClhMutex::<2>::new();
///
/// let held = mutex.lock().unwrap();
/// // A second acquisition cannot succeed in time.
/// assert!(mutex.try_lock_for(Duration::from_millis(10)).is_err());
///
/// unsafe { mutex.unlock(held) };
/// assert!(mutex.try_lock().is_ok());
/// ```
pub struct ClhMutex<const N: usize, F = Retry, R = Spin, C = Steady> {
    nodes: Box<[CachePadded<Node>]>,
    available: FreeQueue,
    /// Index of the last enqueued node; waiters swap themselves in here
    /// and spin on whatever they displaced.
    tail: CachePadded<AtomicUsize>,
    /// Successful enqueues since construction. Observational only.
    queue_count: AtomicU32,
    policy: PhantomData<(F, R, C)>,
}

impl<const N: usize, F, R, C> ClhMutex<N, F, R, C> {
    /// Creates the lock with a full pool and an empty queue.
    pub fn new() -> Self {
        const {
            assert!(N > 0, "the pool must hold at least one node");
            assert!(N + 2 < NIL, "the pool exceeds the free queue's index range");
        }
        let nodes: Vec<CachePadded<Node>> =
            (0..N + 2).map(|_| CachePadded::new(Node::new())).collect();
        let nodes = nodes.into_boxed_slice();

        // Node 0 seeds the queue as the unlocked initial tail; the free
        // queue spans the rest, retaining one entry as its sentinel.
        let available = FreeQueue::new(&nodes, 1);

        Self {
            nodes,
            available,
            tail: CachePadded::new(AtomicUsize::new(0)),
            queue_count: AtomicU32::new(0),
            policy: PhantomData,
        }
    }

    /// The number of acquisitions that have joined the waiting line so
    /// far, successful or later abandoned.
    ///
    /// Monotone (wrapping at `u32::MAX`) and exposed for observation;
    /// tests use it to sequence enqueues deterministically.
    pub fn queue_count(&self) -> u32 {
        self.queue_count.load(Acquire)
    }
}

impl<const N: usize, F: ExhaustionPolicy, R: Relax, C: Clock> ClhMutex<N, F, R, C> {
    /// The single acquisition path; `lock` and the `try_lock` family
    /// differ only in the deadline they run under.
    fn lock_with_deadline(&self, deadline: &Deadline<C>) -> Result<ClhToken, AcquireError> {
        let node = self.draw_node(deadline)?;
        self.nodes[node].locked.store(true, Relaxed);

        // Swap into the line: claim the current tail as predecessor and
        // publish this node in its place. The release on success makes
        // the intent store above visible to whoever displaces us next.
        let mut pred = self.tail.load(Acquire);
        let mut relax = R::new();
        while let Err(observed) =
            self.tail.compare_exchange_weak(pred, node, Release, Acquire)
        {
            pred = observed;
            relax.relax();
        }
        self.queue_count.fetch_add(1, Release);

        // Spin on the predecessor until it unlocks. An unlocked
        // predecessor that recorded a predecessor of its own was
        // abandoned: recycle it and keep waiting on the inherited one.
        loop {
            let mut relax = R::new();
            while self.nodes[pred].locked.load(Acquire) {
                if deadline.expired() {
                    // Abandon: record the chain for our successor, then
                    // unlock so it can make progress. This node stays in
                    // the queue until that successor recycles it.
                    self.nodes[node].pred.store(pred, Relaxed);
                    self.nodes[node].locked.store(false, Release);
                    return Err(AcquireError::TimedOut);
                }
                relax.relax();
            }

            let inherited = self.nodes[pred].pred.load(Relaxed);
            self.available.push(&self.nodes, pred);
            if inherited == NIL {
                break;
            }
            pred = inherited;
        }

        Ok(ClhToken { node })
    }

    /// Obtains a free node per the exhaustion policy.
    fn draw_node(&self, deadline: &Deadline<C>) -> Result<usize, AcquireError> {
        let mut relax = R::new();
        loop {
            if let Some(node) = self.available.try_pop(&self.nodes) {
                return Ok(node);
            }
            if deadline.expired() {
                return Err(AcquireError::TimedOut);
            }
            if F::FAIL_FAST {
                return Err(AcquireError::Exhausted);
            }
            relax.relax();
        }
    }
}

impl<const N: usize, F, R, C> Default for ClhMutex<N, F, R, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, F, R, C> Debug for ClhMutex<N, F, R, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClhMutex")
            .field("pool", &(N + 2))
            .field("queue_count", &self.queue_count.load(Acquire))
            .finish_non_exhaustive()
    }
}

// SAFETY: a token is minted only after this thread's node completed the
// tail swap and its whole predecessor chain unlocked; the matching
// release/acquire pair on `locked` makes each critical section visible
// to the next. At most one node at a time can observe an unlocked,
// chain-free predecessor, so at most one token exists per instant.
unsafe impl<const N: usize, F: ExhaustionPolicy, R: Relax, C: Clock> RawLock
    for ClhMutex<N, F, R, C>
{
    type Token = ClhToken;

    fn lock(&self) -> Result<Self::Token, AcquireError> {
        self.lock_with_deadline(&Deadline::Never)
    }

    unsafe fn unlock(&self, token: ClhToken) {
        let node = &self.nodes[token.node];
        // A release is never an abandonment: clear the chain marker
        // before the unlocking store can publish it.
        node.pred.store(NIL, Relaxed);
        // Synchronizes with the successor's acquire spin.
        node.locked.store(false, Release);
    }
}

// SAFETY: same argument as the `RawLock` impl; deadlines only decide
// when a waiter stops trying, never who may hold the lock.
unsafe impl<const N: usize, F: ExhaustionPolicy, R: Relax, C: Clock> RawTimedLock
    for ClhMutex<N, F, R, C>
{
    type Clock = C;

    fn try_lock(&self) -> Result<Self::Token, AcquireError> {
        self.lock_with_deadline(&Deadline::Elapsed)
    }

    fn try_lock_for(&self, timeout: Duration) -> Result<Self::Token, AcquireError> {
        self.lock_with_deadline(&Deadline::At(C::deadline_after(timeout)))
    }

    fn try_lock_until(&self, deadline: C::Instant) -> Result<Self::Token, AcquireError> {
        self.lock_with_deadline(&Deadline::At(deadline))
    }
}

#[cfg(all(not(loom), test))]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::lock::{AcquireError, RawLock, RawTimedLock};
    use crate::relax::Yield;
    use crate::test::FakeClock;

    use super::{ClhMutex, Die, Retry};

    type Mutex<const N: usize> = ClhMutex<N, Retry, Yield>;
    type FakeMutex<const N: usize> = ClhMutex<N, Retry, Yield, FakeClock>;

    /// Holds the mutex on another thread until `release` fires.
    fn hold<const N: usize>(
        mutex: &Arc<FakeMutex<N>>,
    ) -> (std::sync::mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (release, held_until) = channel();
        let (held, acquired) = channel();
        let handle = {
            let mutex = Arc::clone(mutex);
            thread::spawn(move || {
                let token = mutex.lock().unwrap();
                held.send(()).unwrap();
                held_until.recv().unwrap();
                unsafe { mutex.unlock(token) };
            })
        };
        acquired.recv().unwrap();
        (release, handle)
    }

    #[test]
    fn smoke() {
        let mutex = Mutex::<2>::new();
        for _ in 0..4 {
            let token = mutex.lock().unwrap();
            unsafe { mutex.unlock(token) };
        }
    }

    #[test]
    fn try_lock_fails_only_under_contention() {
        let mutex = Mutex::<2>::new();

        let held = mutex.try_lock().unwrap();
        assert_eq!(Some(AcquireError::TimedOut), mutex.try_lock().err());

        unsafe { mutex.unlock(held) };
        let token = mutex.try_lock().unwrap();
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn abandoned_waiter_is_skipped_after_release() {
        let mutex = Mutex::<2>::new();

        let held = mutex.lock().unwrap();
        // This waiter joins the line and abandons immediately.
        assert!(mutex.try_lock().is_err());
        unsafe { mutex.unlock(held) };

        // A fresh acquisition walks over the abandoned node and succeeds.
        let token = mutex.lock().unwrap();
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn non_positive_deadline_succeeds_uncontested() {
        let _timeline = FakeClock::reset();
        let mutex = FakeMutex::<1>::new();

        FakeClock::set_now(100);

        // A deadline already in the past is only noticed where waiting
        // would start, so an uncontested acquisition goes through.
        let token = mutex.try_lock_until(50).unwrap();
        unsafe { mutex.unlock(token) };

        let token = mutex.try_lock_for(Duration::ZERO).unwrap();
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn die_policy_reports_exhaustion() {
        let mutex = ClhMutex::<1, Die, Yield>::new();

        // The holder takes the one provisioned node ...
        let held = mutex.lock().unwrap();
        // ... and an abandoning waiter strands the remaining one in the
        // queue.
        assert_eq!(Some(AcquireError::TimedOut), mutex.try_lock().err());
        // The pool is now empty, which under `Die` is an error rather
        // than a wait.
        assert_eq!(Some(AcquireError::Exhausted), mutex.lock().err());

        unsafe { mutex.unlock(held) };
    }

    #[test]
    fn queue_count_counts_every_join() {
        let mutex = Mutex::<2>::new();
        assert_eq!(0, mutex.queue_count());

        let held = mutex.lock().unwrap();
        assert_eq!(1, mutex.queue_count());

        // An abandoned attempt still joined the line.
        assert!(mutex.try_lock().is_err());
        assert_eq!(2, mutex.queue_count());

        unsafe { mutex.unlock(held) };
        let token = mutex.lock().unwrap();
        assert_eq!(3, mutex.queue_count());
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn timed_wait_runs_the_clock_down() {
        let mutex = Arc::new(FakeMutex::<2>::new());
        let _timeline = FakeClock::reset();
        let (release, holder) = hold(&mutex);

        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock_until(100))
        };
        while mutex.queue_count() < 2 {
            thread::yield_now();
        }

        FakeClock::set_now(100);
        assert_eq!(Some(AcquireError::TimedOut), waiter.join().unwrap().err());

        release.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn identical_deadlines_abandon_and_recycle() {
        let mutex = Arc::new(FakeMutex::<3>::new());
        let _timeline = FakeClock::reset();
        let (release, holder) = hold(&mutex);

        // Two waiters join with the same deadline.
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || mutex.try_lock_until(100))
            })
            .collect();
        while mutex.queue_count() < 3 {
            thread::yield_now();
        }

        FakeClock::set_now(150);
        for waiter in waiters {
            assert_eq!(Some(AcquireError::TimedOut), waiter.join().unwrap().err());
        }

        // The original holder is undisturbed by the abandonments.
        assert_eq!(Some(AcquireError::TimedOut), mutex.try_lock().err());

        release.send(()).unwrap();
        holder.join().unwrap();

        // A fresh acquisition walks the whole abandoned chain, recycling
        // it on the way.
        let token = mutex.try_lock().unwrap();
        unsafe { mutex.unlock(token) };
    }

    #[test]
    fn staggered_deadlines_skip_abandoned_waiter() {
        let mutex = Arc::new(FakeMutex::<3>::new());
        let _timeline = FakeClock::reset();
        let (release, holder) = hold(&mutex);

        let early = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || mutex.try_lock_until(100))
        };
        while mutex.queue_count() < 2 {
            thread::yield_now();
        }

        let (acquired, acquisition) = channel();
        let late = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || -> Result<(), AcquireError> {
                let token = mutex.try_lock_until(200)?;
                acquired.send(()).unwrap();
                unsafe { mutex.unlock(token) };
                Ok(())
            })
        };
        while mutex.queue_count() < 3 {
            thread::yield_now();
        }

        // Past the first deadline, before the second: the early waiter
        // abandons, the late one keeps spinning.
        FakeClock::set_now(150);
        assert_eq!(Some(AcquireError::TimedOut), early.join().unwrap().err());
        assert!(acquisition.recv_timeout(Duration::from_millis(100)).is_err());

        // Releasing hands the lock over the abandoned middle waiter.
        release.send(()).unwrap();
        holder.join().unwrap();
        acquisition.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(Ok(()), late.join().unwrap());
    }

    #[test]
    fn fifo_order_among_waiters() {
        let mutex = Arc::new(FakeMutex::<3>::new());
        let _timeline = FakeClock::reset();
        let (release, holder) = hold(&mutex);

        let (order, observed) = channel();
        let mut waiters = Vec::new();
        for id in 1..3 {
            let worker_mutex = Arc::clone(&mutex);
            let order = order.clone();
            waiters.push(thread::spawn(move || {
                let token = worker_mutex.lock().unwrap();
                order.send(id).unwrap();
                unsafe { worker_mutex.unlock(token) };
            }));
            // Sequence the enqueues so the line is 1 then 2.
            while mutex.queue_count() < 1 + id {
                thread::yield_now();
            }
        }

        release.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(1, observed.recv().unwrap());
        assert_eq!(2, observed.recv().unwrap());
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn timed_wait_elapses_on_the_steady_clock() {
        let mutex = Arc::new(Mutex::<2>::new());
        let (release, held_until) = channel();
        let (held, acquired) = channel();
        let holder = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let token = mutex.lock().unwrap();
                held.send(()).unwrap();
                held_until.recv().unwrap();
                unsafe { mutex.unlock(token) };
            })
        };
        acquired.recv().unwrap();

        let wait = Duration::from_millis(50);
        let start = std::time::Instant::now();
        assert_eq!(Some(AcquireError::TimedOut), mutex.try_lock_for(wait).err());
        assert!(start.elapsed() >= wait);

        release.send(()).unwrap();
        holder.join().unwrap();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::lock_join;
    use crate::relax::Yield;

    use super::{ClhMutex, Retry};

    #[test]
    fn serializes_increments() {
        lock_join::<ClhMutex<2, Retry, Yield>>();
    }
}
