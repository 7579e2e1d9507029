//! Machinery shared by the crate's unit tests.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::clock::Clock;
use crate::lock::RawLock;
use crate::resource::SharedResource;

/// Spawns `threads` incrementers doing `iters` guarded increments each
/// and returns the final value; lost updates show up as a shortfall.
pub(crate) fn lots_and_lots<L>(threads: usize, iters: u32) -> u32
where
    L: RawLock + Default + Send + Sync + 'static,
{
    let resource = Arc::new(SharedResource::<u32, L>::new());

    let (done, finished) = channel();
    for _ in 0..threads {
        let resource = Arc::clone(&resource);
        let done = done.clone();
        thread::spawn(move || {
            for _ in 0..iters {
                *resource.access().unwrap() += 1;
            }
            done.send(()).unwrap();
        });
    }
    drop(done);

    for _ in 0..threads {
        finished.recv().unwrap();
    }
    let total = *resource.access().unwrap();
    total
}

/// The timeline for [`FakeClock`], in arbitrary ticks.
static FAKE_NOW: AtomicU64 = AtomicU64::new(0);

/// Serializes the tests that travel through time, since they share one
/// timeline.
static TIMELINE: Mutex<()> = Mutex::new(());

/// A clock that only moves when told to.
///
/// Starts at tick zero; [`set_now`](Self::set_now) is the only way
/// forward. Lets deadline tests expire waiters deterministically instead
/// of sleeping.
pub(crate) struct FakeClock;

impl FakeClock {
    /// Claims exclusive use of the shared timeline and rewinds it to
    /// zero. Hold the guard for the duration of the test.
    pub(crate) fn reset() -> MutexGuard<'static, ()> {
        let timeline = TIMELINE.lock().unwrap_or_else(PoisonError::into_inner);
        FAKE_NOW.store(0, Release);
        timeline
    }

    /// Moves the clock to `now`.
    pub(crate) fn set_now(now: u64) {
        FAKE_NOW.store(now, Release);
    }
}

impl Clock for FakeClock {
    type Instant = u64;

    fn now() -> Self::Instant {
        FAKE_NOW.load(Acquire)
    }

    fn deadline_after(duration: Duration) -> Self::Instant {
        let ticks = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self::now().saturating_add(ticks)
    }
}
