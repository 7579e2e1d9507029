//! Loom models exercising the locks across all tracked interleavings.

use loom::cell::UnsafeCell;
use loom::sync::Arc;
use loom::{model, thread};

use crate::lock::RawLock;

const THREADS: usize = 2;

/// Checks that concurrent acquisitions serialize their critical
/// sections: every increment lands and Loom observes no race on the
/// shared cell.
pub(crate) fn lock_join<L>()
where
    L: RawLock + Default + Send + Sync + 'static,
{
    model(|| {
        let lock = Arc::new(L::default());
        let data = Arc::new(UnsafeCell::new(0usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let token = lock.lock().expect("the pool covers every thread");
                    // SAFETY: the token proves exclusive ownership.
                    data.with_mut(|value| unsafe { *value += 1 });
                    // SAFETY: the token came from this lock, used once.
                    unsafe { lock.unlock(token) };
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // SAFETY: all writers joined; this is the only remaining access.
        let total = data.with(|value| unsafe { *value });
        assert_eq!(THREADS, total);
    });
}
