//! Fair, bounded, queue-based mutual exclusion primitives, plus a wrapper
//! that couples a value with one of them.
//!
//! Two lock algorithms are provided. Both are strictly FIFO, both spin on
//! locally-accessible, cache-line-isolated state, and both run in constant
//! space fixed at construction:
//!
//! - [`ArrayMutex`]: a ticket lock over a ring of `N` padded slots. Each
//!   acquirer draws a ticket and spins on its own slot. Constant-time
//!   acquire and release, no queue bookkeeping, but more than `N`
//!   simultaneous acquirers is detected and reported as an error rather
//!   than tolerated.
//! - [`ClhMutex`]: a Craig-Landin-Hagersten queue lock drawing its queue
//!   nodes from a fixed pool, generalized with deadline-based acquisition.
//!   A waiter whose deadline expires abandons the wait in a way that lets
//!   its successor inherit its place in line, so FIFO order is preserved
//!   among the waiters that remain.
//!
//! [`SharedResource`] composes a value with any lock implementing the
//! [`RawLock`] contract and hands out RAII [`Access`] guards, so the value
//! can only be reached while the lock is held.
//!
//! # Spinning
//!
//! These are spinlocks: waiting burns a core. That is the right trade only
//! when critical sections are very short and the number of waiters is
//! bounded, which is exactly the regime the fixed pools assume. For
//! general-purpose locking prefer an OS-backed mutex that parks waiting
//! threads. The behaviour while spinning is chosen by a [`relax`] policy
//! type parameter.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use exclusive::{ArrayMutex, SharedResource};
//!
//! const THREADS: usize = 4;
//!
//! let counter = Arc::new(SharedResource::<u32, ArrayMutex<4>>::new());
//!
//! let handles: Vec<_> = (0..THREADS)
//!     .map(|_| {
//!         let counter = Arc::clone(&counter);
//!         thread::spawn(move || {
//!             for _ in 0..100 {
//!                 *counter.access().unwrap() += 1;
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(400, *counter.access().unwrap());
//! ```

#![warn(missing_docs)]
#![warn(rust_2021_compatibility)]
#![allow(clippy::module_name_repetitions)]

pub mod array;
pub mod clh;
pub mod clock;
pub mod lock;
pub mod relax;
pub mod resource;

pub(crate) mod cfg;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
pub(crate) mod loom;

pub use array::{ArrayMutex, ArrayToken};
pub use clh::{ClhMutex, ClhToken, Die, ExhaustionPolicy, Retry};
pub use clock::{Clock, Steady};
pub use lock::{AcquireError, RawLock, RawTimedLock};
pub use resource::{Access, SharedResource};
