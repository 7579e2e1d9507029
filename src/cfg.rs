//! Switches the lock internals between the `core`/`std` primitives and
//! their Loom-instrumented counterparts when building test runs with
//! `--cfg loom`.

pub(crate) mod atomic {
    #[cfg(all(loom, test))]
    pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

    #[cfg(not(all(loom, test)))]
    pub(crate) use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
}

pub(crate) mod hint {
    #[cfg(all(loom, test))]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(all(loom, test)))]
    pub(crate) use core::hint::spin_loop;
}

pub(crate) mod thread {
    #[cfg(all(loom, test))]
    pub(crate) use loom::thread::yield_now;

    #[cfg(not(all(loom, test)))]
    pub(crate) use std::thread::yield_now;
}
