//! Mutex and counting-semaphore APIs.
//!
//! The kernel is written against these traits so it does not commit to a
//! concrete blocking implementation. A bare-metal port supplies primitives
//! built on its scheduler; hosts and tests enable the `std` feature and use
//! the [`std::sync`]-backed types from this crate.

#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

/// A counting semaphore.
///
/// `down` blocks the calling thread while the count is zero; `up`
/// increments the count and wakes one blocked `down`.
pub trait Semaphore {
    /// Creates a semaphore with an initial count of `permits`.
    fn new(permits: usize) -> Self;

    /// Decrements the count, blocking until it is positive.
    fn down(&self);

    /// Increments the count.
    fn up(&self);
}

/// The bundle of primitives a kernel instance is parameterized over.
///
/// The `Send`/`Sync` bounds are part of the contract: process records and
/// subsystem locks built from these types are shared across threads.
pub trait SyncPrimitives: 'static {
    type Mutex<T>: Mutex<Data = T> + Send + Sync
    where
        T: Send;
    type Semaphore: Semaphore + Send + Sync;
}

#[cfg(feature = "std")]
mod std_impl {
    use core::ops::{Deref, DerefMut};

    use super::{Mutex, Semaphore, SyncPrimitives};

    /// [`std::sync::Mutex`] behind the [`Mutex`] trait.
    ///
    /// Lock poisoning is ignored: a panic while holding a kernel lock is
    /// fatal to the test anyway.
    pub struct StdMutex<T>(std::sync::Mutex<T>);

    pub struct StdMutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

    impl<T> Mutex for StdMutex<T> {
        type Data = T;

        type Guard<'a>
            = StdMutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            StdMutexGuard(self.0.lock().unwrap_or_else(|e| e.into_inner()))
        }
    }

    impl<T> Deref for StdMutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.0
        }
    }

    impl<T> DerefMut for StdMutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.0
        }
    }

    /// A counting semaphore built from a mutex and a condition variable.
    pub struct StdSemaphore {
        permits: std::sync::Mutex<usize>,
        available: std::sync::Condvar,
    }

    impl Semaphore for StdSemaphore {
        fn new(permits: usize) -> Self {
            Self {
                permits: std::sync::Mutex::new(permits),
                available: std::sync::Condvar::new(),
            }
        }

        fn down(&self) {
            let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
            while *permits == 0 {
                permits = self
                    .available
                    .wait(permits)
                    .unwrap_or_else(|e| e.into_inner());
            }
            *permits -= 1;
        }

        fn up(&self) {
            let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
            *permits += 1;
            self.available.notify_one();
        }
    }

    /// The `std`-backed primitive bundle.
    pub struct StdSync;

    impl SyncPrimitives for StdSync {
        type Mutex<T>
            = StdMutex<T>
        where
            T: Send;
        type Semaphore = StdSemaphore;
    }
}

#[cfg(feature = "std")]
pub use self::std_impl::{StdMutex, StdMutexGuard, StdSemaphore, StdSync};

#[cfg(all(test, feature = "std"))]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn mutex_round_trip() {
        let m = StdMutex::new(41);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn semaphore_hands_over_permit() {
        let sema = Arc::new(StdSemaphore::new(0));
        let waiter = {
            let sema = Arc::clone(&sema);
            thread::spawn(move || sema.down())
        };
        sema.up();
        waiter.join().unwrap();
    }

    #[test]
    fn semaphore_counts_permits() {
        let sema = StdSemaphore::new(2);
        sema.down();
        sema.down();
        sema.up();
        sema.down();
    }
}
