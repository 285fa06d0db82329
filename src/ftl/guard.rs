//! Exclusive hardware access around physical write sequences.
//!
//! On targets where interrupt handlers may also touch flash, each block's read-modify-write
//! sequence must not be interleaved with theirs. Implementors decide what "exclusive" means
//! (masking interrupts, taking a lock); [NoGuard] is for platforms without the hazard.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Something that can grant exclusive access to the flash hardware for a scope
pub trait ExclusiveAccess {
    /// Held for the duration of one block's physical sequence; dropping it releases access
    type Guard<'a>
    where
        Self: 'a;

    fn acquire(&self) -> Self::Guard<'_>;
}

/// Exclusive access that costs nothing, for platforms where nothing else touches flash
#[derive(Debug, Default, Copy, Clone)]
pub struct NoGuard;

impl ExclusiveAccess for NoGuard {
    type Guard<'a> = ();

    fn acquire(&self) {}
}

/// For hosted platforms where another thread stands in for interrupt context
impl ExclusiveAccess for Mutex<()> {
    type Guard<'a> = MutexGuard<'a, ()>;

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // The unit payload can't be left inconsistent, so poisoning is irrelevant
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use std::cell::Cell;
    use std::rc::Rc;

    /// Tracks how deeply the guard is currently held, and how often it was taken
    #[derive(Debug, Default, Clone)]
    pub struct DepthGuard {
        pub depth: Rc<Cell<u32>>,
        pub acquired: Rc<Cell<u32>>,
    }

    pub struct DepthToken<'a>(&'a DepthGuard);

    impl Drop for DepthToken<'_> {
        fn drop(&mut self) {
            self.0.depth.set(self.0.depth.get() - 1);
        }
    }

    impl ExclusiveAccess for DepthGuard {
        type Guard<'a> = DepthToken<'a>;

        fn acquire(&self) -> DepthToken<'_> {
            self.depth.set(self.depth.get() + 1);
            self.acquired.set(self.acquired.get() + 1);
            DepthToken(self)
        }
    }

    #[test]
    fn test_depth_guard() {
        let guard = DepthGuard::default();
        {
            let _outer = guard.acquire();
            assert_eq!(guard.depth.get(), 1);
        }
        assert_eq!(guard.depth.get(), 0);
        assert_eq!(guard.acquired.get(), 1);
    }

    #[test]
    fn test_mutex_guard() {
        let lock = Mutex::new(());
        {
            let _held = lock.acquire();
            assert!(lock.try_lock().is_err());
        }
        assert!(lock.try_lock().is_ok());
    }
}
