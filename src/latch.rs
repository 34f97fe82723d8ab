use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

/// A page-level reader-writer latch with manually paired acquire/release.
///
/// Latch crabbing holds latches across call frames, which rules out
/// guard-based locking for the descent path; the raw lock API keeps the
/// acquire and release sites explicit instead.
pub struct Latch {
    lock: RawRwLock,
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").finish()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            lock: RawRwLock::INIT,
        }
    }

    pub fn rlock(&self) {
        self.lock.lock_shared();
    }

    pub fn runlock(&self) {
        unsafe { self.lock.unlock_shared() };
    }

    pub fn wlock(&self) {
        self.lock.lock_exclusive();
    }

    pub fn wunlock(&self) {
        unsafe { self.lock.unlock_exclusive() };
    }

    pub fn try_wlock(&self) -> bool {
        self.lock.try_lock_exclusive()
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_shared() {
        let latch = Latch::new();
        latch.wlock();
        assert!(latch.is_locked());
        assert!(!latch.try_wlock());
        latch.wunlock();
        assert!(!latch.is_locked());

        latch.rlock();
        assert!(!latch.try_wlock());
        latch.runlock();
        assert!(latch.try_wlock());
        latch.wunlock();
    }
}
