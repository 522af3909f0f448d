//! Recursive mutex with timed acquisition
//!
//! Locks guard the allocation table, each ATE, and the process-wide engine.
//! They must be recursive: the fault handler can run on a thread that
//! already holds the lock it needs, for example when `swap_in` touches a
//! flag-vector page it has just unprotected. Acquisition first tries a
//! 10-second timed lock; expiry is treated as a diagnostic, not an error,
//! and falls back to an indefinite wait.
//!
//! With the `threads` feature disabled the library is single-threaded and
//! every operation here is a no-op.

#[cfg(feature = "threads")]
use core::cell::UnsafeCell;
#[cfg(feature = "threads")]
use core::mem;

#[cfg(feature = "threads")]
use nix::errno::Errno;

use crate::error::Result;
#[cfg(feature = "threads")]
use crate::error::Error;

/// How long a timed acquisition waits before reporting a suspected
/// deadlock and retrying indefinitely.
#[cfg(feature = "threads")]
const TIMEOUT_SECS: libc::time_t = 10;

/// A recursive mutex.
///
/// The structure is `#[repr(C)]` so it can live inside the header pages of
/// an anonymous mapping alongside the rest of the ATE.
#[repr(C)]
pub struct Lock {
    #[cfg(feature = "threads")]
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

#[cfg(feature = "threads")]
impl Lock {
    /// Create an initialized lock.
    pub fn new() -> Result<Self> {
        let lock = Lock {
            mutex: UnsafeCell::new(unsafe { mem::zeroed() }),
        };
        unsafe { init_mutex(lock.mutex.get())? };
        Ok(lock)
    }

    /// Initialize the lock at `slot` in place.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and must not hold an initialized
    /// lock.
    pub unsafe fn init_at(slot: *mut Lock) -> Result<()> {
        init_mutex((*slot).mutex.get())
    }

    /// Acquire the lock, reporting after [`TIMEOUT_SECS`] if it cannot be
    /// had and then waiting indefinitely.
    pub fn acquire(&self) -> Result<()> {
        unsafe {
            let mut ts: libc::timespec = mem::zeroed();
            if libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) == -1 {
                return Err(Error::Lock(Errno::last()));
            }
            ts.tv_sec += TIMEOUT_SECS;

            match libc::pthread_mutex_timedlock(self.mutex.get(), &ts) {
                0 => Ok(()),
                libc::ETIMEDOUT => {
                    diagnose();
                    match libc::pthread_mutex_lock(self.mutex.get()) {
                        0 => Ok(()),
                        err => Err(Error::Lock(Errno::from_raw(err))),
                    }
                }
                err => Err(Error::Lock(Errno::from_raw(err))),
            }
        }
    }

    /// Release the lock.
    pub fn release(&self) -> Result<()> {
        match unsafe { libc::pthread_mutex_unlock(self.mutex.get()) } {
            0 => Ok(()),
            err => Err(Error::Lock(Errno::from_raw(err))),
        }
    }

    /// Destroy the lock. It must not be held.
    pub fn destroy(&self) -> Result<()> {
        match unsafe { libc::pthread_mutex_destroy(self.mutex.get()) } {
            0 => Ok(()),
            err => Err(Error::Lock(Errno::from_raw(err))),
        }
    }
}

#[cfg(not(feature = "threads"))]
impl Lock {
    pub fn new() -> Result<Self> {
        Ok(Lock {})
    }

    /// # Safety
    ///
    /// `slot` must be valid for writes.
    pub unsafe fn init_at(slot: *mut Lock) -> Result<()> {
        slot.write(Lock {});
        Ok(())
    }

    pub fn acquire(&self) -> Result<()> {
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "threads")]
unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr: libc::pthread_mutexattr_t = mem::zeroed();

    let ret = libc::pthread_mutexattr_init(&mut attr);
    if ret != 0 {
        return Err(Error::Lock(Errno::from_raw(ret)));
    }
    let ret = libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_RECURSIVE);
    if ret != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(Error::Lock(Errno::from_raw(ret)));
    }
    let ret = libc::pthread_mutex_init(mutex, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if ret != 0 {
        return Err(Error::Lock(Errno::from_raw(ret)));
    }

    Ok(())
}

/// Write the suspected-deadlock report. Only `write(2)` here: this path can
/// run inside a signal handler.
#[cfg(feature = "threads")]
fn diagnose() {
    #[cfg(feature = "deadlock-diagnostics")]
    {
        let msg = b"sbma: lock acquisition timed out, waiting indefinitely\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn acquire_release() {
        let lock = Lock::new().unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();
        lock.destroy().unwrap();
    }

    #[test]
    fn reentrant_acquire() {
        let lock = Lock::new().unwrap();
        lock.acquire().unwrap();
        lock.acquire().unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        lock.destroy().unwrap();
    }

    #[test]
    #[cfg(feature = "threads")]
    fn excludes_across_threads() {
        let lock = Arc::new(Lock::new().unwrap());
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lock.acquire().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.release().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
