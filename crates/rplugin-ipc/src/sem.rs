//! Process-shared POSIX semaphores. Two of these live inside the control
//! region (spec §6): one the client posts to wake the server, one the
//! server posts to wake the client, each waited on with a deadline so a
//! dead peer surfaces as `ConnectionLost` instead of a hang.

use std::mem::MaybeUninit;
use std::time::Duration;

use rplugin_core::{Error, Result, SEMAPHORE_TIMEOUT};

/// An unnamed, process-shared semaphore placed at a fixed offset inside
/// shared memory. Both processes construct a `Semaphore` wrapper over the
/// same `libc::sem_t` bytes; only the creator calls [`Semaphore::init`].
pub struct Semaphore {
    inner: *mut libc::sem_t,
}

// SAFETY: `sem_t` initialized with `pshared=1` is safe to share and operate
// on concurrently from multiple threads/processes by design.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Wraps an existing, already-`init`ed `sem_t` at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at a live `libc::sem_t` for the wrapper's lifetime.
    #[must_use]
    pub const unsafe fn from_raw(ptr: *mut libc::sem_t) -> Self {
        Self { inner: ptr }
    }

    /// Initializes a zeroed `sem_t` at `ptr` as process-shared with the
    /// given starting count.
    ///
    /// # Safety
    /// `ptr` must point to `size_of::<libc::sem_t>()` valid, writable bytes.
    pub unsafe fn init(ptr: *mut libc::sem_t, initial_value: u32) -> Result<()> {
        let rc = libc::sem_init(ptr, 1, initial_value);
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: `self.inner` is a live, initialized semaphore.
        let rc = unsafe { libc::sem_post(self.inner) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Waits up to `timeout` for the semaphore to be posted. Times out as
    /// `ConnectionLost` rather than any recoverable error, matching the
    /// upstream behavior of throwing on a 5-second deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = deadline_from_now(timeout)?;
        loop {
            // SAFETY: `self.inner` is live; `deadline` is a valid timespec.
            let rc = unsafe { libc::sem_timedwait(self.inner, &deadline) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Err(Error::ConnectionLost),
                _ => return Err(Error::Io(err)),
            }
        }
    }

    pub fn wait_default_timeout(&self) -> Result<()> {
        self.wait_timeout(SEMAPHORE_TIMEOUT)
    }

    /// Non-blocking check: `Ok(true)` if the semaphore was posted and has
    /// now been consumed, `Ok(false)` if nothing was pending. Used by the
    /// server's main loop to poll the ring without conflating "no traffic
    /// right now" with a dead peer.
    pub fn try_wait(&self) -> Result<bool> {
        // SAFETY: `self.inner` is a live, initialized semaphore.
        let rc = unsafe { libc::sem_trywait(self.inner) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(false),
            Some(libc::EINTR) => self.try_wait(),
            _ => Err(Error::Io(err)),
        }
    }
}

fn deadline_from_now(timeout: Duration) -> Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: `now` is a valid out-pointer for `clock_gettime`.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: just initialized above.
    let mut ts = unsafe { now.assume_init() };
    ts.tv_sec += timeout.as_secs() as libc::time_t;
    ts.tv_nsec += i64::from(timeout.subsec_nanos());
    if ts.tv_nsec >= 1_000_000_000 {
        ts.tv_sec += 1;
        ts.tv_nsec -= 1_000_000_000;
    }
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn post_then_wait_succeeds_immediately() {
        let mut raw = MaybeUninit::<libc::sem_t>::uninit();
        unsafe {
            Semaphore::init(raw.as_mut_ptr(), 0).unwrap();
        }
        let sem = unsafe { Semaphore::from_raw(raw.as_mut_ptr()) };
        sem.post().unwrap();
        sem.wait_timeout(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn wait_without_post_times_out_as_connection_lost() {
        let mut raw = MaybeUninit::<libc::sem_t>::uninit();
        unsafe {
            Semaphore::init(raw.as_mut_ptr(), 0).unwrap();
        }
        let sem = unsafe { Semaphore::from_raw(raw.as_mut_ptr()) };
        let err = sem.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::ConnectionLost));
    }
}
