//! Counting semaphore over a futex word in shared memory.
//!
//! The word itself lives inside a shared mapping (the transport's control
//! block), so these are free functions over `&AtomicU32` rather than a type
//! owning its storage. `FUTEX_WAIT`/`FUTEX_WAKE` are used in their shared
//! (non-`PRIVATE`) form so waits cross process boundaries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Add one permit and wake one waiter if any.
pub fn post(word: &AtomicU32) {
    word.fetch_add(1, Ordering::SeqCst);
    // SAFETY: futex on a valid aligned u32; no pointers retained.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            1i32,
        );
    }
}

/// Take a permit without blocking. Returns false if none are available.
pub fn try_acquire(word: &AtomicU32) -> bool {
    let mut current = word.load(Ordering::SeqCst);
    while current > 0 {
        match word.compare_exchange_weak(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(seen) => current = seen,
        }
    }
    false
}

/// Block until a permit is available or `timeout` elapses. Returns false on
/// timeout.
pub fn acquire_timeout(word: &AtomicU32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if try_acquire(word) {
            return true;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        let left = deadline - now;
        let ts = libc::timespec {
            tv_sec: left.as_secs() as libc::time_t,
            tv_nsec: left.subsec_nanos() as libc::c_long,
        };
        // Sleep only while the count is still zero; a concurrent post makes
        // the syscall return EAGAIN immediately.
        // SAFETY: futex on a valid aligned u32; ts outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                0u32,
                &ts as *const libc::timespec,
            )
        };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                Some(libc::ETIMEDOUT) => return try_acquire(word),
                _ => {
                    tracing::warn!("futex wait failed: {err}");
                    return try_acquire(word);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn try_acquire_consumes_permits() {
        let word = AtomicU32::new(0);
        assert!(!try_acquire(&word));
        post(&word);
        post(&word);
        assert!(try_acquire(&word));
        assert!(try_acquire(&word));
        assert!(!try_acquire(&word));
    }

    #[test]
    fn timed_wait_times_out_without_permit() {
        let word = AtomicU32::new(0);
        let start = std::time::Instant::now();
        assert!(!acquire_timeout(&word, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn post_wakes_a_blocked_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || acquire_timeout(&word, Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        post(&word);
        assert!(waiter.join().unwrap());
        assert_eq!(word.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
