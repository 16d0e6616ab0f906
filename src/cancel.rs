//! Cancellation token with an OS-level wake channel
//!
//! The flag is sampled by the state machine driver at the top of every
//! iteration. The pipe lets a thread blocked in `poll` on the transport be
//! woken from another thread (or a signal handler thread) the moment
//! `cancel` is called.

use crate::error::StreamError;
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    cancelled: AtomicBool,
    // Serializes cancel/reset so the pipe holds at most one wake byte
    wake_lock: Mutex<()>,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

/// Cheap to clone; all clones share one flag.
#[derive(Clone)]
pub struct Cancellable {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .field("fd", &self.fd())
            .finish()
    }
}

fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
    }
    // SAFETY: both descriptors were just returned by pipe and are owned by nobody else
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read_end, write_end))
}

impl Cancellable {
    pub fn new() -> io::Result<Self> {
        let (read_end, write_end) = wake_pipe()?;
        Ok(Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                read_end,
                write_end,
            }),
        })
    }

    /// Request cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        let _guard = self.inner.wake_lock.lock();
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let byte = [b'x'];
        // A full pipe already means "readable"; nothing else to do on failure
        unsafe {
            libc::write(
                self.inner.write_end.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag and drain the wake pipe so the token can be reused.
    pub fn reset(&self) {
        let _guard = self.inner.wake_lock.lock();
        if !self.inner.cancelled.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.inner.read_end.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Descriptor that becomes readable once `cancel` has been called.
    pub fn fd(&self) -> RawFd {
        self.inner.read_end.as_raw_fd()
    }

    /// `Err(Cancelled)` if cancellation was requested
    pub fn check(&self) -> Result<(), StreamError> {
        if self.is_cancelled() {
            Err(StreamError::Cancelled)
        } else {
            Ok(())
        }
    }
}
