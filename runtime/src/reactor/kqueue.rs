// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{EVENT_BATCH, Readiness, Wakeup};
use core::ffi::c_void;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// kqueue-backed reactor.
///
/// `EV_ONESHOT` registrations delete themselves after firing, so every
/// re-registration is a plain `EV_ADD`.
pub(crate) struct Reactor {
    kqueue: OwnedFd,
    events: [libc::kevent; EVENT_BATCH],
    wakeups: [Wakeup; EVENT_BATCH],
}

impl Reactor {
    /// # Errors
    ///
    /// Fails if the kqueue cannot be created.
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: kqueue() returns a fresh descriptor or -1.
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // Safety: `fd` was just returned to us and is owned by no one
            // else.
            kqueue: unsafe { OwnedFd::from_raw_fd(fd) },
            // Safety: kevent is plain data, all-zeroes is valid.
            events: unsafe { std::mem::zeroed() },
            wakeups: [Wakeup {
                token: 0,
                readiness: Readiness::Readable,
            }; EVENT_BATCH],
        })
    }

    /// Arm a one-shot read-readiness subscription for `fd`, waking `token`.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the registration.
    pub(crate) fn register_read(&mut self, fd: RawFd, token: u64) -> io::Result<()> {
        self.register(fd, token, Readiness::Readable)
    }

    /// Arm a one-shot write-readiness subscription for `fd`, waking `token`.
    ///
    /// # Errors
    ///
    /// Fails if the kernel rejects the registration.
    pub(crate) fn register_write(&mut self, fd: RawFd, token: u64) -> io::Result<()> {
        self.register(fd, token, Readiness::Writable)
    }

    fn register(&mut self, fd: RawFd, token: u64, readiness: Readiness) -> io::Result<()> {
        let filter = match readiness {
            Readiness::Readable => libc::EVFILT_READ,
            Readiness::Writable => libc::EVFILT_WRITE,
        };
        let change = libc::kevent {
            ident: fd as usize,
            filter,
            flags: libc::EV_ADD | libc::EV_ONESHOT,
            fflags: 0,
            data: 0,
            udata: token as *mut c_void,
        };

        tracing::trace!(fd, token, ?readiness, "registering with reactor");

        // Safety: one change entry, no event buffer, kqueue copies the
        // change before returning.
        let ret = unsafe {
            libc::kevent(
                self.kqueue.as_raw_fd(),
                &change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Block until at least one subscription fires; returns at most
    /// [`EVENT_BATCH`] wakeups. Retries on `EINTR`.
    ///
    /// # Errors
    ///
    /// Fails if `kevent` fails with anything but `EINTR`.
    pub(crate) fn wait(&mut self) -> io::Result<&[Wakeup]> {
        loop {
            // Safety: the events buffer is valid for EVENT_BATCH entries.
            let n = unsafe {
                libc::kevent(
                    self.kqueue.as_raw_fd(),
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    EVENT_BATCH as i32,
                    ptr::null(),
                )
            };
            if n >= 0 {
                let n = n as usize;
                for i in 0..n {
                    let event = self.events[i];
                    let readiness = if event.filter == libc::EVFILT_WRITE {
                        Readiness::Writable
                    } else {
                        Readiness::Readable
                    };
                    self.wakeups[i] = Wakeup {
                        token: event.udata as u64,
                        readiness,
                    };
                }
                tracing::trace!(count = n, "reactor delivered wakeups");
                return Ok(&self.wakeups[..n]);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
