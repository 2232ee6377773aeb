// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{EVENT_BATCH, Readiness, Wakeup};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// epoll-backed reactor.
///
/// One-shot is `EPOLLONESHOT | EPOLLET`: after a registration fires, epoll
/// keeps the descriptor but disarms it, so re-registration must fall back to
/// `EPOLL_CTL_MOD` when `EPOLL_CTL_ADD` reports `EEXIST`.
pub(crate) struct Reactor {
    epoll: OwnedFd,
    events: [libc::epoll_event; EVENT_BATCH],
    wakeups: [Wakeup; EVENT_BATCH],
}

impl Reactor {
    /// # Errors
    ///
    /// Fails if the epoll instance cannot be created.
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: epoll_create1 returns a fresh descriptor or -1.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // Safety: `fd` was just returned to us and is owned by no one
            // else.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            // Safety: epoll_event is plain data, all-zeroes is valid.
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
        let interest = match readiness {
            Readiness::Readable => libc::EPOLLIN,
            Readiness::Writable => libc::EPOLLOUT,
        };
        let mut event = libc::epoll_event {
            events: (interest | libc::EPOLLET | libc::EPOLLONESHOT) as u32,
            u64: token,
        };

        tracing::trace!(fd, token, ?readiness, "registering with reactor");

        // Safety: `event` outlives the call; epoll copies it.
        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }

        // Already known from an earlier one-shot; re-arm it.
        // Safety: as above.
        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)
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
    /// Fails if `epoll_wait` fails with anything but `EINTR`.
    pub(crate) fn wait(&mut self) -> io::Result<&[Wakeup]> {
        loop {
            // Safety: the events buffer is valid for EVENT_BATCH entries.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    EVENT_BATCH as i32,
                    -1,
                )
            };
            if n >= 0 {
                let n = n as usize;
                for i in 0..n {
                    let event = self.events[i];
                    let readiness = if event.events & (libc::EPOLLOUT as u32) != 0 {
                        Readiness::Writable
                    } else {
                        Readiness::Readable
                    };
                    self.wakeups[i] = Wakeup {
                        token: event.u64,
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
