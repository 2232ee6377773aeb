// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness notification for blocked strands.
//!
//! A thin wrapper over the OS event multiplexer (epoll on Linux, kqueue on
//! the BSDs and macOS). Registrations are one-shot: each fires at most once
//! and the strand re-registers if the retried I/O would still block, which
//! matches the block/retry loop in [`crate::io`]. Tokens are strand ids.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub(crate) use epoll::Reactor;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
    ))] {
        mod kqueue;
        pub(crate) use kqueue::Reactor;
    } else {
        compile_error!("no event multiplexer backend for this platform");
    }
}

/// Maximum number of wakeups a single [`Reactor::wait`] call delivers.
pub(crate) const EVENT_BATCH: usize = 32;

/// The direction a strand is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Readable,
    Writable,
}

/// A fired one-shot registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wakeup {
    /// Strand id the registration was keyed with.
    pub(crate) token: u64,
    pub(crate) readiness: Readiness,
}
