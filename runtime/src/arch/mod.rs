// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Register-level context switching.
//!
//! Everything above this module depends only on three things: the [`Context`]
//! type, [`init`] and [`swap`]. The per-architecture files define the
//! callee-saved register set as a `#[repr(C)]` struct whose field offsets are
//! mirrored by the hand-written save/restore sequence, so the struct layout is
//! pinned with `static_assertions` next to the assembly that relies on it.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        compile_error!("Unsupported target architecture");
    }
}

/// Required alignment of a machine stack, both at allocation and at every
/// suspension point.
pub const STACK_ALIGNMENT: usize = 16;

/// Entry point type a fresh [`Context`] begins executing at.
///
/// The scheduler only ever installs its trampoline here, which never returns;
/// that guarantee is what lets [`init`] get away without a return handler.
pub type EntryPoint = extern "C" fn();
