// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Copying stack growth.
//!
//! Both growth paths funnel through [`grow_to`]: the checkpoint path feeds it
//! the stack/frame pointers saved in the suspended [`Context`] and writes the
//! translated values back there, while the SIGSEGV path feeds it the live
//! registers of the interrupted `ucontext_t`. The function itself therefore
//! stays strictly async-signal-safe: no tracing, no heap, only
//! `mmap`/`munmap` through [`StrandStack`].

use super::{GROWTH_TRIGGER_PERCENT, MAX_STACK_SIZE, MIN_FREE_STACK, StrandStack};
use crate::arch::Context;
use crate::segv::raw_stderr;
use std::ptr;

/// Upper bound on the number of frame records patched after a copy. A chain
/// deeper than this at a growth point means the proactive heuristic has
/// already failed badly enough that continuing to patch is not worth it.
const MAX_FIXUP_FRAMES: usize = 64;

/// Register values translated into the new stack by [`grow_to`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Translated {
    pub sp: usize,
    pub fp: usize,
}

/// Checkpoint run by the dispatch loop right before resuming a strand: grows
/// the stack when free space runs low or usage crosses the trigger
/// percentage, updating the suspended context in place.
///
/// Returns whether the stack was grown.
pub(crate) fn check_and_grow(stack: &mut StrandStack, ctx: &mut Context) -> bool {
    let sp = ctx.stack_pointer();
    let used = stack.used(sp);
    let free = stack.free(sp);

    if free >= MIN_FREE_STACK && used * 100 <= stack.usable_size() * GROWTH_TRIGGER_PERCENT {
        return false;
    }
    if stack.usable_size() >= MAX_STACK_SIZE {
        // Already at the ceiling; the strand keeps running until it either
        // stays within what it has or trips the guard page.
        return false;
    }

    let target = (stack.usable_size() * 2)
        .max(used + MIN_FREE_STACK)
        .min(MAX_STACK_SIZE);

    // Safety: the strand owning this stack is suspended, so the used span is
    // stable and the saved registers are the only live references into it.
    match unsafe { grow_to(stack, sp, ctx.frame_pointer(), target, false) } {
        Some(translated) => {
            ctx.set_stack_pointer(translated.sp);
            ctx.set_frame_pointer(translated.fp);
            tracing::debug!(
                usable_size = stack.usable_size(),
                growth_count = stack.growth_count(),
                "grew strand stack at checkpoint"
            );
            true
        }
        None => {
            tracing::warn!(
                usable_size = stack.usable_size(),
                "strand stack growth failed at checkpoint"
            );
            false
        }
    }
}

/// Replace `stack` with a mapping of `new_size` usable bytes, copying the
/// used span and translating `sp`/`fp` into it.
///
/// Returns `None` without touching the stack when the request is invalid
/// (not larger than the current size, above [`MAX_STACK_SIZE`]) or when the
/// new mapping cannot be allocated.
///
/// In signal mode `used` may exceed the usable size by up to the guard page
/// (that overflow is the very fault being recovered); outside of it, a stack
/// pointer outside the stack is unrecoverable corruption and aborts the
/// process, since continuing would be undefined.
///
/// # Safety
///
/// The strand owning `stack` must be suspended (or stopped inside the signal
/// handler), with `sp`/`fp` taken from its saved or interrupted register
/// state.
pub(crate) unsafe fn grow_to(
    stack: &mut StrandStack,
    sp: usize,
    fp: usize,
    new_size: usize,
    in_signal_handler: bool,
) -> Option<Translated> {
    let old_usable = stack.usable_size();
    if new_size <= old_usable || new_size > MAX_STACK_SIZE {
        return None;
    }

    let old_top = stack.top();
    let old_base = stack.usable_base();

    let used = match old_top.checked_sub(sp) {
        Some(used) => used,
        None => {
            if in_signal_handler {
                return None;
            }
            corruption_abort();
        }
    };
    if used > old_usable {
        if !in_signal_handler {
            corruption_abort();
        }
        if used > old_usable + stack.guard_size() {
            // A fault this far below the stack is not an overflow.
            return None;
        }
    }

    let new_stack = StrandStack::new(new_size).ok()?;
    let new_top = new_stack.top();
    let new_sp = new_top - used;

    // Copy only the mapped span; anything below the old usable base was never
    // written (accessing it is what trapped).
    let copy_len = used.min(old_usable);
    // Safety: source and destination spans are both mapped, and the mappings
    // are distinct.
    unsafe {
        ptr::copy_nonoverlapping(
            (old_top - copy_len) as *const u8,
            (new_top - copy_len) as *mut u8,
            copy_len,
        );
    }

    let delta = new_top.wrapping_sub(old_top);

    // The frame pointer keeps its distance from the top; anything not
    // pointing into the old stack is left alone.
    let new_fp = if fp >= old_base && fp <= old_top {
        fp.wrapping_add(delta)
    } else {
        fp
    };

    // Safety: the chain walk stays within the freshly copied span.
    unsafe {
        fixup_frame_links(new_fp, new_stack.usable_base(), new_top, delta);
    }

    stack.adopt(new_stack);

    Some(Translated {
        sp: new_sp,
        fp: new_fp,
    })
}

/// Rewrite the saved previous-frame-pointer slots along the frame chain of a
/// freshly copied stack so they point into the new mapping.
///
/// Frame records follow the standard ABI shape on both supported
/// architectures (`[fp]` = previous frame pointer, `[fp + 8]` = return
/// address). Return addresses are code pointers and are left untouched. The
/// walk stops on a null link, a misaligned or out-of-region candidate, a
/// non-monotonic chain, or after [`MAX_FIXUP_FRAMES`] records.
///
/// # Safety
///
/// `lo..hi` must be the usable span of the new mapping and `fp` the already
/// translated innermost frame pointer.
unsafe fn fixup_frame_links(mut fp: usize, lo: usize, hi: usize, delta: usize) {
    let word = size_of::<usize>();
    for _ in 0..MAX_FIXUP_FRAMES {
        if fp == 0 || fp % word != 0 || fp < lo || fp + 2 * word > hi {
            break;
        }
        // Safety: `fp` was just verified to lie within the copied span.
        let slot = fp as *mut usize;
        let prev = unsafe { slot.read() };
        if prev == 0 {
            break;
        }
        let rebased = prev.wrapping_add(delta);
        // The previous frame must live strictly above this one, inside the
        // new span; anything else means the chain has left the stack.
        if rebased <= fp || rebased < lo || rebased > hi {
            break;
        }
        // Safety: same in-bounds slot as the read above.
        unsafe {
            slot.write(rebased);
        }
        if rebased + 2 * word > hi {
            // Chain root sitting at the very top of the stack; done.
            break;
        }
        fp = rebased;
    }
}

fn corruption_abort() -> ! {
    raw_stderr(b"weft-runtime: strand stack pointer is outside its stack, aborting\n");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::INITIAL_STACK_SIZE;

    #[test]
    fn rejects_non_growth_and_oversize() {
        let mut stack = StrandStack::new(INITIAL_STACK_SIZE).unwrap();
        let usable = stack.usable_size();
        let base = stack.base();
        let sp = stack.top();

        // Safety: synthetic in-range registers, no strand involved.
        unsafe {
            assert!(grow_to(&mut stack, sp, 0, usable, false).is_none());
            assert!(grow_to(&mut stack, sp, 0, usable / 2, false).is_none());
            assert!(grow_to(&mut stack, sp, 0, usize::MAX - 1000, false).is_none());
        }

        // Rejection must leave the mapping untouched.
        assert_eq!(stack.base(), base);
        assert_eq!(stack.usable_size(), usable);
        assert_eq!(stack.growth_count(), 0);
    }

    #[test]
    fn growth_preserves_contents_and_sp_distance() {
        let mut stack = StrandStack::new(INITIAL_STACK_SIZE).unwrap();
        let old_top = stack.top();
        let used = 256usize;
        let sp = old_top - used;

        // Safety: the span below the top was just mapped read/write.
        unsafe {
            for i in 0..used {
                ((sp + i) as *mut u8).write((i % 251) as u8);
            }
        }

        let target = stack.usable_size() * 2;
        // Safety: synthetic registers pointing into the span written above.
        let translated = unsafe { grow_to(&mut stack, sp, 0, target, false) }.unwrap();

        let new_top = stack.top();
        assert_eq!(new_top - translated.sp, used);
        assert_eq!(stack.growth_count(), 1);
        assert!(stack.usable_size() >= target);

        // Safety: translated span lies within the new mapping.
        unsafe {
            for i in 0..used {
                assert_eq!(((translated.sp + i) as *const u8).read(), (i % 251) as u8);
            }
        }
    }

    #[test]
    fn growth_rebases_frame_links() {
        let mut stack = StrandStack::new(INITIAL_STACK_SIZE).unwrap();
        let old_top = stack.top();

        // Fabricate a two-record frame chain: inner frame at top-64 linking
        // to an outer frame at top-16 whose link is null (chain root).
        let outer = old_top - 16;
        let inner = old_top - 64;
        let sp = old_top - 128;
        // Safety: all slots lie in the mapped usable span.
        unsafe {
            (outer as *mut usize).write(0);
            ((outer + 8) as *mut usize).write(0x1111);
            (inner as *mut usize).write(outer);
            ((inner + 8) as *mut usize).write(0x2222);
        }

        let target = stack.usable_size() * 2;
        // Safety: synthetic registers matching the fabricated frames.
        let translated = unsafe { grow_to(&mut stack, sp, inner, target, false) }.unwrap();

        let new_top = stack.top();
        assert_eq!(translated.fp, new_top - 64);
        // Safety: translated frame slots lie in the new mapping.
        unsafe {
            // Inner link now points at the relocated outer frame...
            assert_eq!((translated.fp as *const usize).read(), new_top - 16);
            // ...whose link is still the null chain root, and the return
            // addresses (code pointers) were not rebased.
            assert_eq!(((new_top - 16) as *const usize).read(), 0);
            assert_eq!(((new_top - 16 + 8) as *const usize).read(), 0x1111);
            assert_eq!(((translated.fp + 8) as *const usize).read(), 0x2222);
        }
    }
}
