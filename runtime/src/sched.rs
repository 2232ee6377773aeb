// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cooperative scheduler.
//!
//! Exactly one strand executes at any time, and control only changes hands
//! at the three suspension points ([`strand_yield`], [`strand_block_on_read`]
//! and [`strand_block_on_write`]) plus strand completion. That makes every
//! mutation of scheduler state between suspension points atomic from the
//! perspective of other strands, which is why none of this needs locks.
//!
//! The scheduler is process-wide state published through an [`AtomicPtr`] so
//! the SIGSEGV handler can find the currently running strand. The handler is
//! the only asynchronous reader and it only consults the current-strand
//! pointer, which is stable for the whole execution slice of that strand.
//!
//! ## Dispatch
//!
//! [`scheduler_run`] pops a strand off the ready queue, samples its stack
//! usage for proactive growth (the *checkpoint*), and swaps into its saved
//! context. The strand runs until it yields, blocks or completes, each of
//! which swaps back here with the strand's state telling the loop what
//! happened. When nothing is ready but strands are parked on I/O, the loop
//! waits on the reactor; when no strands exist at all, it returns the main
//! strand's final value stack.

use crate::arch::{self, Context};
use crate::cell::{self, ValueStack};
use crate::cleanup::{CleanupFn, CleanupStack};
use crate::queue::{BlockedList, ReadyQueue};
use crate::reactor::{Reactor, Readiness};
use crate::segv::{self, AltStack};
use crate::stack::{self, INITIAL_STACK_SIZE, StrandStack};
use core::ffi::c_void;
use core::ptr::NonNull;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// The strand whose final value stack is the runtime's result. Identifiers
/// start here, so the first spawn creates the main strand.
pub const MAIN_STRAND_ID: u64 = 1;

/// A strand entry function: receives the strand's initial value stack and
/// returns the final one.
pub type StrandEntry = extern "C" fn(ValueStack) -> ValueStack;

/// Lifecycle states of a strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandState {
    /// In the ready queue, waiting to be dispatched.
    Ready,
    /// Currently executing.
    Running,
    /// Gave up the CPU voluntarily; already re-queued.
    Yielded,
    /// Parked until its descriptor becomes readable.
    BlockedRead,
    /// Parked until its descriptor becomes writable.
    BlockedWrite,
    /// Entry function returned; awaiting teardown.
    Completed,
}

/// A unit of cooperative concurrency: one machine stack, one saved register
/// context, one opaque value stack.
pub(crate) struct Strand {
    pub(crate) id: u64,
    pub(crate) state: StrandState,
    pub(crate) ctx: Context,
    pub(crate) stack: StrandStack,
    pub(crate) entry: StrandEntry,
    pub(crate) value_stack: ValueStack,
    pub(crate) cleanups: CleanupStack,
    pub(crate) blocked_fd: Option<RawFd>,
    /// Intrusive link for the ready queue / blocked list.
    pub(crate) next: Option<NonNull<Strand>>,
}

impl Strand {
    /// Allocate a strand with a fresh machine stack, its context primed to
    /// enter the trampoline.
    pub(crate) fn new(id: u64, entry: StrandEntry, value_stack: ValueStack) -> io::Result<Box<Self>> {
        let stack = StrandStack::new(INITIAL_STACK_SIZE)?;
        let mut strand = Box::new(Self {
            id,
            state: StrandState::Ready,
            ctx: Context::new(),
            stack,
            entry,
            value_stack,
            cleanups: CleanupStack::new(),
            blocked_fd: None,
            next: None,
        });
        // Safety: the span is a freshly mapped stack exclusively owned by
        // this strand; the stack manager keeps the context consistent across
        // growth.
        unsafe {
            arch::init(
                &mut strand.ctx,
                strand.stack.usable_base() as *mut u8,
                strand.stack.usable_size(),
                strand_trampoline,
            );
        }
        Ok(strand)
    }
}

pub(crate) struct Scheduler {
    ready: ReadyQueue,
    blocked: BlockedList,
    /// The running strand. The SIGSEGV handler reads this through a raw
    /// place copy (never a reference) while a strand is interrupted.
    pub(crate) current: Option<NonNull<Strand>>,
    next_id: u64,
    /// The register state the dispatch loop runs on; every suspension point
    /// swaps back into this.
    ctx: Context,
    reactor: Reactor,
    /// Stashed final value stack of the main strand.
    main_result: ValueStack,
    /// Keeps the alternate signal stack alive while strands can fault.
    _alt_stack: AltStack,
}

static SCHEDULER: AtomicPtr<Scheduler> = AtomicPtr::new(ptr::null_mut());

/// The published scheduler pointer, null before init and after shutdown.
/// This is the one global the signal handler reads.
pub(crate) fn published() -> *mut Scheduler {
    SCHEDULER.load(Ordering::Acquire)
}

fn instance() -> *mut Scheduler {
    let scheduler = published();
    assert!(!scheduler.is_null(), "scheduler is not initialized");
    scheduler
}

fn current_strand() -> *mut Strand {
    let scheduler = instance();
    // Safety: single-threaded cooperative access to the published scheduler.
    unsafe {
        (*scheduler)
            .current
            .expect("no strand is currently running")
            .as_ptr()
    }
}

/// Initialize the process-wide scheduler: event multiplexer, alternate
/// signal stack, fault handler.
///
/// # Errors
///
/// Fails if the reactor or the alternate signal stack cannot be set up.
///
/// # Panics
///
/// Panics if the scheduler is already initialized.
pub fn scheduler_init() -> io::Result<()> {
    assert!(
        published().is_null(),
        "scheduler is already initialized"
    );

    let reactor = Reactor::new()?;
    let alt_stack = AltStack::install()?;
    let scheduler = Box::new(Scheduler {
        ready: ReadyQueue::new(),
        blocked: BlockedList::new(),
        current: None,
        next_id: MAIN_STRAND_ID,
        ctx: Context::new(),
        reactor,
        main_result: ptr::null_mut(),
        _alt_stack: alt_stack,
    });
    SCHEDULER.store(Box::into_raw(scheduler), Ordering::Release);
    segv::install_handler();

    tracing::debug!("scheduler initialized");
    Ok(())
}

/// Tear the scheduler down, destroying every remaining strand (running its
/// cleanup handlers) and closing the event multiplexer. A no-op when the
/// scheduler is not initialized.
///
/// # Panics
///
/// Panics if called from inside a strand.
pub fn scheduler_shutdown() {
    let scheduler = SCHEDULER.swap(ptr::null_mut(), Ordering::AcqRel);
    if scheduler.is_null() {
        return;
    }
    // Safety: unpublished above, so we hold the only reference and the
    // signal handler can no longer observe it.
    let mut scheduler = unsafe { Box::from_raw(scheduler) };
    assert!(
        scheduler.current.is_none(),
        "scheduler shut down from inside a strand"
    );

    while let Some(strand) = scheduler.ready.pop() {
        // Safety: popped strands are exclusively owned.
        unsafe { teardown(strand) };
    }
    while let Some(strand) = scheduler.blocked.pop_any() {
        // Safety: as above.
        unsafe { teardown(strand) };
    }
    if !scheduler.main_result.is_null() {
        cell::release(scheduler.main_result);
        scheduler.main_result = ptr::null_mut();
    }

    tracing::debug!("scheduler shut down");
}

/// Create a strand that will run `entry` with `value_stack` and queue it as
/// READY. Returns the strand id; the first spawn gets [`MAIN_STRAND_ID`].
///
/// # Errors
///
/// Fails if the strand's machine stack cannot be allocated.
///
/// # Panics
///
/// Panics if the scheduler is not initialized.
pub fn strand_spawn(entry: StrandEntry, value_stack: ValueStack) -> io::Result<u64> {
    let scheduler = instance();
    // Safety: single-threaded cooperative access.
    unsafe {
        let id = (*scheduler).next_id;
        let strand = Strand::new(id, entry, value_stack)?;
        (*scheduler).next_id += 1;
        (*scheduler).ready.push(NonNull::from(Box::leak(strand)));
        tracing::debug!(id, "spawned strand");
        Ok(id)
    }
}

/// First frame of every strand: runs the entry function and hands the strand
/// back to the dispatch loop as COMPLETED. Never returns.
extern "C" fn strand_trampoline() {
    let scheduler = instance();
    // Safety: the trampoline only ever runs as the initial frame of a strand
    // the dispatch loop just made current.
    unsafe {
        let strand = (*scheduler)
            .current
            .expect("trampoline entered without a running strand")
            .as_ptr();
        let entry = (*strand).entry;

        let result = entry((*strand).value_stack);

        // Re-read: the entry may have suspended arbitrarily often, but we are
        // back in this strand's context, so it is current again.
        let strand = (*scheduler)
            .current
            .expect("completing strand is not current")
            .as_ptr();
        (*strand).value_stack = result;
        (*strand).state = StrandState::Completed;
        (*scheduler).current = None;
        tracing::trace!(id = (*strand).id, "strand completed");

        arch::swap(&raw mut (*strand).ctx, &raw const (*scheduler).ctx);
    }
    unreachable!("resumed a completed strand");
}

/// Give up the CPU, re-queueing the calling strand at the tail of the ready
/// queue. Returns when the scheduler dispatches the strand again.
///
/// # Panics
///
/// Panics when called outside a running strand.
pub fn strand_yield() {
    let scheduler = instance();
    // Safety: single-threaded cooperative access; the strand re-queues
    // itself before switching away, the loop takes no further action.
    unsafe {
        let strand = (*scheduler)
            .current
            .take()
            .expect("yield outside of a strand");
        let ptr = strand.as_ptr();
        (*ptr).state = StrandState::Yielded;
        (*scheduler).ready.push(strand);
        tracing::trace!(id = (*ptr).id, "strand yielded");

        arch::swap(&raw mut (*ptr).ctx, &raw const (*scheduler).ctx);
    }
}

fn block_on(fd: RawFd, readiness: Readiness) {
    assert!(fd >= 0, "blocked on an invalid file descriptor");
    let scheduler = instance();
    // Safety: single-threaded cooperative access; the strand registers and
    // parks itself before switching away, the loop takes no further action.
    unsafe {
        let strand = (*scheduler)
            .current
            .take()
            .expect("blocking I/O outside of a strand");
        let ptr = strand.as_ptr();
        (*ptr).state = match readiness {
            Readiness::Readable => StrandState::BlockedRead,
            Readiness::Writable => StrandState::BlockedWrite,
        };
        (*ptr).blocked_fd = Some(fd);

        let registered = match readiness {
            Readiness::Readable => (*scheduler).reactor.register_read(fd, (*ptr).id),
            Readiness::Writable => (*scheduler).reactor.register_write(fd, (*ptr).id),
        };
        registered.expect("failed to register a descriptor with the reactor");

        (*scheduler).blocked.push(strand);
        tracing::trace!(id = (*ptr).id, fd, ?readiness, "strand blocked");

        arch::swap(&raw mut (*ptr).ctx, &raw const (*scheduler).ctx);

        // Back on the CPU; the registration was one-shot and is gone.
        (*ptr).blocked_fd = None;
    }
}

/// Park the calling strand until `fd` becomes readable.
///
/// # Panics
///
/// Panics when called outside a running strand or with a negative
/// descriptor.
pub fn strand_block_on_read(fd: RawFd) {
    block_on(fd, Readiness::Readable);
}

/// Park the calling strand until `fd` becomes writable.
///
/// # Panics
///
/// Panics when called outside a running strand or with a negative
/// descriptor.
pub fn strand_block_on_write(fd: RawFd) {
    block_on(fd, Readiness::Writable);
}

/// Register a cleanup handler on the calling strand. Handlers run in LIFO
/// order exactly once when the strand completes or is destroyed, unless
/// popped first.
///
/// # Panics
///
/// Panics when called outside a running strand.
pub fn strand_push_cleanup(func: CleanupFn, arg: *mut c_void) {
    let strand = current_strand();
    // Safety: the running strand exclusively owns its cleanup list.
    unsafe {
        (*strand).cleanups.push(func, arg);
    }
}

/// Remove the most recently pushed cleanup handler without invoking it.
///
/// # Panics
///
/// Panics when called outside a running strand or when the cleanup list is
/// empty (an unbalanced pop is a programming error).
pub fn strand_pop_cleanup() {
    let strand = current_strand();
    // Safety: the running strand exclusively owns its cleanup list.
    let popped = unsafe { (*strand).cleanups.pop() };
    assert!(popped.is_some(), "popped an empty cleanup list");
}

/// Replace the argument of the most recently pushed cleanup handler; used
/// when a tracked buffer moves under `realloc`.
///
/// # Panics
///
/// Panics when called outside a running strand or when the cleanup list is
/// empty.
pub fn strand_update_cleanup_arg(arg: *mut c_void) {
    let strand = current_strand();
    // Safety: the running strand exclusively owns its cleanup list.
    let updated = unsafe { (*strand).cleanups.update_arg(arg) };
    assert!(updated, "updated the argument of an empty cleanup list");
}

/// Cooperative checkpoint emitted by compiled weft code between words:
/// yields once and passes the value stack through unchanged.
pub extern "C" fn strand_checkpoint(stack: ValueStack) -> ValueStack {
    strand_yield();
    stack
}

/// Point-in-time machine-stack accounting for the calling strand.
#[derive(Debug, Clone, Copy)]
pub struct StackStats {
    pub usable_size: usize,
    pub growth_count: u32,
    pub guard_hit: bool,
}

/// Stack accounting of the calling strand; diagnostics for embedders and
/// tests (e.g. asserting that proactive growth kept the guard page cold).
///
/// # Panics
///
/// Panics when called outside a running strand.
pub fn strand_stack_stats() -> StackStats {
    let strand = current_strand();
    // Safety: the running strand exclusively owns its stack metadata.
    unsafe {
        StackStats {
            usable_size: (*strand).stack.usable_size(),
            growth_count: (*strand).stack.growth_count(),
            guard_hit: (*strand).stack.guard_hit(),
        }
    }
}

/// Re-register the first strand still parked on `fd` after a fired one-shot
/// consumed that descriptor's subscription. Waiters on a shared descriptor
/// are thereby serialized: each wakeup re-arms the next.
///
/// # Safety
///
/// `scheduler` must be the published scheduler, accessed from the dispatch
/// loop.
unsafe fn rearm_waiter(scheduler: *mut Scheduler, fd: RawFd) {
    // Safety: dispatch-loop access, no strand is running.
    unsafe {
        let Some(waiter) = (*scheduler).blocked.find_blocked_on(fd) else {
            return;
        };
        let ptr = waiter.as_ptr();
        let registered = match (*ptr).state {
            StrandState::BlockedRead => (*scheduler).reactor.register_read(fd, (*ptr).id),
            StrandState::BlockedWrite => (*scheduler).reactor.register_write(fd, (*ptr).id),
            state => unreachable!("blocked strand {} in state {state:?}", (*ptr).id),
        };
        registered.expect("failed to re-register a descriptor with the reactor");
        tracing::trace!(id = (*ptr).id, fd, "re-armed waiter on shared descriptor");
    }
}

/// Destroy a strand: run its cleanup LIFO, release its value stack, unmap
/// its machine stack, free the record.
///
/// # Safety
///
/// The strand must be unlinked from every collection and not current.
unsafe fn teardown(strand: NonNull<Strand>) {
    // Safety: exclusive ownership per the contract above.
    let mut strand = unsafe { Box::from_raw(strand.as_ptr()) };
    tracing::trace!(id = strand.id, "tearing down strand");
    strand.cleanups.run_all();
    if !strand.value_stack.is_null() {
        cell::release(strand.value_stack);
        strand.value_stack = ptr::null_mut();
    }
}

/// Run the dispatch loop until no strands remain, then return the main
/// strand's final value stack (null if it never completed).
///
/// # Panics
///
/// Panics if the scheduler is not initialized, if called from inside a
/// strand, if the reactor fails, or if a strand comes back in a state the
/// dispatch loop cannot account for (an internal invariant violation).
pub fn scheduler_run() -> ValueStack {
    let scheduler = instance();
    // Safety: single-threaded cooperative access; the loop holds no Rust
    // borrows across context switches, only raw pointers.
    unsafe {
        assert!(
            (*scheduler).current.is_none(),
            "scheduler re-entered from inside a strand"
        );

        loop {
            if let Some(strand) = (*scheduler).ready.pop() {
                let ptr = strand.as_ptr();
                (*ptr).state = StrandState::Running;
                (*scheduler).current = Some(strand);

                // Checkpoint: sample the suspended stack and grow it before
                // the strand gets a chance to outrun its free space.
                stack::check_and_grow(&mut (*ptr).stack, &mut (*ptr).ctx);

                arch::swap(&raw mut (*scheduler).ctx, &raw const (*ptr).ctx);

                match (*ptr).state {
                    StrandState::Completed => {
                        if (*ptr).id == MAIN_STRAND_ID {
                            (*scheduler).main_result = (*ptr).value_stack;
                            (*ptr).value_stack = ptr::null_mut();
                        }
                        teardown(strand);
                    }
                    // Yielded strands re-queued themselves; blocked strands
                    // registered and parked themselves.
                    StrandState::Yielded
                    | StrandState::BlockedRead
                    | StrandState::BlockedWrite => {}
                    state => {
                        unreachable!("strand returned to the scheduler in state {state:?}")
                    }
                }
            } else if !(*scheduler).blocked.is_empty() {
                let wakeups = (*scheduler)
                    .reactor
                    .wait()
                    .expect("reactor wait failed");
                // The wakeup buffer lives in the reactor; waking strands only
                // touches the ready queue and blocked list.
                for wakeup in wakeups {
                    match (*scheduler).blocked.remove(wakeup.token) {
                        Some(mut woken) => {
                            let fd = woken.as_ref().blocked_fd;
                            woken.as_mut().state = StrandState::Ready;
                            (*scheduler).ready.push(woken);
                            tracing::trace!(
                                id = wakeup.token,
                                readiness = ?wakeup.readiness,
                                "strand woken"
                            );

                            // Registrations are per descriptor, so a fired
                            // one-shot also consumed the subscription of any
                            // other strand parked on the same fd; re-arm the
                            // next waiter so it is not stranded.
                            if let Some(fd) = fd {
                                rearm_waiter(scheduler, fd);
                            }
                        }
                        None => {
                            tracing::debug!(token = wakeup.token, "wakeup for unknown strand");
                        }
                    }
                }
            } else {
                break;
            }
        }

        let result = (*scheduler).main_result;
        (*scheduler).main_result = ptr::null_mut();
        result
    }
}
