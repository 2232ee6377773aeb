//! Cleanup-handler discipline across the strand lifecycle.

use core::ffi::c_void;
use std::ptr;
use std::sync::Mutex;
use weft_runtime::{
    ValueStack, scheduler_init, scheduler_run, scheduler_shutdown, strand_pop_cleanup,
    strand_push_cleanup, strand_spawn, strand_update_cleanup_arg,
};

/// The scheduler is process-wide, so tests touching it take this lock; the
/// harness runs tests on separate threads.
static SCHED_LOCK: Mutex<()> = Mutex::new(());

static INVOKED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

unsafe extern "C" fn record(arg: *mut c_void) {
    INVOKED.lock().unwrap().push(arg as usize);
}

fn run_single(entry: weft_runtime::StrandEntry) {
    scheduler_init().unwrap();
    strand_spawn(entry, ptr::null_mut()).unwrap();
    let result = scheduler_run();
    assert!(result.is_null());
    scheduler_shutdown();
}

extern "C" fn push_three(stack: ValueStack) -> ValueStack {
    strand_push_cleanup(record, 1 as *mut c_void);
    strand_push_cleanup(record, 2 as *mut c_void);
    strand_push_cleanup(record, 3 as *mut c_void);
    stack
}

/// Handlers pushed 1, 2, 3 fire as 3, 2, 1 on completion, each exactly once.
#[test]
fn handlers_fire_in_lifo_order() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    run_single(push_three);

    assert_eq!(*INVOKED.lock().unwrap(), vec![3, 2, 1]);
}

extern "C" fn push_then_pop(stack: ValueStack) -> ValueStack {
    strand_push_cleanup(record, 7 as *mut c_void);
    strand_pop_cleanup();
    strand_push_cleanup(record, 8 as *mut c_void);
    stack
}

/// A push immediately cancelled by a pop never fires.
#[test]
fn pop_cancels_a_pending_handler() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    run_single(push_then_pop);

    assert_eq!(*INVOKED.lock().unwrap(), vec![8]);
}

extern "C" fn migrate_argument(stack: ValueStack) -> ValueStack {
    // The realloc pattern: a tracked buffer moves, the handler follows it.
    strand_push_cleanup(record, 42 as *mut c_void);
    strand_update_cleanup_arg(99 as *mut c_void);
    stack
}

/// Updating the head handler's argument makes teardown see the new pointer.
#[test]
fn update_follows_a_moved_buffer() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    run_single(migrate_argument);

    assert_eq!(*INVOKED.lock().unwrap(), vec![99]);
}

extern "C" fn strand_a(stack: ValueStack) -> ValueStack {
    strand_push_cleanup(record, 1 as *mut c_void);
    strand_push_cleanup(record, 2 as *mut c_void);
    stack
}

extern "C" fn strand_b(stack: ValueStack) -> ValueStack {
    strand_push_cleanup(record, 3 as *mut c_void);
    strand_push_cleanup(record, 4 as *mut c_void);
    stack
}

/// Cleanup lists are per strand: each strand's handlers run in its own LIFO
/// order, independent of the other's.
#[test]
fn lists_are_independent_per_strand() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    scheduler_init().unwrap();
    strand_spawn(strand_a, ptr::null_mut()).unwrap();
    strand_spawn(strand_b, ptr::null_mut()).unwrap();
    let result = scheduler_run();
    assert!(result.is_null());
    scheduler_shutdown();

    let invoked = INVOKED.lock().unwrap();
    assert_eq!(invoked.len(), 4);
    let pos = |label: usize| invoked.iter().position(|&x| x == label).unwrap();
    assert!(pos(2) < pos(1));
    assert!(pos(4) < pos(3));
}

extern "C" fn push_many(stack: ValueStack) -> ValueStack {
    for _ in 0..50 {
        strand_push_cleanup(record, 5 as *mut c_void);
    }
    stack
}

/// The small-vector list spills past its inline capacity without losing
/// handlers.
#[test]
fn many_handlers_all_fire() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    run_single(push_many);

    assert_eq!(INVOKED.lock().unwrap().len(), 50);
}

unsafe extern "C" fn free_buffer(arg: *mut c_void) {
    // Safety: registered with a malloc-backed buffer below.
    unsafe {
        libc::free(arg);
    }
    INVOKED.lock().unwrap().push(0xf5ee);
}

extern "C" fn leak_without_handler_would(stack: ValueStack) -> ValueStack {
    // Safety: 4 KiB scratch allocation owned by this strand.
    let buffer = unsafe { libc::malloc(4096) };
    assert!(!buffer.is_null());
    strand_push_cleanup(free_buffer, buffer);
    // Safety: buffer is live and 4 KiB long.
    unsafe {
        libc::memset(buffer, 0, 4096);
    }
    stack
}

/// A handler owning real memory fires on completion and releases it.
#[test]
fn handler_releases_real_memory() {
    let _guard = SCHED_LOCK.lock().unwrap();
    INVOKED.lock().unwrap().clear();

    run_single(leak_without_handler_would);

    assert_eq!(*INVOKED.lock().unwrap(), vec![0xf5ee]);
}
