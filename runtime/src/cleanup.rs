// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-strand cleanup handlers.
//!
//! A strand that gets torn down never unwinds its machine stack, so `Drop`
//! impls living on that stack never run. Code that parks heap resources
//! across a suspension point therefore registers a cleanup handler instead;
//! the scheduler runs the whole LIFO exactly once when the strand completes
//! or is destroyed.

use core::ffi::c_void;
use smallvec::SmallVec;

/// A cleanup handler: called with its registered argument on strand teardown
/// unless popped first.
pub type CleanupFn = unsafe extern "C" fn(*mut c_void);

#[derive(Clone, Copy)]
pub(crate) struct Cleanup {
    func: CleanupFn,
    arg: *mut c_void,
}

/// LIFO of pending cleanup handlers. Inlines the common few-handler case so
/// pushing stays allocation-free.
pub(crate) struct CleanupStack {
    handlers: SmallVec<[Cleanup; 4]>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self {
            handlers: SmallVec::new(),
        }
    }

    pub(crate) fn push(&mut self, func: CleanupFn, arg: *mut c_void) {
        self.handlers.push(Cleanup { func, arg });
    }

    /// Remove the most recently pushed handler without invoking it.
    pub(crate) fn pop(&mut self) -> Option<Cleanup> {
        self.handlers.pop()
    }

    /// Replace the argument of the most recently pushed handler; the
    /// realloc-migration pattern. Returns `false` if the stack is empty.
    pub(crate) fn update_arg(&mut self, arg: *mut c_void) -> bool {
        match self.handlers.last_mut() {
            Some(cleanup) => {
                cleanup.arg = arg;
                true
            }
            None => false,
        }
    }

    /// Invoke every pending handler in LIFO order and clear the stack.
    pub(crate) fn run_all(&mut self) {
        while let Some(cleanup) = self.handlers.pop() {
            // Safety: handlers and their arguments were registered together
            // by the strand that owned the resource.
            unsafe {
                (cleanup.func)(cleanup.arg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The recorder is shared process state, so the tests using it take this
    // lock first; the harness runs them on separate threads.
    static TEST_LOCK: Mutex<()> = Mutex::new(());
    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record(arg: *mut c_void) {
        ORDER.lock().unwrap().push(arg as usize);
    }

    #[test]
    fn runs_in_lifo_order() {
        let _guard = TEST_LOCK.lock().unwrap();
        ORDER.lock().unwrap().clear();

        let mut stack = CleanupStack::new();
        for label in 1..=3usize {
            stack.push(record, label as *mut c_void);
        }

        stack.run_all();
        assert!(stack.pop().is_none());
        assert_eq!(*ORDER.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn pop_cancels_a_handler() {
        let _guard = TEST_LOCK.lock().unwrap();
        ORDER.lock().unwrap().clear();

        let mut stack = CleanupStack::new();
        stack.push(record, 1 as *mut c_void);
        stack.push(record, 2 as *mut c_void);
        assert!(stack.pop().is_some());

        stack.run_all();
        assert_eq!(*ORDER.lock().unwrap(), vec![1]);
    }

    #[test]
    fn pop_on_empty_is_none() {
        let mut stack = CleanupStack::new();
        assert!(stack.pop().is_none());
        assert!(!stack.update_arg(core::ptr::null_mut()));
    }

    #[test]
    fn update_arg_replaces_the_head_argument() {
        let _guard = TEST_LOCK.lock().unwrap();
        ORDER.lock().unwrap().clear();

        let mut stack = CleanupStack::new();
        stack.push(record, 1 as *mut c_void);
        stack.push(record, 2 as *mut c_void);
        assert!(stack.update_arg(99 as *mut c_void));

        stack.run_all();
        assert_eq!(*ORDER.lock().unwrap(), vec![99, 1]);
    }
}
