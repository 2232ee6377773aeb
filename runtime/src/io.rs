// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Line-oriented non-blocking I/O for strand code.
//!
//! Both operations follow the same discipline: the in-flight buffer is
//! malloc-backed and covered by a cleanup handler for the whole window in
//! which the strand might be destroyed while parked on the reactor. A strand
//! torn down mid-block never unwinds its machine stack, so the handler is
//! the only thing standing between a suspended buffer and a leak. On the
//! happy path the handler is popped and the buffer freed (or handed to a
//! string cell) explicitly.
//!
//! I/O errors other than would-block are fatal runtime errors: the pending
//! buffer is released and the process terminates with a diagnostic, matching
//! the rest of the runtime's error taxonomy.

use crate::cell::{self, Value, ValueStack};
use crate::sched::{
    strand_block_on_read, strand_block_on_write, strand_pop_cleanup, strand_push_cleanup,
    strand_update_cleanup_arg,
};
use core::ffi::{c_char, c_void};
use std::io;
use std::ptr;
use std::sync::Once;

/// Initial capacity of the line reader's buffer.
const READ_BUFFER_CAPACITY: usize = 128;

fn fatal(message: &str) -> ! {
    eprintln!("weft runtime error: {message}");
    std::process::exit(1);
}

fn set_nonblocking(fd: i32) -> io::Result<()> {
    // Safety: fcntl on a descriptor we do not own is read-modify-write of
    // its flags only.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Put stdin and stdout into non-blocking mode, once per process. The
/// reactor contract requires it, and blocking descriptors would stall every
/// strand at once.
fn ensure_nonblocking() {
    static NONBLOCKING: Once = Once::new();
    NONBLOCKING.call_once(|| {
        if set_nonblocking(libc::STDOUT_FILENO).is_err() {
            fatal("failed to set stdout non-blocking");
        }
        if set_nonblocking(libc::STDIN_FILENO).is_err() {
            fatal("failed to set stdin non-blocking");
        }
    });
}

/// Cleanup handler for in-flight line buffers.
unsafe extern "C" fn release_line_buffer(buffer: *mut c_void) {
    // Safety: registered exclusively with malloc-backed buffers.
    unsafe {
        libc::free(buffer);
    }
}

/// Write the string on top of the value stack to stdout, followed by a
/// newline. Stack effect: `( str -- )`.
///
/// Blocks the calling strand (not the process) whenever stdout would block,
/// and resumes when the reactor reports writability.
///
/// # Panics
///
/// Panics when called outside a running strand. Terminates the process on
/// an empty or non-string stack top and on I/O errors other than
/// would-block.
pub extern "C" fn write_line(stack: ValueStack) -> ValueStack {
    ensure_nonblocking();

    let Some((value, rest)) = cell::pop(stack) else {
        fatal("write-line: value stack is empty");
    };
    let Value::Str(string) = value else {
        fatal("write-line: expected a string on the stack");
    };

    // Safety: string cells own NUL-terminated buffers.
    let length = unsafe { libc::strlen(string) };
    let total = length + 1;

    // Safety: allocating total bytes, fully initialized below.
    let buffer = unsafe { libc::malloc(total) }.cast::<u8>();
    if buffer.is_null() {
        fatal("write-line: out of memory");
    }
    // Safety: `buffer` holds `total` bytes; the source string holds
    // `length`.
    unsafe {
        ptr::copy_nonoverlapping(string.cast::<u8>().cast_const(), buffer, length);
        *buffer.add(length) = b'\n';
        libc::free(string.cast());
    }

    // From here until the final pop the strand may be destroyed while
    // parked; the handler keeps the buffer from leaking.
    strand_push_cleanup(release_line_buffer, buffer.cast());

    let mut written = 0usize;
    while written < total {
        // Safety: `written..total` stays within the buffer.
        let n = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                buffer.add(written).cast(),
                total - written,
            )
        };
        if n > 0 {
            written += n as usize;
            continue;
        }
        if n == 0 {
            strand_pop_cleanup();
            // Safety: the handler was just popped; we own the buffer.
            unsafe { libc::free(buffer.cast()) };
            fatal("write-line: write returned zero");
        }
        match io::Error::last_os_error().kind() {
            io::ErrorKind::WouldBlock => strand_block_on_write(libc::STDOUT_FILENO),
            io::ErrorKind::Interrupted => {}
            _ => {
                strand_pop_cleanup();
                // Safety: the handler was just popped; we own the buffer.
                unsafe { libc::free(buffer.cast()) };
                fatal("write-line: write failed");
            }
        }
    }

    strand_pop_cleanup();
    // Safety: the handler was just popped; we own the buffer.
    unsafe { libc::free(buffer.cast()) };
    rest
}

/// Read a line from stdin and push it (without the newline) onto the value
/// stack. Stack effect: `( -- str )`. End-of-input yields an empty string.
///
/// Blocks the calling strand (not the process) whenever stdin has no data,
/// and resumes when the reactor reports readability.
///
/// # Panics
///
/// Panics when called outside a running strand. Terminates the process on
/// allocation failure and on I/O errors other than would-block.
pub extern "C" fn read_line(stack: ValueStack) -> ValueStack {
    ensure_nonblocking();

    let mut capacity = READ_BUFFER_CAPACITY;
    let mut length = 0usize;
    // Safety: allocating `capacity` bytes, written before they are read.
    let mut buffer = unsafe { libc::malloc(capacity) }.cast::<u8>();
    if buffer.is_null() {
        fatal("read-line: out of memory");
    }
    strand_push_cleanup(release_line_buffer, buffer.cast());

    loop {
        let mut byte = 0u8;
        // Safety: reading a single byte into a stack slot.
        let n = unsafe { libc::read(libc::STDIN_FILENO, (&raw mut byte).cast(), 1) };
        if n > 0 {
            if byte == b'\n' {
                break;
            }
            if length == capacity {
                buffer = grow_line_buffer(buffer, capacity * 2);
                capacity *= 2;
            }
            // Safety: `length < capacity` after the growth check.
            unsafe {
                *buffer.add(length) = byte;
            }
            length += 1;
        } else if n == 0 {
            // EOF: terminate with whatever was collected.
            break;
        } else {
            match io::Error::last_os_error().kind() {
                io::ErrorKind::WouldBlock => strand_block_on_read(libc::STDIN_FILENO),
                io::ErrorKind::Interrupted => {}
                _ => {
                    strand_pop_cleanup();
                    // Safety: the handler was just popped; we own the buffer.
                    unsafe { libc::free(buffer.cast()) };
                    fatal("read-line: read failed");
                }
            }
        }
    }

    if length == capacity {
        buffer = grow_line_buffer(buffer, capacity + 1);
    }
    // Safety: the NUL slot is in bounds after the growth check.
    unsafe {
        *buffer.add(length) = 0;
    }

    // Ownership of the buffer moves into the string cell, so the cleanup
    // handler comes off without firing.
    // Safety: `buffer` is a NUL-terminated malloc allocation.
    let stack = unsafe { cell::push_owned_str(stack, buffer.cast::<c_char>()) };
    strand_pop_cleanup();
    stack
}

/// Grow the tracked line buffer with `realloc`, keeping the registered
/// cleanup handler pointed at the live allocation.
fn grow_line_buffer(buffer: *mut u8, new_capacity: usize) -> *mut u8 {
    // Safety: `buffer` is the live malloc allocation tracked by the cleanup
    // handler.
    let grown = unsafe { libc::realloc(buffer.cast(), new_capacity) }.cast::<u8>();
    if grown.is_null() {
        // realloc failure leaves the original allocation valid.
        strand_pop_cleanup();
        // Safety: the handler was just popped; we own the buffer.
        unsafe { libc::free(buffer.cast()) };
        fatal("read-line: out of memory");
    }
    strand_update_cleanup_arg(grown.cast());
    grown
}
