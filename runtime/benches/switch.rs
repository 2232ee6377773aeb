// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::atomic::{AtomicPtr, Ordering};
use weft_runtime::arch::{self, Context};
use weft_runtime::stack::StrandStack;

struct Shared {
    driver: Context,
    bouncer: Context,
}

static SHARED: AtomicPtr<Shared> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn bouncer_entry() {
    let shared = SHARED.load(Ordering::Relaxed);
    loop {
        // Safety: the bench keeps the shared state alive for its duration.
        unsafe {
            arch::swap(&raw mut (*shared).bouncer, &raw const (*shared).driver);
        }
    }
}

/// One suspend/resume pair: driver -> bouncer -> driver.
fn switch_pair(c: &mut Criterion) {
    let stack = StrandStack::new(16 * 1024).unwrap();
    let mut shared = Box::new(Shared {
        driver: Context::new(),
        bouncer: Context::new(),
    });
    // Safety: the stack is freshly mapped and owned by this bench.
    unsafe {
        arch::init(
            &mut shared.bouncer,
            stack.usable_base() as *mut u8,
            stack.usable_size(),
            bouncer_entry,
        );
    }
    SHARED.store(&raw mut *shared, Ordering::Relaxed);

    c.bench_function("context_switch_pair", |b| {
        b.iter(|| {
            // Safety: the bouncer sits in its swap loop between iterations.
            unsafe {
                arch::swap(&raw mut shared.driver, &raw const shared.bouncer);
            }
            black_box(());
        });
    });

    // The bouncer is abandoned mid-loop; dropping the stack unmaps it.
    drop(stack);
}

criterion_group!(benches, switch_pair);
criterion_main!(benches);
