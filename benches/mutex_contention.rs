// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use zc_rt::sync::{LockMode, MutexGuarded};

fn uncontended_lock_unlock(c: &mut Criterion) {
    let mutex = MutexGuarded::new(0u64);
    c.bench_function("uncontended_lock_unlock", |b| {
        b.iter(|| {
            let mut guard = mutex.lock(LockMode::Exclusive);
            *guard += 1;
            black_box(*guard)
        });
    });
}

fn contended_exclusive_lock(c: &mut Criterion) {
    c.bench_function("contended_exclusive_lock_4_threads", |b| {
        b.iter(|| {
            let mutex = Arc::new(MutexGuarded::new(0u64));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let mutex = mutex.clone();
                    thread::spawn(move || {
                        for _ in 0..200 {
                            let mut guard = mutex.lock(LockMode::Exclusive);
                            *guard = guard.wrapping_add(1);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            black_box(*mutex.lock(LockMode::Exclusive))
        });
    });
}

fn when_wakes_on_releaser_pass(c: &mut Criterion) {
    c.bench_function("when_wakes_on_releaser_pass", |b| {
        b.iter(|| {
            let mutex = Arc::new(MutexGuarded::new(0u32));
            let writer = {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_micros(200));
                    *mutex.lock(LockMode::Exclusive) = 1;
                })
            };
            let result = mutex.when(|n| *n == 1, |n| *n + 1, Duration::from_secs(1));
            writer.join().unwrap();
            black_box(result.unwrap())
        });
    });
}

criterion_group!(mutex_contention, uncontended_lock_unlock, contended_exclusive_lock, when_wakes_on_releaser_pass);
criterion_main!(mutex_contention);
