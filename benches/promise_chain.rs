// Copyright 2025. The zc-rt authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use zc_rt::{new_promise_and_fulfiller, EventLoop, NullEventPort, WaitScope};

fn then_chain_of(n: usize, c: &mut Criterion) {
    c.bench_function(&format!("then_chain_{n}"), |b| {
        b.iter(|| {
            let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
            let scope = WaitScope::new(&loop_);

            let (promise, fulfiller) = new_promise_and_fulfiller::<u64>();
            let mut chained = promise;
            for _ in 0..n {
                chained = chained.then(|v| black_box(v) + 1);
            }
            fulfiller.fulfill(0);
            black_box(chained.wait(&scope).unwrap())
        });
    });
}

fn then_chain_10(c: &mut Criterion) {
    then_chain_of(10, c);
}
fn then_chain_1000(c: &mut Criterion) {
    then_chain_of(1000, c);
}

fn eval_later_fan_out(c: &mut Criterion) {
    const N: usize = 500;
    c.bench_function("eval_later_fan_out_500", |b| {
        b.iter(|| {
            let loop_ = EventLoop::new(Box::new(NullEventPort::default()));
            let scope = WaitScope::new(&loop_);

            let promises: Vec<_> =
                (0..N).map(|i| zc_rt::eval_later_promise(move || black_box(i) * 2)).collect();
            let joined = zc_rt::join_promises(promises);
            black_box(joined.wait(&scope).unwrap())
        });
    });
}

criterion_group!(promise_chain, then_chain_10, then_chain_1000, eval_later_fan_out);
criterion_main!(promise_chain);
