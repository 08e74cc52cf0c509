use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pagedq_fn::{FunctionQueue, ManualFunctionQueue};
use pagedq_rs::MPMC_CONFIG;

const CALLS: u64 = 1_000_000;

fn bench_push_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("function_queue");
    group.throughput(Throughput::Elements(CALLS));

    group.bench_function("standard_erasure_roundtrip", |b| {
        b.iter(|| {
            let queue: FunctionQueue<u64, u64> = FunctionQueue::new(MPMC_CONFIG);
            for i in 0..CALLS {
                queue.push(move |x| x.wrapping_add(i));
            }
            let mut acc = 0u64;
            while let Some(v) = queue.try_consume(1) {
                acc = acc.wrapping_add(v);
            }
            black_box(acc);
        });
    });

    group.bench_function("manual_erasure_roundtrip", |b| {
        b.iter(|| {
            let queue: ManualFunctionQueue<u64, u64> = ManualFunctionQueue::new(MPMC_CONFIG);
            for i in 0..CALLS {
                queue.push(move |x| x.wrapping_add(i));
            }
            let mut acc = 0u64;
            while let Some(v) = queue.try_consume(1) {
                acc = acc.wrapping_add(v);
            }
            black_box(acc);
        });
    });

    group.bench_function("capturing_closures", |b| {
        b.iter(|| {
            let queue: FunctionQueue<(), String> = FunctionQueue::new(MPMC_CONFIG);
            for i in 0..10_000u64 {
                let payload = format!("job-{i}");
                queue.push(move |()| payload);
            }
            while let Some(s) = queue.try_consume(()) {
                black_box(s.len());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_consume);
criterion_main!(benches);
