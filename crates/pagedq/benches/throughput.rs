use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagedq_rs::{AnyType, HeterQueue, ProgressGuarantee, MPMC_CONFIG, SPSC_CONFIG};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const MESSAGES: u64 = 1_000_000;

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("push_consume_u64", |b| {
        b.iter(|| {
            let queue: HeterQueue = HeterQueue::new(MPMC_CONFIG);
            for i in 0..MESSAGES {
                queue.push(i);
            }
            let mut sum = 0u64;
            while queue.try_consume(|ty: &AnyType, ptr| {
                sum += unsafe { *ty.downcast_ptr::<u64>(ptr).unwrap() };
            }) {}
            black_box(sum);
        });
    });

    group.bench_function("push_consume_mixed", |b| {
        b.iter(|| {
            let queue: HeterQueue = HeterQueue::new(MPMC_CONFIG);
            for i in 0..MESSAGES / 4 {
                queue.push(i);
                queue.push(i as u8);
                queue.push([i; 2]);
                queue.push(i as f64);
            }
            let mut count = 0u64;
            while queue.try_consume(|_, ptr| {
                black_box(ptr);
            }) {
                count += 1;
            }
            black_box(count);
        });
    });

    group.finish();
}

fn bench_spsc(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("handles_cross_thread", |b| {
        b.iter(|| {
            let queue: HeterQueue = HeterQueue::new(SPSC_CONFIG);
            thread::scope(|scope| {
                let mut producer = queue.producer().unwrap();
                scope.spawn(move || {
                    for i in 0..MESSAGES {
                        producer.push(i);
                    }
                });

                let mut consumer = queue.consumer().unwrap();
                let mut count = 0u64;
                while count < MESSAGES {
                    if consumer.try_consume(|_, ptr| {
                        black_box(ptr);
                    }) {
                        count += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            });
        });
    });

    group.finish();
}

fn bench_mpmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc");

    for threads in [2usize, 4] {
        let per_producer = MESSAGES / threads as u64;
        group.throughput(Throughput::Elements(per_producer * threads as u64));
        group.bench_with_input(
            BenchmarkId::new("producers_consumers", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let queue: HeterQueue = HeterQueue::new(MPMC_CONFIG);
                    let consumed = AtomicU64::new(0);
                    let total = per_producer * threads as u64;

                    thread::scope(|scope| {
                        for _ in 0..threads {
                            let queue = &queue;
                            scope.spawn(move || {
                                for i in 0..per_producer {
                                    if queue.try_push(ProgressGuarantee::LockFree, i).is_err() {
                                        queue.push(i);
                                    }
                                }
                            });
                        }
                        for _ in 0..threads {
                            let queue = &queue;
                            let consumed = &consumed;
                            scope.spawn(move || {
                                while consumed.load(Ordering::Relaxed) < total {
                                    if queue.try_consume(|_, ptr| {
                                        black_box(ptr);
                                    }) {
                                        consumed.fetch_add(1, Ordering::Relaxed);
                                    } else {
                                        std::hint::spin_loop();
                                    }
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_thread, bench_spsc, bench_mpmc);
criterion_main!(benches);
