use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;

use guard_limit::FixedWindow;
use guard_limit::Strategy;
use guard_limit::TokenBucket;

const THREADS: [usize; 3] = [2, 4, 8];

fn count(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// A bucket that never runs dry: it refills completely every nanosecond.
fn bottomless() -> TokenBucket {
    let capacity = count(1 << 40);
    TokenBucket::new(Duration::from_nanos(1), capacity, capacity)
}

/// A window wide enough that no benchmark run exhausts it.
fn wide_window() -> FixedWindow {
    FixedWindow::new(Duration::from_secs(3600), count(u32::MAX as usize))
}

/// Runs `admit` `iters` times split across `threads` threads started together, and returns
/// the wall time from the common start.
fn hammer(threads: usize, iters: u64, admit: impl Fn() + Sync) -> Duration {
    let barrier = Barrier::new(threads + 1);
    let per_thread = iters / threads as u64;
    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..per_thread {
                    admit();
                }
            });
        }
        barrier.wait();
        let start = Instant::now();
        // The scope joins every worker before returning.
        start
    })
    .elapsed()
}

/// Single-threaded cost of one admission decision.
fn admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");

    let window = wide_window();
    group.bench_function("fixed_window", |b| {
        b.iter(|| black_box(window.process()))
    });

    let bucket = bottomless();
    group.bench_function("token_bucket", |b| b.iter(|| black_box(bucket.take(1))));

    // Every call computes a wait instead of taking a token.
    let drained = TokenBucket::new(Duration::from_secs(3600), count(1), count(1));
    drained.take(1);
    group.bench_function("token_bucket_empty", |b| {
        b.iter(|| black_box(drained.take(1)))
    });

    // Nearly every call lands in a new window and resets the count.
    let rolling = FixedWindow::new(Duration::from_nanos(1), count(1));
    group.bench_function("fixed_window_rollover", |b| {
        b.iter(|| black_box(rolling.process()))
    });

    group.finish();
}

/// Taking several tokens at once costs one lock, not one per token.
fn multi_token_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("take");
    let bucket = bottomless();
    for n in [1, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| black_box(bucket.take(n)))
        });
    }
    group.finish();
}

/// The bucket's mutex against the window's single atomic word under contention.
fn contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    for threads in THREADS {
        let window = wide_window();
        group.bench_with_input(
            BenchmarkId::new("fixed_window", threads),
            &threads,
            |b, &threads| {
                b.iter_custom(|iters| {
                    hammer(threads, iters, || {
                        black_box(window.process());
                    })
                })
            },
        );

        let bucket = bottomless();
        group.bench_with_input(
            BenchmarkId::new("token_bucket", threads),
            &threads,
            |b, &threads| {
                b.iter_custom(|iters| {
                    hammer(threads, iters, || {
                        black_box(bucket.take(1));
                    })
                })
            },
        );

        // Contended waits: every caller is refused and told how long to back off.
        let drained = TokenBucket::new(Duration::from_secs(3600), count(1), count(1));
        drained.take(1);
        group.bench_with_input(
            BenchmarkId::new("token_bucket_empty", threads),
            &threads,
            |b, &threads| {
                b.iter_custom(|iters| {
                    hammer(threads, iters, || {
                        black_box(drained.take(1));
                    })
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, admission, multi_token_take, contended);
criterion_main!(benches);
