use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hwsched::prelude::*;

fn batch(n: usize) -> Vec<DrawRequest> {
    (0..n)
        .map(|_| DrawRequest::Command(CommandRequest::with_ib_count(4)))
        .collect()
}

pub fn bench_queue_and_dispatch(c: &mut Criterion) {
    let gpu = SimHardware::auto_retiring();
    let scheduler = Scheduler::manual(SchedulerConfig::default(), gpu.interfaces()).unwrap();
    let ctx = scheduler.create_context(ContextParams::default()).unwrap();

    c.bench_function("queue_and_dispatch_8", |b| {
        b.iter(|| {
            let ts = scheduler.queue_commands(ctx, batch(8), None).unwrap();
            scheduler.dispatch();
            black_box(ts)
        })
    });
}

pub fn bench_many_contexts(c: &mut Criterion) {
    let gpu = SimHardware::auto_retiring();
    let scheduler = Scheduler::manual(SchedulerConfig::default(), gpu.interfaces()).unwrap();
    let contexts: Vec<_> = (0..16)
        .map(|i| {
            scheduler
                .create_context(ContextParams {
                    priority: i % 4,
                    flags: ContextFlags::empty(),
                })
                .unwrap()
        })
        .collect();

    c.bench_function("dispatch_16_contexts", |b| {
        b.iter(|| {
            for &ctx in &contexts {
                scheduler.queue_commands(ctx, batch(2), None).unwrap();
            }
            scheduler.dispatch();
            black_box(scheduler.inflight())
        })
    });
}

criterion_group!(benches, bench_queue_and_dispatch, bench_many_contexts);
criterion_main!(benches);
