use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand_core::{RngCore, SeedableRng};
use rand_pcg::Lcg128Xsl64 as Pcg;
use thread_slot::Handle;

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot::read");
    // bound_hit: home-slot fast path on a warm binding
    group.bench_function("bound_hit", |b| {
        let slot = Handle::with_initial(|| 0u64);
        slot.set(7);
        b.iter(|| black_box(slot.get()))
    });
    // crowded_hit: reads probing through a table of 256 live bindings
    group.bench_function("crowded_hit", |b| {
        let slots: Vec<Handle<u64>> = (0..256).map(|_| Handle::new()).collect();
        for (i, s) in slots.iter().enumerate() {
            s.set(i as u64);
        }
        let mut rng = Pcg::seed_from_u64(1);
        b.iter(|| {
            let i = (rng.next_u64() as usize) % slots.len();
            black_box(slots[i].get())
        })
    });
    group.finish();
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot::write");
    // update: overwrite an existing binding in place
    group.bench_function("update", |b| {
        let slot = Handle::with_initial(|| 0u64);
        slot.set(0);
        let mut rng = Pcg::seed_from_u64(2);
        b.iter(|| slot.set(black_box(rng.next_u64())))
    });
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot::churn");
    group.throughput(Throughput::Elements(64));
    // bind_drop_64: fresh handles bound then dropped, leaving stale slots
    // for later passes to reclaim
    group.bench_function("bind_drop_64", |b| {
        b.iter_batched(
            || (0..64).map(|_| Handle::new()).collect::<Vec<Handle<u64>>>(),
            |slots| {
                for (i, s) in slots.iter().enumerate() {
                    s.set(i as u64);
                }
                black_box(slots)
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_read, bench_write, bench_churn);
criterion_main!(benches);
