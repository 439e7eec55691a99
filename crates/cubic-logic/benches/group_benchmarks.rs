//! Group fan-out benchmarks.
//!
//! Measures the cost of applying a behavior to a populated group and of a
//! full generation round on the sequencer, with a loader that does no work so
//! only the bookkeeping is timed.
//!
//! Run with: `cargo bench --bench group_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cubic_logic::prelude::*;

#[derive(Default)]
struct NullLoader {
    next: u64,
}

impl BehaviorLoader for NullLoader {
    fn compile_and_load(&mut self, _source: &str) -> Result<BehaviorHandle, LoaderError> {
        self.next += 1;
        Ok(BehaviorHandle::from_raw(self.next))
    }

    fn instantiate(
        &mut self,
        _behavior: BehaviorHandle,
        _entity: EntityId,
    ) -> Result<ProxyId, LoaderError> {
        self.next += 1;
        Ok(ProxyId::from_raw(self.next))
    }

    fn release(&mut self, _proxy: ProxyId) {}

    fn unload(&mut self, _behavior: BehaviorHandle) -> bool {
        true
    }
}

fn populated_group(members: usize, loader: &mut NullLoader) -> ObjectGroup {
    let mut entities = EntityAllocator::new();
    let mut group = ObjectGroup::new(GroupId(0));
    for _ in 0..members {
        group
            .add_entity(entities.allocate(), JoinPolicy::Bare, loader)
            .expect("fresh entities never collide");
    }
    group
}

fn bench_attach_detach(c: &mut Criterion) {
    let mut bench_group = c.benchmark_group("group_attach_detach");
    for members in [10usize, 100, 1_000] {
        let mut loader = NullLoader::default();
        let mut group = populated_group(members, &mut loader);
        let behavior = loader.compile_and_load("bench").expect("null loader");

        bench_group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let attached = group.attach_behavior(behavior, &mut loader).expect("attach");
                let detached = group.detach_behavior(behavior, &mut loader);
                black_box((attached, detached));
            });
        });
    }
    bench_group.finish();
}

fn bench_generation_rounds(c: &mut Criterion) {
    c.bench_function("sequencer_100_rounds_of_10_cubes", |b| {
        b.iter(|| {
            let mut loader = NullLoader::default();
            let mut entities = EntityAllocator::new();
            let mut sequencer = GroupSequencer::new();
            for _ in 0..100 {
                for _ in 0..10 {
                    sequencer
                        .add_entity_to_current_group(entities.allocate(), &mut loader)
                        .expect("add");
                }
                let h = loader.compile_and_load("round").expect("compile");
                sequencer.on_behavior_generated(h, &mut loader).expect("round");
            }
            black_box(sequencer.group_count());
        });
    });
}

criterion_group!(benches, bench_attach_detach, bench_generation_rounds);
criterion_main!(benches);
