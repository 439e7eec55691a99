//! Behavior execution benchmarks.
//!
//! Measures the per-frame cost of running generated behaviors:
//!
//! - **Noop frame:** raw `update()` call overhead per instance.
//! - **Crowd frame:** 100 cubes each running an audio-reactive behavior.
//! - **Compile:** time from source text to a loaded handle.
//!
//! Run with: `cargo bench --bench script_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cubic_logic::prelude::*;
use cubic_script_host::{FrameInput, ScriptConfig, WasmBehaviorLoader};

/// Load a WAT fixture from the tests/fixtures directory.
fn fixture_source(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read fixture {}: {}", path.display(), e))
}

fn frame_input() -> FrameInput {
    FrameInput {
        frame: 1,
        elapsed: 0.016,
        delta_time: 0.016,
        microphone_volume: 0.4,
        music_volume: 0.6,
    }
}

// ---------------------------------------------------------------------------
// Benchmark 1: frame cost by population
// ---------------------------------------------------------------------------

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_frame");
    for (fixture, cubes) in [("noop.wat", 1usize), ("noop.wat", 100), ("mic_color.wat", 100)] {
        let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).expect("loader");
        let mut entities = EntityAllocator::new();
        let mut sequencer = GroupSequencer::new();
        for _ in 0..cubes {
            sequencer
                .add_entity_to_current_group(entities.allocate(), &mut loader)
                .expect("add cube");
        }
        let behavior = loader
            .compile_and_load(&fixture_source(fixture))
            .expect("fixture compiles");
        sequencer
            .on_behavior_generated(behavior, &mut loader)
            .expect("attach");

        let input = frame_input();
        group.bench_with_input(
            BenchmarkId::new(fixture.trim_end_matches(".wat"), cubes),
            &cubes,
            |b, _| {
                b.iter(|| {
                    let output = loader.run_frame(&input);
                    black_box(output.commands.len());
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 2: compile latency
// ---------------------------------------------------------------------------

fn bench_compile(c: &mut Criterion) {
    let source = fixture_source("spin.wat");
    let mut loader = WasmBehaviorLoader::new(ScriptConfig::default()).expect("loader");
    c.bench_function("compile_and_load_spin", |b| {
        b.iter(|| {
            let handle = loader.compile_and_load(&source).expect("compiles");
            loader.unload(handle);
            black_box(handle);
        });
    });
}

criterion_group!(benches, bench_frame, bench_compile);
criterion_main!(benches);
