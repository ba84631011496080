//! Core `compose_core` benchmarks.
//!
//! Benchmarks for parsing, compiling, decompiling, and evaluating note
//! expressions through a `Module`.

use compose_core::module::{Module, NoteEdits};
use compose_core::parser;
use compose_core::{Dialect, compile_source, decompiler};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

const SIMPLE_RATIO: &str = "base.f*(5/4)";
const OCTAVE_POWER: &str = "base.f*2^(7/12)";
const NESTED_ARITHMETIC: &str = "([1].f+[2].f)/2-base.f*(3/2)";
const BEAT_HELPER: &str = "beat(base)";
const LEGACY_CHAIN: &str =
    "module.baseNote.getVariable('f').mul(new Fraction(5,4)).add(module.getNoteById(1).getVariable('f'))";

fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parsing");

    group.bench_function("simple_ratio", |b| b.iter(|| parser::parse(black_box(SIMPLE_RATIO))));
    group.bench_function("octave_power", |b| b.iter(|| parser::parse(black_box(OCTAVE_POWER))));
    group.bench_function("nested_arithmetic", |b| {
        b.iter(|| parser::parse(black_box(NESTED_ARITHMETIC)));
    });
    group.bench_function("beat_helper", |b| b.iter(|| parser::parse(black_box(BEAT_HELPER))));
    group.bench_function("legacy_chain", |b| b.iter(|| parser::parse(black_box(LEGACY_CHAIN))));

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    group.bench_function("simple_ratio", |b| b.iter(|| compile_source(black_box(SIMPLE_RATIO))));
    group.bench_function("octave_power", |b| b.iter(|| compile_source(black_box(OCTAVE_POWER))));
    group.bench_function("nested_arithmetic", |b| {
        b.iter(|| compile_source(black_box(NESTED_ARITHMETIC)));
    });

    group.finish();
}

fn bench_decompile(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompile");

    let octave = compile_source(OCTAVE_POWER).expect("compiles");
    let nested = compile_source(NESTED_ARITHMETIC).expect("compiles");

    group.bench_function("octave_power_dsl", |b| {
        b.iter(|| decompiler::decompile(black_box(&octave), Dialect::Dsl));
    });
    group.bench_function("nested_arithmetic_dsl", |b| {
        b.iter(|| decompiler::decompile(black_box(&nested), Dialect::Dsl));
    });

    group.finish();
}

fn bench_module_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("module_evaluate");

    group.bench_function("twelve_tone_chromatic_run", |b| {
        b.iter(|| {
            let mut module = Module::default();
            for i in 1..=12u32 {
                module
                    .add_note(NoteEdits {
                        frequency: Some(format!("base.f*(2^({i}/12))")),
                        ..NoteEdits::default()
                    })
                    .expect("adds");
            }
            module.evaluate().expect("evaluates");
            black_box(module);
        });
    });

    group.bench_function("major_triad_timeline", |b| {
        b.iter(|| {
            let mut module = Module::default();
            let n1 = module
                .add_note(NoteEdits {
                    frequency: Some("base.f".to_owned()),
                    start_time: Some("0".to_owned()),
                    duration: Some("beat(base)".to_owned()),
                    ..NoteEdits::default()
                })
                .expect("adds");
            let n2 = module
                .add_note(NoteEdits {
                    frequency: Some("base.f*(5/4)".to_owned()),
                    start_time: Some(format!("[{}].t+[{}].d", n1.value(), n1.value())),
                    duration: Some("beat(base)".to_owned()),
                    ..NoteEdits::default()
                })
                .expect("adds");
            module
                .add_note(NoteEdits {
                    frequency: Some("base.f*(3/2)".to_owned()),
                    start_time: Some(format!("[{}].t+[{}].d", n2.value(), n2.value())),
                    duration: Some("beat(base)".to_owned()),
                    ..NoteEdits::default()
                })
                .expect("adds");
            module.evaluate().expect("evaluates");
            black_box(module);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parsing, bench_compile, bench_decompile, bench_module_evaluate);
criterion_main!(benches);
