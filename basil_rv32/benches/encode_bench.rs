//! Encoder throughput over a synthetic section.

use basil_common::Settings;
use basil_ir::{ConstantPool, TypeSection};
use basil_rv32::encode::Encoder;
use basil_rv32::{OpPool, RvInstrKind, RvSection, REG_A0, REG_A1};
use criterion::{criterion_group, criterion_main, Criterion};

fn build_section(instrs: usize) -> (OpPool, RvSection) {
    let mut pool = OpPool::new();
    let mut s = RvSection::new(
        TypeSection::proc(0, 0),
        3,
        0,
        0,
        0,
        &Settings::default(),
    );
    for i in 0..instrs {
        match i % 4 {
            0 => s.add_itype(&mut pool, RvInstrKind::Addi, REG_A0, REG_A0, 1),
            1 => s.add_rtype(&mut pool, RvInstrKind::Add, REG_A0, REG_A0, REG_A1),
            2 => s.add_sw(&mut pool, REG_A0, REG_A1, (i % 128) as i32 * 4),
            _ => s.add_lw(&mut pool, REG_A0, REG_A1, (i % 128) as i32 * 4),
        }
        .expect("append");
    }
    (pool, s)
}

fn encode_benchmark(c: &mut Criterion) {
    c.bench_function("encode_4k_instructions", |b| {
        b.iter_batched(
            || build_section(4096),
            |(mut pool, mut s)| {
                let mut enc = Encoder::new(1);
                enc.encode_section(&mut pool, &mut s, 0).expect("encode");
                enc.finish(&ConstantPool::default()).expect("finish")
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, encode_benchmark);
criterion_main!(benches);
