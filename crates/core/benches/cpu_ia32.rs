use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io::Cursor;
use vm32_core::cpu_ia32::CpuIa32;

/// A CPU with a tight countdown loop loaded at 0x100
///
///   mov ecx, 0xFFFF  ; B9 FF FF 00 00
/// loop:
///   dec ecx          ; 49
///   jnz loop         ; 75 FD
///   hlt              ; F4
fn bench_cpu() -> CpuIa32 {
    let mut cpu = CpuIa32::with_streams(
        0x10000,
        Box::new(Cursor::new(Vec::new())),
        Box::new(std::io::sink()),
        Box::new(std::io::sink()),
    );
    cpu.memory
        .set(0x100, &[0xB9, 0xFF, 0xFF, 0x00, 0x00, 0x49, 0x75, 0xFD, 0xF4])
        .unwrap();
    cpu.eip = 0x100;
    cpu
}

fn bench_cpu_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_ia32_step");

    group.bench_function("single_instruction", |b| {
        b.iter(|| {
            let mut cpu = bench_cpu();
            cpu.step().unwrap();
            black_box(cpu.ecx);
        });
    });

    group.finish();
}

fn bench_cpu_multiple_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_ia32_multiple_steps");

    for step_count in [10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(step_count),
            step_count,
            |b, &count| {
                b.iter(|| {
                    let mut cpu = bench_cpu();
                    for _ in 0..count {
                        cpu.step().unwrap();
                    }
                    black_box(cpu.cycles);
                });
            },
        );
    }

    group.finish();
}

fn bench_alu_mix(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_ia32_alu");

    // add/xor/shift over registers, repeated by stepping in place
    group.bench_function("register_alu", |b| {
        b.iter(|| {
            let mut cpu = bench_cpu();
            cpu.memory
                .set(
                    0x200,
                    &[
                        0x01, 0xD8, // add eax, ebx
                        0x31, 0xC8, // xor eax, ecx
                        0xC1, 0xE0, 0x03, // shl eax, 3
                        0xEB, 0xF7, // jmp back
                    ],
                )
                .unwrap();
            cpu.eip = 0x200;
            for _ in 0..400 {
                cpu.step().unwrap();
            }
            black_box(cpu.eax);
        });
    });

    group.finish();
}

fn bench_rep_movsb(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_ia32_rep_movsb");

    group.bench_function("copy_4k", |b| {
        b.iter(|| {
            let mut cpu = bench_cpu();
            cpu.memory.set(0x300, &[0xF3, 0xA4, 0xF4]).unwrap();
            cpu.eip = 0x300;
            cpu.esi = 0x1000;
            cpu.edi = 0x5000;
            cpu.ecx = 0x1000;
            cpu.run().unwrap();
            black_box(cpu.edi);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cpu_step,
    bench_cpu_multiple_steps,
    bench_alu_mix,
    bench_rep_movsb
);
criterion_main!(benches);
