use aarch64xlate::config::Config;
use aarch64xlate::decode::Decoder;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

// A short, representative mix of encodings: REX-prefixed ALU, a ModRM+SIB
// load, a conditional jump, and a call — not a full basic block, just
// enough variety to avoid benchmarking a single decode state repeatedly.
#[rustfmt::skip]
static MIXED_STREAM: &[u8] = &[
    0x48, 0x89, 0xE5,             // mov rbp, rsp
    0x48, 0x8B, 0x04, 0x8D, 0x00, 0x00, 0x00, 0x00, // mov rax, [rcx*4]
    0x83, 0xC0, 0x01,             // add eax, 1
    0x74, 0x05,                   // jz +5
    0xE8, 0x00, 0x00, 0x00, 0x00, // call rel32
    0xC3,                         // ret
];

fn decode_mixed_stream(c: &mut Criterion) {
    let decoder = Decoder::new(Config::default());
    c.bench_function("decode_one mixed stream", |b| {
        b.iter(|| {
            let mut pc = 0x400000u64;
            let mut offset = 0usize;
            while offset < MIXED_STREAM.len() {
                match decoder.decode_one(&MIXED_STREAM[offset..], pc) {
                    Ok(inst) => {
                        offset += inst.size as usize;
                        pc += inst.size as u64;
                    }
                    Err(_) => break,
                }
                black_box(pc);
            }
        })
    });
}

criterion_group!(benches, decode_mixed_stream);
criterion_main!(benches);
