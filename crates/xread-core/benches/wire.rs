use criterion::{black_box, criterion_group, criterion_main, Criterion};
use xread_core::wire::{Opcode, WireMessage};

fn bench_wire(c: &mut Criterion) {
    let req = WireMessage::read_req(0x1234, "volume-0/object-000017", 1 << 20, 4086);
    let encoded = req.encode();
    let rsp = WireMessage::response(Opcode::ReadRsp, 0x1234, 4086, 0).encode();

    c.bench_function("encode_read_req", |b| b.iter(|| black_box(&req).encode()));
    c.bench_function("decode_read_req", |b| {
        b.iter(|| WireMessage::decode(black_box(&encoded)))
    });
    c.bench_function("decode_read_rsp", |b| {
        b.iter(|| WireMessage::decode(black_box(&rsp)))
    });
}

criterion_group!(benches, bench_wire);
criterion_main!(benches);
