//! Codec throughput
//!
//! Measures frame encoding and full decode for a small record type and the
//! SET_ID control message.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emsg_codec::{FieldKind, FieldValue, MessageClass, MessageRegistry};

fn setup() -> MessageRegistry {
    let registry = MessageRegistry::new();
    registry
        .register_type(MessageClass::record(
            0x10,
            "sample",
            &[("seq", FieldKind::U64), ("text", FieldKind::Str)],
        ))
        .expect("register sample type");
    registry
}

fn bench_encode(c: &mut Criterion) {
    let registry = setup();
    let msg = registry
        .new_message(
            0x10,
            0,
            1,
            [("seq", FieldValue::U64(42)), ("text", FieldValue::from("hello world"))],
        )
        .expect("build message");
    let set_id = registry.set_id(3, 0, 3);

    let mut group = c.benchmark_group("encode");
    group.bench_function("record", |b| {
        b.iter(|| black_box(registry.encode(black_box(&msg))));
    });
    group.bench_function("set_id", |b| {
        b.iter(|| black_box(registry.encode(black_box(&set_id))));
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let registry = setup();
    let msg = registry
        .new_message(
            0x10,
            0,
            1,
            [("seq", FieldValue::U64(42)), ("text", FieldValue::from("hello world"))],
        )
        .expect("build message");
    let bytes = registry.encode(&msg).expect("encode");

    c.bench_function("decode_record", |b| {
        b.iter(|| black_box(registry.decode(black_box(&bytes))));
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
