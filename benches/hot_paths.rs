use std::sync::Arc;

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pmusync::capture::{
    Buffer, CaptureTrigger, Control, CounterSource, Sample, SampleBufferPool, BUFFER_ENTRIES,
};
use pmusync::encoder::PacketEncoder;
use pmusync::identity::{MetadataLoader, ProcessIdentityCache, ProcessMetadata};
use pmusync::wire::{decode_packet, encode_packet, Packet};

struct StaticLoader;

impl MetadataLoader for StaticLoader {
    fn load(&self, pid: u32) -> ProcessMetadata {
        ProcessMetadata {
            cmdline: format!("/system/bin/app_process --pid {pid}"),
            executable: "/system/bin/app_process64".into(),
            complete: true,
        }
    }
}

struct IdleCounters;

impl CounterSource for IdleCounters {
    fn read_cycles(&self, _core: u32) -> u64 {
        1_000
    }

    fn read_counter(&self, _core: u32, index: usize) -> u32 {
        index as u32
    }

    fn current_pid(&self, _core: u32) -> u32 {
        1337
    }

    fn rearm(&self, _core: u32, _period: u32) {}
}

/// A full buffer alternating between a few pids in runs of 17.
fn mixed_buffer() -> Buffer {
    let mut buffer = Buffer::new();
    buffer.reset(3);
    for i in 0..BUFFER_ENTRIES {
        buffer.push(Sample {
            cycles: 1_000_000 * i as u64,
            pid: 4_000 + (i / 17) as u32 % 3,
            counters: [i as u32, 2, 3, 4, 5, 6],
        });
    }
    buffer
}

fn encoded_packets() -> Vec<u8> {
    let buffer = mixed_buffer();
    let mut identities = ProcessIdentityCache::new(StaticLoader);
    let mut packets: Vec<Packet> = Vec::new();
    PacketEncoder::new().encode_buffer(&buffer, &mut identities, 0, |p| packets.push(p));

    let mut wire = BytesMut::new();
    for p in &packets {
        encode_packet(p, &mut wire);
    }
    wire.to_vec()
}

fn bench_encode_buffer(c: &mut Criterion) {
    let buffer = mixed_buffer();
    let mut identities = ProcessIdentityCache::new(StaticLoader);
    let mut encoder = PacketEncoder::new();
    let mut wire = BytesMut::with_capacity(8192);

    c.bench_function("encoder/encode_full_buffer", |b| {
        b.iter(|| {
            wire.clear();
            encoder.encode_buffer(black_box(&buffer), &mut identities, 0, |p| {
                encode_packet(&p, &mut wire)
            });
            black_box(wire.len())
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let wire = encoded_packets();

    c.bench_function("wire/decode_batch", |b| {
        b.iter(|| {
            let mut src = black_box(&wire[..]);
            let mut samples = 0;
            while let Ok(Some((packet, consumed))) = decode_packet(src, 16) {
                samples += packet.samples.len();
                src = src.get(consumed..).unwrap_or_default();
            }
            black_box(samples)
        })
    });
}

fn bench_overflow(c: &mut Criterion) {
    let pool = Arc::new(SampleBufferPool::new(8));
    let control = Arc::new(Control::new(1_000_000, &[8, 0, 0, 0]));
    let trigger = CaptureTrigger::new(Arc::clone(&pool), control, IdleCounters, 1);
    trigger.start();

    c.bench_function("trigger/on_overflow", |b| {
        b.iter(|| {
            let outcome = trigger.on_overflow(black_box(0));
            if let Some(buffer) = pool.try_drain_full() {
                pool.release_free(buffer);
            }
            black_box(outcome)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_encode_buffer(c);
    bench_decode(c);
    bench_overflow(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
