//! Benchmarks for descriptor parsing and control block encoding
//!
//! Measures:
//! - Parsing a small and a many-format descriptor set
//! - Profile derivation over continuous interval ranges
//! - Control block encode/decode for each protocol version
//! - Payload header parsing

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::test_utils::{
    format_mjpeg, format_uncompressed, frame_continuous, frame_mjpeg, frame_uncompressed,
    interface, simple_camera, vc_header, vs_input_header,
};
use protocol::{
    ControlBlockLength, DescriptorBlock, PayloadHeader, StreamControlBlock, derive_profiles,
    parse_descriptors,
};

/// A camera with one streaming interface carrying `formats` YUY2/MJPEG pairs
fn large_camera(formats: u8) -> Vec<DescriptorBlock> {
    let mut blocks = vec![
        interface(0, 0, 1),
        vc_header(0x0150, 0, &[1]),
        interface(1, 0, 2),
        vs_input_header(formats * 2, 0x81, 3),
    ];
    for i in 0..formats {
        let index = i * 2 + 1;
        blocks.push(format_uncompressed(index, 4, *b"YUY2", 16));
        for (f, (w, h)) in [(640, 480), (1280, 720), (848, 480), (424, 240)].iter().enumerate() {
            blocks.push(frame_uncompressed(
                f as u8 + 1,
                *w,
                *h,
                u32::from(*w) * u32::from(*h) * 2,
                &[166_666, 333_333, 666_666],
            ));
        }
        blocks.push(format_mjpeg(index + 1, 1));
        blocks.push(frame_mjpeg(1, 1920, 1080, 4_147_200, &[333_333]));
    }
    blocks
}

fn benchmark_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_descriptors");

    let simple = simple_camera(0x0110);
    group.bench_function("simple_camera", |b| {
        b.iter(|| parse_descriptors(black_box(&simple), 0))
    });

    for formats in [4u8, 16, 32] {
        let blocks = large_camera(formats);
        let bytes: usize = blocks.iter().map(|b| b.len()).sum();
        group.throughput(Throughput::Bytes(bytes as u64));
        group.bench_with_input(BenchmarkId::new("formats", formats), &blocks, |b, blocks| {
            b.iter(|| parse_descriptors(black_box(blocks), 0))
        });
    }

    group.finish();
}

fn benchmark_profiles(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_profiles");

    let parsed = parse_descriptors(&large_camera(16), 0);
    group.bench_function("discrete", |b| b.iter(|| derive_profiles(black_box(&parsed))));

    let continuous = parse_descriptors(
        &[
            interface(0, 0, 1),
            vc_header(0x0110, 0, &[1]),
            interface(1, 0, 2),
            vs_input_header(1, 0x81, 3),
            format_uncompressed(1, 1, *b"YUY2", 16),
            frame_continuous(1, 640, 480, 614_400, (33_333, 10_000_000, 1)),
        ],
        0,
    );
    group.bench_function("continuous", |b| {
        b.iter(|| derive_profiles(black_box(&continuous)))
    });

    group.finish();
}

fn benchmark_control_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_block");

    let block = StreamControlBlock {
        hint: 1,
        format_index: 1,
        frame_index: 1,
        frame_interval: 333_333,
        max_video_frame_size: 614_400,
        max_payload_transfer_size: 3072,
        ..Default::default()
    };

    for length in [
        ControlBlockLength::Uvc10,
        ControlBlockLength::Uvc11,
        ControlBlockLength::Uvc15,
    ] {
        group.bench_with_input(BenchmarkId::new("encode", length.len()), &length, |b, len| {
            b.iter(|| black_box(&block).encode(*len))
        });

        let bytes = block.encode(length);
        group.bench_with_input(BenchmarkId::new("decode", length.len()), &length, |b, len| {
            b.iter(|| StreamControlBlock::decode(black_box(&bytes), *len, 0))
        });
    }

    group.finish();
}

fn benchmark_payload_header(c: &mut Criterion) {
    let mut payload = vec![12u8, 0x8e];
    payload.extend_from_slice(&[0u8; 10]);
    payload.extend(std::iter::repeat_n(0x80u8, 614_400));

    c.bench_function("payload_header_parse", |b| {
        b.iter(|| PayloadHeader::parse(black_box(&payload)))
    });
}

criterion_group!(
    benches,
    benchmark_parse,
    benchmark_profiles,
    benchmark_control_block,
    benchmark_payload_header
);
criterion_main!(benches);
