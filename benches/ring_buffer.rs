use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use live_pcm_stream::audio::controller::create_adaptive_buffer;
use live_pcm_stream::audio::ring;
use live_pcm_stream::config::BufferTuning;
use live_pcm_stream::protocol::StreamFormat;

fn bench_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    for frames in [128usize, 512, 1024] {
        let samples = frames * 2;
        group.throughput(Throughput::Elements(samples as u64));
        group.bench_with_input(BenchmarkId::new("write_read", frames), &samples, |b, &samples| {
            let (mut writer, mut reader) = ring::allocate(48_000, 2);
            let input = vec![0.25f32; samples];
            let mut output = vec![0.0f32; samples];
            b.iter(|| {
                writer.write(black_box(&input)).unwrap();
                black_box(reader.read(&mut output));
            });
        });
    }
    group.finish();
}

fn bench_render_path(c: &mut Criterion) {
    let format = StreamFormat::new(48_000, 2);
    let (mut writer, mut reader) = create_adaptive_buffer(&BufferTuning::default(), format);
    let chunk = vec![0.1f32; 1024 * 2];
    // Open the start gate
    for _ in 0..8 {
        writer.write(&chunk).unwrap();
    }

    let mut out = vec![0.0f32; 256 * 2];
    c.bench_function("controller_read_settle_256", |b| {
        b.iter(|| {
            writer.write(&out).unwrap();
            black_box(reader.read(&mut out));
            black_box(reader.settle());
        })
    });
}

criterion_group!(benches, bench_ring, bench_render_path);
criterion_main!(benches);
