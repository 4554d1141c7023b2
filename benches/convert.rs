use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ghostcodec::convert::{nv12_to_bgra, ColorSpace, YuvMatrix};
use ghostcodec::Resolution;

fn bench_nv12_to_bgra(c: &mut Criterion) {
    let mut group = c.benchmark_group("nv12_to_bgra");
    let matrix = YuvMatrix::for_color_space(ColorSpace::BT709_STUDIO);

    for res in [Resolution::HD_720P, Resolution::FHD_1080P] {
        let (w, h) = (res.width as usize, res.height as usize);
        let luma: Vec<u8> = (0..w * h).map(|i| (i % 220 + 16) as u8).collect();
        let chroma: Vec<u8> = (0..w * h / 2).map(|i| (i % 200 + 28) as u8).collect();

        group.throughput(Throughput::Elements(res.pixels()));
        group.bench_with_input(BenchmarkId::from_parameter(res), &res, |b, res| {
            b.iter(|| {
                nv12_to_bgra(
                    black_box(&luma),
                    black_box(&chroma),
                    res.width,
                    res.height,
                    &matrix,
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_nv12_to_bgra);
criterion_main!(benches);
