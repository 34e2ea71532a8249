use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use ctisim::{
    add_cti, remove_cti, CCDPhase, CtiParams, TrapInstantCapture, TrapList, CCD, ROE,
};

fn make_params(express: usize) -> CtiParams {
    let trap = TrapInstantCapture::new(10.0, -1.0 / 0.5_f64.ln()).unwrap();
    let traps = TrapList {
        instant_capture: vec![trap],
        ..TrapList::default()
    };
    let roe = ROE::new(vec![1.0], true, false).unwrap();
    let ccd = CCD::new(CCDPhase::new(1e4, 0.0, 1.0).unwrap());
    CtiParams::new(roe, ccd, traps, express)
}

fn make_image(n_rows: usize, n_cols: usize) -> Array2<f64> {
    // Sparse bright streaks over a faint background
    Array2::from_shape_fn((n_rows, n_cols), |(r, c)| {
        if r % 50 == (c * 7) % 50 {
            2e4
        } else {
            30.0
        }
    })
}

fn bench_add_cti(c: &mut Criterion) {
    let image_small = make_image(256, 8);
    let image_tall = make_image(2048, 8);

    let mut group = c.benchmark_group("add_cti");
    group.bench_function("256x8_express_5", |b| {
        let params = make_params(5);
        b.iter(|| add_cti(black_box(&image_small), Some(&params), None).unwrap())
    });
    group.bench_function("256x8_exact", |b| {
        let params = make_params(0);
        b.iter(|| add_cti(black_box(&image_small), Some(&params), None).unwrap())
    });
    group.bench_function("2048x8_express_5", |b| {
        let params = make_params(5);
        b.iter(|| add_cti(black_box(&image_tall), Some(&params), None).unwrap())
    });
    group.finish();
}

fn bench_remove_cti(c: &mut Criterion) {
    let params = make_params(5);
    let image = make_image(512, 4);
    let trailed = add_cti(&image, Some(&params), None).unwrap();

    c.bench_function("remove_cti_512x4_3_iterations", |b| {
        b.iter(|| remove_cti(black_box(&trailed), 3, Some(&params), None).unwrap())
    });
}

criterion_group!(benches, bench_add_cti, bench_remove_cti);
criterion_main!(benches);
