use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array3;
use tractreg::normalize::target_line_based;
use tractreg::resample::resample;
use tractreg::streamline::{CoordinateSpace, Origin};
use tractreg::{Affine, Grid, Interpolation, StreamlineSet, Volume, VolumeKind};

fn labels() -> Volume {
    let data = Array3::from_shape_fn((64, 64, 64), |(i, j, k)| ((i / 8) + (j / 8) * 8 + (k / 16) * 64) as f32);
    Volume::new(data, Affine::scaling(2.0), VolumeKind::Label)
}

fn brain_mask() -> Volume {
    let data = Array3::from_shape_fn((64, 64, 64), |(i, j, k)| {
        let d = (i as f64 - 32.0).powi(2) + (j as f64 - 32.0).powi(2) + (k as f64 - 32.0).powi(2);
        if d < 24.0 * 24.0 { 1.0 } else { 0.0 }
    });
    Volume::new(data, Affine::identity(), VolumeKind::Mask)
}

fn streamlines() -> StreamlineSet {
    let lines = (0..500)
        .map(|s| {
            let phase = s as f64 * 0.37;
            (0..50)
                .map(|p| {
                    let t = p as f64 / 49.0;
                    [2.0 + 60.0 * t, 32.0 + 20.0 * (phase + t * 3.0).sin(), 32.0 + 20.0 * (phase + t * 2.0).cos()]
                })
                .collect()
        })
        .collect();
    StreamlineSet::new(lines, CoordinateSpace::Voxel, Origin::Center)
}

fn bench_transport(c: &mut Criterion) {
    let atlas = labels();
    let target = Grid::new([91, 109, 91], Affine::from_rows([
        [-2.0, 0.0, 0.0, 90.0],
        [0.0, 2.0, 0.0, -126.0],
        [0.0, 0.0, 2.0, -72.0],
        [0.0, 0.0, 0.0, 1.0],
    ]));
    let shift = Affine::translation([4.0, -3.0, 1.5]);
    c.bench_function("resample_nearest", |b| {
        b.iter(|| resample(black_box(&atlas), &target, &shift, Interpolation::Nearest).unwrap())
    });

    let mask = brain_mask();
    let set = streamlines();
    c.bench_function("target_line_based", |b| {
        b.iter(|| target_line_based(black_box(&set), &mask, &Affine::identity(), true))
    });
}

criterion_group!(benches, bench_transport);
criterion_main!(benches);
