use cncstream_camtools::orient::solve;
use cncstream_camtools::{compensate, HeightMap, Marker, ProbeGrid};
use cncstream_gcode::MotionProgram;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample_program() -> MotionProgram {
    let mut text = String::from("G21 G90\nG0 Z2\nG0 X0 Y0\nG1 Z-0.2 F300\n");
    for row in 0..20 {
        let y = row as f64 * 2.5;
        let x = if row % 2 == 0 { 50.0 } else { 0.0 };
        text.push_str(&format!("G1 X{} Y{}\nG1 Y{}\n", x, y, y + 2.5));
    }
    text.push_str("G2 X10 Y10 I5 J5\n");
    MotionProgram::parse(&text)
}

fn sample_map() -> HeightMap {
    let grid = ProbeGrid::new(0.0, 50.0, 0.0, 50.0, 5.0, 5.0).expect("valid grid");
    let heights: Vec<f64> = grid
        .nodes()
        .map(|(x, y)| 0.01 * x - 0.02 * y + 0.001 * x * y)
        .collect();
    HeightMap::from_heights(grid, &heights).expect("complete map")
}

fn bench_compensate(c: &mut Criterion) {
    let program = sample_program();
    let map = sample_map();
    c.bench_function("compensate_raster_11x11", |b| {
        b.iter(|| black_box(compensate(&program, &map)))
    });
    c.bench_function("height_map_interpolate", |b| {
        let surface = map.surface().expect("complete map");
        let mut v = 0.0;
        b.iter(|| {
            v = (v + 0.37) % 50.0;
            black_box(surface.height(v, 50.0 - v))
        })
    });
}

fn bench_orient(c: &mut Criterion) {
    let markers: Vec<Marker> = (0..16)
        .map(|k| {
            let (x, y) = (k as f64 * 3.0, (k % 4) as f64 * 7.0);
            let (s, c) = 0.1f64.sin_cos();
            Marker::new(x, y, x * c - y * s + 1.0, x * s + y * c - 2.0)
        })
        .collect();
    c.bench_function("orientation_solve_16_markers", |b| {
        b.iter(|| black_box(solve(black_box(&markers))))
    });
}

criterion_group!(benches, bench_compensate, bench_orient);
criterion_main!(benches);
