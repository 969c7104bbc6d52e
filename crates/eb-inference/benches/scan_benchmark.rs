use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use eb_core::{CouplingPoint, Observable, RunMetadata};
use eb_inference::{
    AnalysisData, AxisRange, BoundScanner, CancelToken, GridSpec, ScanConfig, TestStatisticEngine,
    YieldEstimator,
};
use eb_model::{Binning, CoefficientTable, CrossSectionModel, XsecTerms};
use std::hint::black_box;
use std::sync::Arc;

fn make_engine() -> TestStatisticEngine {
    let nodes: Vec<f64> = (0..=200).map(|k| 0.2 + 0.01 * k as f64).collect();
    let table = CoefficientTable::tabulate(
        Observable::Mass,
        vec!["cHW".into(), "cHq3".into()],
        nodes,
        |m| XsecTerms {
            sm: 50.0 / (m * m),
            linear: vec![2.0 * m, -1.0 * m],
            quadratic: vec![(0, 0, 0.5 * m * m), (0, 1, 0.2 * m), (1, 1, 1.5 * m * m)],
        },
    )
    .unwrap();
    let model = CrossSectionModel::new(Arc::new(table));
    TestStatisticEngine::new(YieldEstimator::new(model, 100.0).unwrap())
}

fn bench_grid_scan(c: &mut Criterion) {
    let engine = make_engine();
    let sm = CouplingPoint::zero(2);
    let meta = RunMetadata::with_luminosity(100.0);
    let binned: AnalysisData = engine
        .estimator()
        .asimov_binned(&Binning::uniform(0.2, 2.2, 0.05).unwrap(), &sm, meta.clone())
        .unwrap()
        .into();
    let unbinned: AnalysisData =
        engine.estimator().asimov_unbinned(0.01, &sm, meta).unwrap().into();
    let scanner = BoundScanner::new(engine, ScanConfig::default()).unwrap();

    let mut group = c.benchmark_group("scan/asymptotic");
    for step in [0.2f64, 0.1, 0.05] {
        let axis = AxisRange::new(-1.0, 1.0, step).unwrap();
        let points = GridSpec::Ranges(vec![axis, axis]).points(2).unwrap();
        for (label, data) in [("binned", &binned), ("unbinned", &unbinned)] {
            group.bench_with_input(BenchmarkId::new(label, points.len()), &points, |b, pts| {
                b.iter(|| {
                    let res = scanner.run(black_box(data), black_box(pts), &CancelToken::new());
                    black_box(res.unwrap().bounds.len());
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_grid_scan);
criterion_main!(benches);
