// ========================================================================================
//
//                       DXMETA POOLING AND SROC BENCHMARK
//
// ========================================================================================
//
// Measures how REML pooling and the bootstrapped SROC fit scale with the number of
// studies in a cohort. Cohorts are simulated from a fixed seed so runs are comparable.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use dxmeta::config::AnalysisConfig;
use dxmeta::estimate::pool_random_effects;
use dxmeta::sroc::fit_sroc;
use dxmeta::types::{BiomarkerCohort, Covariates, ReportingForm, StudyRecord, TwoByTwo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution};

const COHORT_SIZES: [usize; 4] = [5, 10, 25, 50];

/// Draws `k` studies around sensitivity 0.8 and specificity 0.9, with
/// study-level jitter on both.
fn simulate_cohort(k: usize, seed: u64) -> BiomarkerCohort {
    let mut rng = StdRng::seed_from_u64(seed);
    let studies = (0..k)
        .map(|i| {
            let diseased = rng.gen_range(30..150u64);
            let controls = rng.gen_range(30..150u64);
            let sens = (0.8_f64 + rng.gen_range(-0.1..0.1)).clamp(0.05, 0.95);
            let spec = (0.9_f64 + rng.gen_range(-0.06..0.06)).clamp(0.05, 0.95);
            let tp = Binomial::new(diseased, sens).map_or(diseased / 2, |d| d.sample(&mut rng));
            let tn = Binomial::new(controls, spec).map_or(controls / 2, |d| d.sample(&mut rng));
            StudyRecord::new(
                format!("S{:03}", i),
                "Simulated",
                TwoByTwo::new(tp, diseased - tp, controls - tn, tn),
                ReportingForm::RawCounts,
                Covariates::default(),
                0.5,
            )
        })
        .collect();
    BiomarkerCohort::new("Simulated", studies)
}

fn bench_pooling(c: &mut Criterion) {
    let config = AnalysisConfig::default();
    let mut group = c.benchmark_group("reml_pooling");
    for &k in &COHORT_SIZES {
        let cohort = simulate_cohort(k, 42);
        group.bench_with_input(BenchmarkId::from_parameter(k), &cohort, |b, cohort| {
            b.iter(|| pool_random_effects(black_box(cohort), &config))
        });
    }
    group.finish();
}

fn bench_sroc(c: &mut Criterion) {
    let config = AnalysisConfig {
        bootstrap_replicates: 200,
        ..AnalysisConfig::default()
    };
    let mut group = c.benchmark_group("sroc_bootstrap");
    group.sample_size(20);
    for &k in &COHORT_SIZES {
        let cohort = simulate_cohort(k, 7);
        group.bench_with_input(BenchmarkId::from_parameter(k), &cohort, |b, cohort| {
            b.iter(|| fit_sroc(black_box(cohort), &config))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pooling, bench_sroc);
criterion_main!(benches);
