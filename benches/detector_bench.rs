//! Benchmarks for the statistical core and the detectors
//!
//! Run with: cargo bench

use chrono::{DateTime, Duration, TimeZone, Utc};
use chronicle_patterns::config::MiningConfig;
use chronicle_patterns::detectors::{default_detectors, TemporalConfig, TemporalCorrelationDetector};
use chronicle_patterns::events::{EventGrouper, EventTimeline, EventType, HealthEvent};
use chronicle_patterns::stats::{self, SignificanceGate};
use chronicle_patterns::PatternDetector;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A day of logging: three meals, a mood check-in and an occasional symptom
fn create_test_events(days: i64) -> Vec<HealthEvent> {
    let foods = ["pasta", "salad", "rice", "eggs", "soup", "coffee"];
    let mut events = Vec::new();

    for day in 0..days {
        let midnight = start() + Duration::days(day);
        for (slot, hour) in [8, 12, 19].into_iter().enumerate() {
            let food = foods[((day as usize) * 3 + slot) % foods.len()];
            events.push(
                HealthEvent::new("bench", EventType::Meal, midnight + Duration::hours(hour))
                    .with("food", food),
            );
        }
        events.push(
            HealthEvent::new("bench", EventType::Mood, midnight + Duration::hours(21))
                .with("mood", if day % 3 == 0 { "low" } else { "ok" }),
        );
        if day % 2 == 0 {
            events.push(
                HealthEvent::new("bench", EventType::Symptom, midnight + Duration::hours(15))
                    .with("name", "tiredness")
                    .with("severity", 5.0),
            );
        }
    }
    events
}

fn bench_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("stats");

    group.bench_function("chi_square_2x2", |b| {
        let table = [[18.0, 2.0], [4.0, 66.0]];
        b.iter(|| stats::chi_square_test(black_box(&table)).unwrap())
    });

    let x: Vec<f64> = (0..500).map(|i| i as f64).collect();
    let y: Vec<f64> = x.iter().map(|v| v * 0.5 + (v * 0.37).sin() * 20.0).collect();
    group.bench_function("pearson_500", |b| {
        b.iter(|| stats::pearson_correlation(black_box(&x), black_box(&y)).unwrap())
    });

    group.bench_function("binomial_upper_tail", |b| {
        b.iter(|| stats::binomial_upper_tail(black_box(8), black_box(12), black_box(0.15)).unwrap())
    });

    group.finish();
}

fn bench_detectors(c: &mut Criterion) {
    let mut group = c.benchmark_group("detectors");
    let grouper = EventGrouper::default();
    let config = MiningConfig::default();

    for days in [30, 90, 180] {
        let events = create_test_events(days);
        let timeline = EventTimeline::build(&events, &grouper, chrono_tz::UTC);
        let until = start() + Duration::days(days + 1);
        group.throughput(Throughput::Elements(events.len() as u64));

        group.bench_with_input(BenchmarkId::new("timeline_build", days), &events, |b, events| {
            b.iter(|| EventTimeline::build(black_box(events), &grouper, chrono_tz::UTC))
        });

        let temporal =
            TemporalCorrelationDetector::new(TemporalConfig::default(), SignificanceGate::default());
        group.bench_with_input(BenchmarkId::new("temporal", days), &timeline, |b, timeline| {
            b.iter(|| temporal.detect(black_box(timeline), until))
        });

        let detectors = default_detectors(&config, None);
        group.bench_with_input(BenchmarkId::new("all_detectors", days), &timeline, |b, timeline| {
            b.iter(|| {
                detectors
                    .iter()
                    .map(|d| d.detect(black_box(timeline), until).len())
                    .sum::<usize>()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stats, bench_detectors);
criterion_main!(benches);
