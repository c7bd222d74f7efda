// Benchmark for sustained sample ingestion and display averaging
// Run with: cargo bench

use clockwatch_rs::config::{AveragingConfig, EngineConfig};
use clockwatch_rs::engine::Recorder;
use clockwatch_rs::engine::averaging::AveragingEngine;
use clockwatch_rs::protocol::{FrameDecoder, encode_frame};
use clockwatch_rs::sim::{Resonator, ResonatorConfig};
use clockwatch_rs::EncoderReading;
use criterion::{Criterion, criterion_group, criterion_main};

fn simulated_samples(n: usize) -> Vec<EncoderReading> {
    let mut resonator = Resonator::new(ResonatorConfig {
        channel_interval_secs: None,
        ..ResonatorConfig::default()
    });
    (0..n).map(|_| resonator.next_sample()).collect()
}

fn bench_ingest(c: &mut Criterion) {
    let samples = simulated_samples(100_000);
    c.bench_function("ingest 100k simulated samples", |b| {
        b.iter(|| {
            let mut recorder = Recorder::new(EngineConfig::default());
            for sample in &samples {
                recorder.ingest(sample);
            }
            assert!(recorder.period() > 0.0);
        });
    });
}

fn bench_ingest_with_averaging(c: &mut Criterion) {
    let samples = simulated_samples(100_000);
    let settings = AveragingConfig {
        enabled: true,
        ..AveragingConfig::default()
    };
    c.bench_function("ingest 100k samples, averaging every 100", |b| {
        b.iter(|| {
            let mut recorder = Recorder::new(EngineConfig::default());
            let mut averaging = AveragingEngine::new(&settings);
            for (i, sample) in samples.iter().enumerate() {
                recorder.ingest(sample);
                if i % 100 == 0 {
                    averaging.update(recorder.history(), &settings);
                }
            }
        });
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frames: Vec<[u8; 5]> = (0..100_000u32).map(|i| encode_frame(i * 250, i % 7 != 0)).collect();
    c.bench_function("decode 100k frames", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let decoded = frames.iter().filter(|f| decoder.decode(f).is_ok()).count();
            assert_eq!(decoded, 100_000);
        });
    });
}

criterion_group!(benches, bench_ingest, bench_ingest_with_averaging, bench_frame_decode);
criterion_main!(benches);
