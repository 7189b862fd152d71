//! Replays synthetic scrapes of a request latency histogram through an analyzer.
//!
//! Run with `cargo run --example replay -- [BIT_BOUNDARIES] [SCRAPES]`, e.g. `-- 0 50` to search
//! for the cheapest scheme over 50 scrapes, or `-- 7,9,12,32` to cost Gorilla's scheme.
use std::collections::BTreeMap;

use metrics::{Key, Label};
use metrics_delta_analyzer::{AnalyzerBuilder, BucketSpan, HistogramSnapshot};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use tracing::info;

const RESOLUTION: u8 = 10;
const ZERO_THRESHOLD: f64 = 1e-6;

/// A sparse histogram that accumulates observations, the way an instrumented process would.
#[derive(Default)]
struct Histogram {
    zero_count: u64,
    positive: BTreeMap<i32, i64>,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        if value <= ZERO_THRESHOLD {
            self.zero_count += 1;
            return;
        }
        let index = (value.log10() * f64::from(RESOLUTION)).ceil() as i32;
        *self.positive.entry(index).or_default() += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut spans: Vec<BucketSpan> = Vec::new();
        let mut deltas = Vec::with_capacity(self.positive.len());
        let mut previous: Option<i32> = None;
        let mut running = self.zero_count as i64;

        for (&index, &count) in &self.positive {
            match previous {
                Some(p) if index == p + 1 => {
                    if let Some(span) = spans.last_mut() {
                        span.length += 1;
                    }
                }
                Some(p) => spans.push(BucketSpan::new(index - p - 1, 1)),
                None => spans.push(BucketSpan::new(index, 1)),
            }
            deltas.push(count - running);
            running = count;
            previous = Some(index);
        }

        HistogramSnapshot::new(RESOLUTION, ZERO_THRESHOLD, self.zero_count)
            .with_positive(spans, deltas)
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let boundaries = args.next().unwrap_or_default();
    let scrapes: usize = args.next().map_or(20, |s| s.parse().expect("scrape count must be a number"));

    let analyzer = AnalyzerBuilder::default()
        .with_bit_boundaries_str(&boundaries)
        .expect("failed to parse bit boundaries")
        .with_bucket_dump(true)
        .build()
        .expect("failed to build analyzer");

    let key = Key::from_parts("request_latency_seconds", vec![Label::new("endpoint", "/api")]);
    let mut rng = Xoshiro256StarStar::try_from_rng(&mut rand::rng()).unwrap();
    let mut histogram = Histogram::default();

    for scrape in 1..=scrapes {
        // Traffic varies between scrapes; latencies are log-uniform between 1ms and 10s, with
        // the occasional request answered from cache in no time at all.
        let requests = rng.random_range(200..400);
        for _ in 0..requests {
            if rng.random_bool(0.02) {
                histogram.observe(0.0);
            } else {
                histogram.observe(10f64.powf(rng.random_range(-3.0..1.0)));
            }
        }

        info!(scrape, requests, buckets = histogram.positive.len(), "Scraped histogram.");

        let snapshot = histogram.snapshot();
        if scrape < scrapes {
            analyzer.track(&key, &snapshot).expect("synthetic snapshot is well-formed");
        } else {
            let report = analyzer.scrape(&key, &snapshot).expect("failed to analyze histogram");
            println!("{report}");
        }
    }
}
