use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use userspace_exporter::aggregate::Aggregator;
use userspace_exporter::attach::ActiveAttachment;
use userspace_exporter::collector::codec::{encode_sample, parse_sample, WireSample};
use userspace_exporter::collector::MetricSample;
use userspace_exporter::config::Config;
use userspace_exporter::export::render::{build_families, encode_text};

fn histogram_sample(pid: u32, value: u64) -> MetricSample {
    MetricSample {
        pid,
        probe: 0,
        labels: Vec::new(),
        value,
        timestamp_ns: 123_456_789,
    }
}

fn counter_sample(pid: u32, gen: u8) -> MetricSample {
    MetricSample {
        pid,
        probe: 1,
        labels: vec![gen.to_string()],
        value: 1,
        timestamp_ns: 123_456_789,
    }
}

fn populated_aggregator() -> Aggregator {
    let catalog = Arc::new(Config::default().catalog().expect("default catalog"));
    let agg = Aggregator::new(catalog);

    for i in 0..64u32 {
        let pid = 4_000 + i;
        for j in 0..128u64 {
            agg.record(&histogram_sample(pid, j * 1_009));
        }
        for gen in 0..3u8 {
            agg.record(&counter_sample(pid, gen));
        }
    }

    agg
}

fn bench_parse_sample(c: &mut Criterion) {
    let data = encode_sample(&WireSample {
        timestamp_ns: 123_456_789,
        value: 42_000,
        pid: 1337,
        probe_id: 0,
        label: 0,
    });

    c.bench_function("codec/parse_sample", |b| {
        b.iter(|| parse_sample(black_box(&data)).expect("parse sample"))
    });
}

fn bench_record(c: &mut Criterion) {
    let catalog = Arc::new(Config::default().catalog().expect("default catalog"));
    let agg = Aggregator::new(catalog);
    let histogram = histogram_sample(1337, 250_000);
    let counter = counter_sample(1337, 2);

    c.bench_function("aggregator/record_histogram", |b| {
        b.iter(|| agg.record(black_box(&histogram)))
    });

    c.bench_function("aggregator/record_counter", |b| {
        b.iter(|| agg.record(black_box(&counter)))
    });
}

fn bench_render(c: &mut Criterion) {
    let catalog = Config::default().catalog().expect("default catalog");
    let agg = populated_aggregator();
    let registry = prometheus::Registry::new();

    let active: Vec<ActiveAttachment> = (0..64u32)
        .flat_map(|i| {
            [
                ActiveAttachment {
                    pid: 4_000 + i,
                    probe: 0,
                    name: "malloc_latency".into(),
                },
                ActiveAttachment {
                    pid: 4_000 + i,
                    probe: 1,
                    name: "gc_total".into(),
                },
            ]
        })
        .collect();

    c.bench_function("render/64_pids", |b| {
        b.iter(|| {
            let snapshot = agg.snapshot();
            let families = build_families(black_box(&catalog), black_box(&active), &snapshot);
            let text = encode_text(&families, &registry).expect("encode");
            black_box(text.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_sample(c);
    bench_record(c);
    bench_render(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
