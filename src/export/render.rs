//! Rendering of attachment and aggregation state into Prometheus metric
//! families.
//!
//! Families are built as protobuf const-metrics and serialized with the
//! text encoder, so every scrape is a pure function of the snapshot taken
//! at request time. Nothing here mutates metric state.

use prometheus::proto;
use prometheus::{Encoder, Registry, TextEncoder};

use crate::aggregate::MetricsSnapshot;
use crate::attach::ActiveAttachment;
use crate::catalog::{Catalog, ProbeId, ProbeKind, NAMESPACE};

/// Build the exposition families for the current attachment set and metric
/// snapshot.
///
/// A family appears only when at least one attachment of its probe is
/// active somewhere and at least one sample has been recorded; detached
/// pids were already dropped from the snapshot.
pub fn build_families(
    catalog: &Catalog,
    active: &[ActiveAttachment],
    snap: &MetricsSnapshot,
) -> Vec<proto::MetricFamily> {
    let mut families = Vec::with_capacity(1 + catalog.len());

    if let Some(enabled) = enabled_programs_family(active) {
        families.push(enabled);
    }

    for (id, probe) in catalog.probes() {
        if !active.iter().any(|a| a.probe == id) {
            continue;
        }

        let family = match &probe.kind {
            ProbeKind::LatencyHistogram { .. } => histogram_family(id, probe, snap),
            ProbeKind::Counter => counter_family(id, probe, snap),
        };

        if let Some(family) = family {
            families.push(family);
        }
    }

    families
}

/// Serialize dynamic families plus the health registry into the Prometheus
/// text format.
pub fn encode_text(
    families: &[proto::MetricFamily],
    registry: &Registry,
) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::with_capacity(4096);

    encoder.encode(families, &mut buffer)?;
    encoder.encode(&registry.gather(), &mut buffer)?;

    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics output is not valid UTF-8: {e}")))
}

/// One gauge sample with value 1 per currently active attachment.
fn enabled_programs_family(active: &[ActiveAttachment]) -> Option<proto::MetricFamily> {
    if active.is_empty() {
        return None;
    }

    let mut sorted: Vec<&ActiveAttachment> = active.iter().collect();
    sorted.sort_by(|a, b| (&a.name, a.pid).cmp(&(&b.name, b.pid)));

    let mut family = proto::MetricFamily::default();
    family.set_name(format!("{NAMESPACE}_enabled_programs"));
    family.set_help("The set of enabled programs".to_string());
    family.set_field_type(proto::MetricType::GAUGE);

    for attachment in sorted {
        let mut metric = proto::Metric::default();
        metric.mut_label().push(label_pair("name", &attachment.name));
        metric
            .mut_label()
            .push(label_pair("pid", &attachment.pid.to_string()));

        let mut gauge = proto::Gauge::default();
        gauge.set_value(1.0);
        metric.set_gauge(gauge);

        family.mut_metric().push(metric);
    }

    Some(family)
}

/// One histogram per pid. Buckets carry the finite boundaries; the text
/// encoder emits the trailing `+Inf` bucket from the sample count, which
/// keeps the `+Inf == count` invariant structural.
fn histogram_family(
    id: ProbeId,
    probe: &crate::catalog::ProbeDefinition,
    snap: &MetricsSnapshot,
) -> Option<proto::MetricFamily> {
    let entries: Vec<_> = snap.histograms.iter().filter(|h| h.probe == id).collect();
    if entries.is_empty() {
        return None;
    }

    let mut family = proto::MetricFamily::default();
    family.set_name(probe.family_name());
    family.set_help(help_text(probe));
    family.set_field_type(proto::MetricType::HISTOGRAM);

    for entry in entries {
        let mut metric = proto::Metric::default();
        metric
            .mut_label()
            .push(label_pair("pid", &entry.pid.to_string()));

        let mut histogram = proto::Histogram::default();
        histogram.set_sample_count(entry.count);
        histogram.set_sample_sum(entry.sum as f64);

        for (boundary, cumulative) in entry.boundaries.iter().zip(entry.buckets.iter()) {
            let mut bucket = proto::Bucket::default();
            bucket.set_upper_bound(*boundary as f64);
            bucket.set_cumulative_count(*cumulative);
            histogram.mut_bucket().push(bucket);
        }

        metric.set_histogram(histogram);
        family.mut_metric().push(metric);
    }

    Some(family)
}

/// One counter sample per (pid, label set).
fn counter_family(
    id: ProbeId,
    probe: &crate::catalog::ProbeDefinition,
    snap: &MetricsSnapshot,
) -> Option<proto::MetricFamily> {
    let entries: Vec<_> = snap.counters.iter().filter(|c| c.probe == id).collect();
    if entries.is_empty() {
        return None;
    }

    let mut family = proto::MetricFamily::default();
    family.set_name(probe.family_name());
    family.set_help(help_text(probe));
    family.set_field_type(proto::MetricType::COUNTER);

    for entry in entries {
        let mut metric = proto::Metric::default();
        metric
            .mut_label()
            .push(label_pair("pid", &entry.pid.to_string()));
        for (name, value) in probe.labels.iter().zip(entry.labels.iter()) {
            metric.mut_label().push(label_pair(name, value));
        }

        let mut counter = proto::Counter::default();
        counter.set_value(entry.value as f64);
        metric.set_counter(counter);

        family.mut_metric().push(metric);
    }

    Some(family)
}

fn help_text(probe: &crate::catalog::ProbeDefinition) -> String {
    if probe.help.is_empty() {
        format!("Values captured by the {} probe", probe.name)
    } else {
        probe.help.clone()
    }
}

fn label_pair(name: &str, value: &str) -> proto::LabelPair {
    let mut pair = proto::LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::aggregate::Aggregator;
    use crate::collector::MetricSample;
    use crate::config::test_catalog;

    fn active(pid: u32, probe: ProbeId, name: &str) -> ActiveAttachment {
        ActiveAttachment {
            pid,
            probe,
            name: name.into(),
        }
    }

    fn record(agg: &Aggregator, pid: u32, probe: ProbeId, labels: &[&str], value: u64) {
        agg.record(&MetricSample {
            pid,
            probe,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            value,
            timestamp_ns: 0,
        });
    }

    fn render(
        catalog: &Catalog,
        active: &[ActiveAttachment],
        agg: &Aggregator,
    ) -> String {
        let registry = Registry::new();
        let families = build_families(catalog, active, &agg.snapshot());
        encode_text(&families, &registry).expect("encode")
    }

    #[test]
    fn test_enabled_programs_line_per_active_attachment() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        let text = render(
            &catalog,
            &[active(1337, 0, "test_latency")],
            &agg,
        );

        assert!(text.contains(
            "userspace_exporter_enabled_programs{name=\"test_latency\",pid=\"1337\"} 1"
        ));
        assert_eq!(text.matches("enabled_programs{").count(), 1);
    }

    #[test]
    fn test_no_active_attachments_renders_no_families() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        record(&agg, 1, 0, &[], 100);

        let text = render(&catalog, &[], &agg);
        assert!(!text.contains("enabled_programs"));
        assert!(!text.contains("test_latency_nanoseconds"));
    }

    #[test]
    fn test_histogram_buckets_count_sum_lines() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        record(&agg, 42, 0, &[], 500);
        record(&agg, 42, 0, &[], 5_000);
        record(&agg, 42, 0, &[], 500_000);

        let text = render(&catalog, &[active(42, 0, "test_latency")], &agg);

        // Three finite boundaries plus the +Inf line.
        assert!(text.contains(
            "userspace_exporter_test_latency_nanoseconds_bucket{pid=\"42\",le=\"1000\"} 1"
        ));
        assert!(text.contains(
            "userspace_exporter_test_latency_nanoseconds_bucket{pid=\"42\",le=\"10000\"} 2"
        ));
        assert!(text.contains(
            "userspace_exporter_test_latency_nanoseconds_bucket{pid=\"42\",le=\"100000\"} 2"
        ));
        assert!(text.contains(
            "userspace_exporter_test_latency_nanoseconds_bucket{pid=\"42\",le=\"+Inf\"} 3"
        ));
        assert!(text.contains("userspace_exporter_test_latency_nanoseconds_count{pid=\"42\"} 3"));
        assert!(text.contains("userspace_exporter_test_latency_nanoseconds_sum{pid=\"42\"} 505500"));
    }

    #[test]
    fn test_inf_bucket_equals_count() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        for i in 0..250u64 {
            record(&agg, 9, 0, &[], i * 997);
        }

        let text = render(&catalog, &[active(9, 0, "test_latency")], &agg);
        assert!(text.contains("_bucket{pid=\"9\",le=\"+Inf\"} 250"));
        assert!(text.contains("_count{pid=\"9\"} 250"));
    }

    #[test]
    fn test_counter_family_with_schema_labels() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        record(&agg, 7, 1, &["0"], 3);
        record(&agg, 7, 1, &["2"], 1);
        record(&agg, 8, 1, &["1"], 4);

        let text = render(
            &catalog,
            &[active(7, 1, "test_counter"), active(8, 1, "test_counter")],
            &agg,
        );

        assert!(text.contains("# TYPE userspace_exporter_test_events counter"));
        assert!(text.contains("userspace_exporter_test_events{pid=\"7\",gen=\"0\"} 3"));
        assert!(text.contains("userspace_exporter_test_events{pid=\"7\",gen=\"2\"} 1"));
        assert!(text.contains("userspace_exporter_test_events{pid=\"8\",gen=\"1\"} 4"));
    }

    #[test]
    fn test_family_absent_without_active_attachment_of_that_probe() {
        let catalog = test_catalog();
        let agg = Aggregator::new(Arc::new(test_catalog()));
        record(&agg, 7, 1, &["0"], 3);

        // Only the histogram probe is attached; the counter family must be
        // absent even though the aggregator still holds counter state.
        let text = render(&catalog, &[active(42, 0, "test_latency")], &agg);
        assert!(!text.contains("userspace_exporter_test_events"));
    }

    #[test]
    fn test_health_registry_shares_endpoint() {
        let health = crate::export::health::HealthMetrics::new().expect("health metrics");
        health.samples_received.inc();

        let text = encode_text(&[], health.registry()).expect("encode");
        assert!(text.contains("userspace_exporter_samples_received_total 1"));
    }
}
