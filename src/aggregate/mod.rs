//! Per-process metric aggregation.
//!
//! State is sharded by pid so high event rates on one process do not
//! contend with snapshots or with recording for other processes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::{Catalog, ProbeId, ProbeKind};
use crate::collector::MetricSample;

/// Number of pid shards. Each shard has its own lock.
const SHARD_COUNT: usize = 16;

/// Cumulative histogram for one (pid, probe).
///
/// `buckets[i]` counts all samples ≤ `boundaries[i]`; the `+Inf` bucket is
/// implicit and always equals `count`.
#[derive(Debug, Clone)]
pub struct HistogramState {
    boundaries: Arc<[u64]>,
    buckets: Vec<u64>,
    count: u64,
    sum: u64,
}

impl HistogramState {
    fn new(boundaries: Arc<[u64]>) -> Self {
        let buckets = vec![0; boundaries.len()];
        Self {
            boundaries,
            buckets,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, value: u64) {
        // First bucket whose boundary holds the value; every cumulative
        // bucket from there up is incremented.
        let idx = self.boundaries.partition_point(|b| *b < value);
        for bucket in &mut self.buckets[idx..] {
            *bucket += 1;
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
    }
}

#[derive(Default)]
struct PidMetrics {
    histograms: HashMap<ProbeId, HistogramState>,
    counters: HashMap<ProbeId, HashMap<Vec<String>, u64>>,
}

/// Snapshot of one histogram, detached from live state.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    pub pid: u32,
    pub probe: ProbeId,
    pub boundaries: Arc<[u64]>,
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum: u64,
}

/// Snapshot of one counter series, detached from live state.
#[derive(Debug, Clone)]
pub struct CounterSnapshot {
    pub pid: u32,
    pub probe: ProbeId,
    pub labels: Vec<String>,
    pub value: u64,
}

/// Immutable view of all aggregated state, safe to render while recording
/// continues on other keys. Entries are sorted by (probe, pid, labels) for
/// deterministic exposition output.
#[derive(Debug, Default)]
pub struct MetricsSnapshot {
    pub histograms: Vec<HistogramSnapshot>,
    pub counters: Vec<CounterSnapshot>,
}

/// Aggregates samples into per-(pid, probe) histogram and counter state.
pub struct Aggregator {
    catalog: Arc<Catalog>,
    shards: Vec<RwLock<HashMap<u32, PidMetrics>>>,
}

impl Aggregator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self { catalog, shards }
    }

    fn shard(&self, pid: u32) -> &RwLock<HashMap<u32, PidMetrics>> {
        &self.shards[pid as usize % SHARD_COUNT]
    }

    /// Record one sample. Histogram probes update every cumulative bucket
    /// whose boundary holds the value plus count and sum; counter probes add
    /// the sample value as a delta to the (pid, probe, labels) series.
    /// State for a key is created on its first sample.
    pub fn record(&self, sample: &MetricSample) {
        let Some(def) = self.catalog.get(sample.probe) else {
            return;
        };

        let mut shard = self.shard(sample.pid).write();
        let pid_metrics = shard.entry(sample.pid).or_default();

        match &def.kind {
            ProbeKind::LatencyHistogram { boundaries } => {
                pid_metrics
                    .histograms
                    .entry(sample.probe)
                    .or_insert_with(|| HistogramState::new(Arc::clone(boundaries)))
                    .record(sample.value);
            }
            ProbeKind::Counter => {
                let series = pid_metrics.counters.entry(sample.probe).or_default();
                match series.get_mut(sample.labels.as_slice()) {
                    Some(v) => *v += sample.value,
                    None => {
                        series.insert(sample.labels.clone(), sample.value);
                    }
                }
            }
        }
    }

    /// Remove all state for a pid. Invoked by the attachment manager when
    /// the process's attachments are torn down.
    pub fn drop_pid(&self, pid: u32) {
        self.shard(pid).write().remove(&pid);
    }

    /// Owned snapshot of all current state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();

        for shard in &self.shards {
            let shard = shard.read();
            for (pid, metrics) in shard.iter() {
                for (probe, h) in &metrics.histograms {
                    snap.histograms.push(HistogramSnapshot {
                        pid: *pid,
                        probe: *probe,
                        boundaries: Arc::clone(&h.boundaries),
                        buckets: h.buckets.clone(),
                        count: h.count,
                        sum: h.sum,
                    });
                }
                for (probe, series) in &metrics.counters {
                    for (labels, value) in series {
                        snap.counters.push(CounterSnapshot {
                            pid: *pid,
                            probe: *probe,
                            labels: labels.clone(),
                            value: *value,
                        });
                    }
                }
            }
        }

        snap.histograms.sort_by_key(|h| (h.probe, h.pid));
        snap.counters
            .sort_by(|a, b| (a.probe, a.pid, &a.labels).cmp(&(b.probe, b.pid, &b.labels)));

        snap
    }
}
