pub mod codec;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aggregate::Aggregator;
use crate::catalog::{Catalog, ProbeDefinition, ProbeId};
use crate::export::health::HealthMetrics;

use self::codec::parse_sample;

/// One captured event from an active attachment. Ephemeral: consumed by the
/// aggregator and never retained.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub pid: u32,
    pub probe: ProbeId,
    /// Label values aligned with the probe's label schema.
    pub labels: Vec<String>,
    pub value: u64,
    pub timestamp_ns: u64,
}

/// Read-only view of attachment liveness, implemented by the attachment
/// manager. Consumers gate on it so samples racing a detach are dropped
/// instead of resurrecting state for a dead pid.
pub trait ActiveLookup: Send + Sync {
    fn is_active(&self, pid: u32, probe: ProbeId) -> bool;
}

/// Producer-side handle for delivering samples into the collector.
///
/// Cheap to clone; shared with every attachment backend. Delivery never
/// blocks: a full shard channel drops the sample and counts it.
#[derive(Clone)]
pub struct SampleSink {
    catalog: Arc<Catalog>,
    shards: Arc<[mpsc::Sender<MetricSample>]>,
    health: Arc<HealthMetrics>,
}

impl SampleSink {
    /// Deliver an already-resolved sample. Non-blocking.
    pub fn deliver(&self, sample: MetricSample) {
        self.health.samples_received.inc();

        let shard = sample.pid as usize % self.shards.len();
        if self.shards[shard].try_send(sample).is_err() {
            self.health.samples_dropped.inc();
        }
    }

    /// Resolve an event against the catalog's label schema and deliver it.
    pub fn deliver_event(
        &self,
        pid: u32,
        probe: ProbeId,
        label: u8,
        value: u64,
        timestamp_ns: u64,
    ) {
        let Some(def) = self.catalog.get(probe) else {
            self.health.sample_decode_errors.inc();
            return;
        };

        self.deliver(MetricSample {
            pid,
            probe,
            labels: label_values(def, label),
            value,
            timestamp_ns,
        });
    }

    /// Decode a raw wire record and deliver it. Malformed records are
    /// dropped and counted; they never affect other samples.
    pub fn deliver_raw(&self, data: &[u8]) {
        let wire = match parse_sample(data) {
            Ok(w) => w,
            Err(e) => {
                self.health.sample_decode_errors.inc();
                debug!(error = %e, "dropping malformed sample");
                return;
            }
        };

        let probe = wire.probe_id as ProbeId;
        if self.catalog.get(probe).is_none() {
            self.health.sample_decode_errors.inc();
            debug!(probe_id = wire.probe_id, "dropping sample for unknown probe");
            return;
        }

        self.deliver_event(wire.pid, probe, wire.label, wire.value, wire.timestamp_ns);
    }
}

fn label_values(def: &ProbeDefinition, label: u8) -> Vec<String> {
    if def.labels.is_empty() {
        Vec::new()
    } else {
        vec![label.to_string()]
    }
}

/// Routes captured samples to the aggregator through bounded per-pid-shard
/// channels, so one busy process cannot starve delivery for others and
/// producers never block. Per-(pid, probe) ordering holds because a pid
/// always maps to the same shard.
pub struct Collector {
    senders: Arc<[mpsc::Sender<MetricSample>]>,
    receivers: Option<Vec<mpsc::Receiver<MetricSample>>>,
    catalog: Arc<Catalog>,
    health: Arc<HealthMetrics>,
}

impl Collector {
    pub fn new(
        catalog: Arc<Catalog>,
        health: Arc<HealthMetrics>,
        shard_count: usize,
        channel_capacity: usize,
    ) -> Self {
        let mut senders = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);

        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(channel_capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        Self {
            senders: senders.into(),
            receivers: Some(receivers),
            catalog,
            health,
        }
    }

    pub fn sink(&self) -> SampleSink {
        SampleSink {
            catalog: Arc::clone(&self.catalog),
            shards: Arc::clone(&self.senders),
            health: Arc::clone(&self.health),
        }
    }

    /// Spawn one consumer task per shard. Each consumer drains its channel
    /// until cancellation, recording samples whose attachment is still
    /// active and silently dropping the rest.
    pub fn start(
        &mut self,
        active: Arc<dyn ActiveLookup>,
        aggregator: Arc<Aggregator>,
        cancel: CancellationToken,
    ) {
        let receivers = match self.receivers.take() {
            Some(r) => r,
            None => return,
        };

        for mut rx in receivers {
            let active = Arc::clone(&active);
            let aggregator = Arc::clone(&aggregator);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sample = rx.recv() => {
                            let Some(sample) = sample else { return };
                            if active.is_active(sample.pid, sample.probe) {
                                aggregator.record(&sample);
                            }
                        }
                    }
                }
            });
        }
    }
}
