//! Attachment lifecycle management.
//!
//! Each (pid, probe) pair owns one attachment moving through
//! pending → active → detached, or pending → failed. The registry is
//! sharded by pid; attach and detach for one pid are serialized behind a
//! per-pid mutex while distinct pids proceed concurrently. A failure is
//! local to its (pid, probe): it is logged once, excluded from further
//! attempts for that pid, and never affects other attachments.

pub mod sim;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::aggregate::Aggregator;
use crate::catalog::{Catalog, ProbeDefinition, ProbeId};
use crate::collector::{ActiveLookup, SampleSink};
use crate::discovery::ProcessTags;
use crate::export::health::HealthMetrics;

/// Number of pid shards in the registry.
const SHARD_COUNT: usize = 16;

/// Why an attachment could not be established. Terminal for that
/// (pid, probe): a later sighting of a different pid is unaffected.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("target symbol not found: {0}")]
    SymbolMissing(String),

    #[error("insufficient privilege to attach")]
    PermissionDenied,

    #[error("target process exited during attach")]
    TargetVanished,

    #[error("{0}")]
    Backend(String),
}

impl AttachError {
    /// Stable label value for the attach_failures metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SymbolMissing(_) => "symbol_missing",
            Self::PermissionDenied => "permission_denied",
            Self::TargetVanished => "target_vanished",
            Self::Backend(_) => "backend",
        }
    }
}

/// Lifecycle state of one (pid, probe) attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Pending,
    Active,
    Detached,
    Failed,
}

/// Performs the kernel-assisted attach and detach operations.
///
/// Implementations may block on kernel-level setup; the manager calls them
/// from per-pid tasks, never from the sample hot path.
pub trait AttachBackend: Send + Sync + 'static {
    /// Live kernel-side resources backing one attachment; released by
    /// [`AttachBackend::detach`].
    type Attachment: Send + 'static;

    fn attach(
        &self,
        pid: u32,
        probe_id: ProbeId,
        probe: Arc<ProbeDefinition>,
        sink: SampleSink,
    ) -> impl Future<Output = Result<Self::Attachment, AttachError>> + Send;

    fn detach(
        &self,
        pid: u32,
        attachment: Self::Attachment,
    ) -> impl Future<Output = ()> + Send;
}

/// One currently active attachment, as rendered into `enabled_programs`.
#[derive(Debug, Clone)]
pub struct ActiveAttachment {
    pub pid: u32,
    pub probe: ProbeId,
    pub name: Arc<str>,
}

/// Read view of the active-attachment set, consumed by the exposition
/// server. Never blocks on in-flight attach or detach operations.
pub trait AttachmentView: Send + Sync {
    fn active_attachments(&self) -> Vec<ActiveAttachment>;
}

enum Slot<T> {
    Pending,
    Active(T),
    Detached,
    Failed,
}

impl<T> Slot<T> {
    fn state(&self) -> AttachState {
        match self {
            Self::Pending => AttachState::Pending,
            Self::Active(_) => AttachState::Active,
            Self::Detached => AttachState::Detached,
            Self::Failed => AttachState::Failed,
        }
    }
}

struct PidEntry<T> {
    /// Serializes attach/detach operations for this pid.
    ops: tokio::sync::Mutex<()>,
    /// Set when the process disappears; checked before committing an
    /// attach result, so a pid vanishing mid-attach ends detached.
    gone: AtomicBool,
    slots: parking_lot::Mutex<HashMap<ProbeId, Slot<T>>>,
}

impl<T> PidEntry<T> {
    fn new() -> Self {
        Self {
            ops: tokio::sync::Mutex::new(()),
            gone: AtomicBool::new(false),
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

/// Maps (pid, probe) pairs to attachment state and drives transitions.
pub struct AttachmentManager<B: AttachBackend> {
    backend: B,
    catalog: Arc<Catalog>,
    aggregator: Arc<Aggregator>,
    sink: SampleSink,
    health: Arc<HealthMetrics>,
    shards: Vec<parking_lot::Mutex<HashMap<u32, Arc<PidEntry<B::Attachment>>>>>,
}

impl<B: AttachBackend> AttachmentManager<B> {
    pub fn new(
        backend: B,
        catalog: Arc<Catalog>,
        aggregator: Arc<Aggregator>,
        sink: SampleSink,
        health: Arc<HealthMetrics>,
    ) -> Arc<Self> {
        let shards = (0..SHARD_COUNT)
            .map(|_| parking_lot::Mutex::new(HashMap::new()))
            .collect();

        Arc::new(Self {
            backend,
            catalog,
            aggregator,
            sink,
            health,
            shards,
        })
    }

    fn shard(&self, pid: u32) -> &parking_lot::Mutex<HashMap<u32, Arc<PidEntry<B::Attachment>>>> {
        &self.shards[pid as usize % SHARD_COUNT]
    }

    /// Handle a process appearance. Idempotent: probes already holding a
    /// slot for this pid (in any state, including failed) are skipped.
    pub async fn process_appeared(&self, pid: u32, tags: &ProcessTags) {
        let entry = {
            let mut pids = self.shard(pid).lock();
            match pids.get(&pid) {
                Some(e) if !e.gone.load(Ordering::Acquire) => Arc::clone(e),
                _ => {
                    // Unknown pid, or a stale entry mid-teardown after fast
                    // pid reuse: start a fresh epoch.
                    let entry = Arc::new(PidEntry::new());
                    pids.insert(pid, Arc::clone(&entry));
                    entry
                }
            }
        };

        let mut new_probes: Vec<(ProbeId, Arc<ProbeDefinition>)> = Vec::new();
        {
            let mut slots = entry.slots.lock();
            for (id, probe) in self.catalog.matching(tags) {
                if !slots.contains_key(&id) {
                    slots.insert(id, Slot::Pending);
                    new_probes.push((id, Arc::clone(probe)));
                }
            }
        }

        if new_probes.is_empty() {
            return;
        }

        let _op = entry.ops.lock().await;

        for (id, probe) in new_probes {
            if entry.gone.load(Ordering::Acquire) {
                set_slot(&entry, id, Slot::Detached);
                continue;
            }

            let result = self
                .backend
                .attach(pid, id, Arc::clone(&probe), self.sink.clone())
                .await;

            match result {
                Ok(attachment) => {
                    if entry.gone.load(Ordering::Acquire) {
                        // The process vanished while the attach was in
                        // flight: release the resources and record detached.
                        self.backend.detach(pid, attachment).await;
                        set_slot(&entry, id, Slot::Detached);
                    } else {
                        set_slot(&entry, id, Slot::Active(attachment));
                        debug!(pid, probe = %probe.name, "attachment active");
                    }
                }
                Err(e) => {
                    warn!(
                        pid,
                        probe = %probe.name,
                        error = %e,
                        "attach failed; probe disabled for this pid",
                    );
                    self.health
                        .attach_failures
                        .with_label_values(&[e.reason()])
                        .inc();
                    set_slot(&entry, id, Slot::Failed);
                }
            }
        }
    }

    /// Handle a process disappearance. Unknown pids are a no-op. Tears
    /// down every attachment for the pid and drops its aggregated state.
    pub async fn process_disappeared(&self, pid: u32) {
        let entry = {
            let pids = self.shard(pid).lock();
            match pids.get(&pid) {
                Some(e) => Arc::clone(e),
                None => return,
            }
        };

        entry.gone.store(true, Ordering::Release);

        // Waits out any in-flight attach for this pid.
        let _op = entry.ops.lock().await;

        let handles: Vec<(ProbeId, B::Attachment)> = {
            let mut slots = entry.slots.lock();
            let mut handles = Vec::new();
            for (id, slot) in slots.iter_mut() {
                if let Slot::Active(attachment) = mem::replace(slot, Slot::Detached) {
                    handles.push((*id, attachment));
                }
            }
            handles
        };

        for (_, attachment) in handles {
            self.backend.detach(pid, attachment).await;
        }

        self.aggregator.drop_pid(pid);

        {
            let mut pids = self.shard(pid).lock();
            if let Some(current) = pids.get(&pid) {
                if Arc::ptr_eq(current, &entry) {
                    pids.remove(&pid);
                }
            }
        }

        debug!(pid, "attachments torn down");
    }

    /// Current state of one attachment, if the pid is known.
    pub fn attachment_state(&self, pid: u32, probe: ProbeId) -> Option<AttachState> {
        let entry = {
            let pids = self.shard(pid).lock();
            Arc::clone(pids.get(&pid)?)
        };
        let slots = entry.slots.lock();
        slots.get(&probe).map(Slot::state)
    }

    /// Tear down all attachments, bounded by the given timeout.
    pub async fn shutdown(self: &Arc<Self>, timeout: Duration) {
        let pids: Vec<u32> = self
            .shards
            .iter()
            .flat_map(|s| s.lock().keys().copied().collect::<Vec<_>>())
            .collect();

        if pids.is_empty() {
            return;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for pid in pids {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                manager.process_disappeared(pid).await;
            });
        }

        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("shutdown timed out before all attachments were detached");
        }
    }
}

fn set_slot<T>(entry: &PidEntry<T>, id: ProbeId, slot: Slot<T>) {
    entry.slots.lock().insert(id, slot);
}

impl<B: AttachBackend> AttachmentView for AttachmentManager<B> {
    fn active_attachments(&self) -> Vec<ActiveAttachment> {
        let mut active = Vec::new();

        for shard in &self.shards {
            let pids = shard.lock();
            for (pid, entry) in pids.iter() {
                if entry.gone.load(Ordering::Acquire) {
                    continue;
                }
                let slots = entry.slots.lock();
                for (id, slot) in slots.iter() {
                    if let Slot::Active(_) = slot {
                        if let Some(probe) = self.catalog.get(*id) {
                            active.push(ActiveAttachment {
                                pid: *pid,
                                probe: *id,
                                name: Arc::clone(&probe.name),
                            });
                        }
                    }
                }
            }
        }

        active
    }
}

impl<B: AttachBackend> ActiveLookup for AttachmentManager<B> {
    fn is_active(&self, pid: u32, probe: ProbeId) -> bool {
        let entry = {
            let pids = self.shard(pid).lock();
            match pids.get(&pid) {
                Some(e) => Arc::clone(e),
                None => return false,
            }
        };

        if entry.gone.load(Ordering::Acquire) {
            return false;
        }

        let slots = entry.slots.lock();
        matches!(slots.get(&probe), Some(Slot::Active(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimBackend;
    use super::*;
    use crate::collector::{Collector, MetricSample};
    use crate::config::test_catalog;

    struct Fixture {
        manager: Arc<AttachmentManager<SimBackend>>,
        controller: super::sim::SimController,
        aggregator: Arc<Aggregator>,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(test_catalog());
        let health = Arc::new(HealthMetrics::new().expect("health metrics"));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&catalog)));
        let collector = Collector::new(Arc::clone(&catalog), Arc::clone(&health), 4, 1024);

        let backend = SimBackend::new();
        let controller = backend.controller();

        let manager = AttachmentManager::new(
            backend,
            catalog,
            Arc::clone(&aggregator),
            collector.sink(),
            health,
        );

        Fixture {
            manager,
            controller,
            aggregator,
        }
    }

    fn tags(comm: &str) -> ProcessTags {
        ProcessTags {
            comm: comm.to_string(),
            from_cgroup: false,
        }
    }

    #[tokio::test]
    async fn test_appear_attaches_matching_probes() {
        let f = fixture();
        // "test-target" matches both test_catalog probes.
        f.manager.process_appeared(100, &tags("test-target")).await;

        assert_eq!(f.manager.attachment_state(100, 0), Some(AttachState::Active));
        assert_eq!(f.manager.attachment_state(100, 1), Some(AttachState::Active));
        assert!(f.manager.is_active(100, 0));

        let active = f.manager.active_attachments();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_appear_skips_non_matching_probes() {
        let f = fixture();
        // "counter-only" matches only the counter probe.
        f.manager.process_appeared(100, &tags("counter-only")).await;

        assert_eq!(f.manager.attachment_state(100, 0), None);
        assert_eq!(f.manager.attachment_state(100, 1), Some(AttachState::Active));
    }

    #[tokio::test]
    async fn test_appear_is_idempotent() {
        let f = fixture();
        f.manager.process_appeared(100, &tags("test-target")).await;
        f.manager.process_appeared(100, &tags("test-target")).await;

        assert_eq!(f.controller.attach_attempts(), 2);
        assert_eq!(f.manager.active_attachments().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_attach_is_not_retried() {
        let f = fixture();
        f.controller.fail_next(
            100,
            "test_latency",
            AttachError::SymbolMissing("malloc".to_string()),
        );

        f.manager.process_appeared(100, &tags("test-target")).await;
        assert_eq!(f.manager.attachment_state(100, 0), Some(AttachState::Failed));
        assert_eq!(f.manager.attachment_state(100, 1), Some(AttachState::Active));
        assert!(!f.manager.is_active(100, 0));

        // A repeat appearance must not attempt the failed probe again.
        let attempts = f.controller.attach_attempts();
        f.manager.process_appeared(100, &tags("test-target")).await;
        assert_eq!(f.controller.attach_attempts(), attempts);
        assert_eq!(f.manager.attachment_state(100, 0), Some(AttachState::Failed));
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_one_pid() {
        let f = fixture();
        f.controller.fail_next(
            100,
            "test_latency",
            AttachError::PermissionDenied,
        );

        f.manager.process_appeared(100, &tags("test-target")).await;
        f.manager.process_appeared(200, &tags("test-target")).await;

        assert_eq!(f.manager.attachment_state(100, 0), Some(AttachState::Failed));
        assert_eq!(f.manager.attachment_state(200, 0), Some(AttachState::Active));
    }

    #[tokio::test]
    async fn test_disappear_detaches_and_drops_state() {
        let f = fixture();
        f.manager.process_appeared(100, &tags("test-target")).await;

        f.aggregator.record(&MetricSample {
            pid: 100,
            probe: 0,
            labels: Vec::new(),
            value: 1_000,
            timestamp_ns: 0,
        });
        assert_eq!(f.aggregator.snapshot().histograms.len(), 1);

        f.manager.process_disappeared(100).await;

        assert!(f.manager.active_attachments().is_empty());
        assert!(!f.controller.is_attached(100, 0));
        assert!(f.aggregator.snapshot().histograms.is_empty());
        // The pid entry is gone entirely.
        assert_eq!(f.manager.attachment_state(100, 0), None);
    }

    #[tokio::test]
    async fn test_disappear_unknown_pid_is_noop() {
        let f = fixture();
        f.manager.process_disappeared(4242).await;
        assert!(f.manager.active_attachments().is_empty());
    }

    #[tokio::test]
    async fn test_disappear_during_attach_ends_detached() {
        let f = fixture();
        f.controller.set_attach_delay(Duration::from_millis(50));

        let manager = Arc::clone(&f.manager);
        let appear = tokio::spawn(async move {
            manager.process_appeared(100, &tags("test-target")).await;
        });

        // Let the attach get in flight, then report the process gone.
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.manager.process_disappeared(100).await;
        appear.await.expect("appear task");

        assert!(f.manager.active_attachments().is_empty());
        assert!(!f.controller.is_attached(100, 0));
        assert!(!f.controller.is_attached(100, 1));
    }

    #[tokio::test]
    async fn test_shutdown_detaches_everything() {
        let f = fixture();
        f.manager.process_appeared(100, &tags("test-target")).await;
        f.manager.process_appeared(200, &tags("counter-only")).await;
        assert_eq!(f.manager.active_attachments().len(), 3);

        f.manager.shutdown(Duration::from_secs(1)).await;
        assert!(f.manager.active_attachments().is_empty());
    }
}
