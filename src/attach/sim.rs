//! Simulated attach backend.
//!
//! Stands in for the kernel backend in tests and in builds without the
//! `bpf` feature: attaches succeed instantly unless a failure has been
//! scripted, and captured events are injected through the same sample path
//! the kernel backend uses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{AttachBackend, AttachError};
use crate::catalog::{ProbeDefinition, ProbeId};
use crate::collector::SampleSink;

#[derive(Default)]
struct SimShared {
    attach_delay: parking_lot::Mutex<Option<Duration>>,
    /// Scripted failures, keyed by (pid, probe name); consumed on attach.
    failures: parking_lot::Mutex<HashMap<(u32, String), AttachError>>,
    /// Sinks for currently attached (pid, probe) pairs.
    active: parking_lot::Mutex<HashMap<(u32, ProbeId), SampleSink>>,
    attach_attempts: AtomicU64,
}

/// Deterministic in-process attach backend.
#[derive(Default)]
pub struct SimBackend {
    shared: Arc<SimShared>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for scripting behavior and injecting samples from outside.
    pub fn controller(&self) -> SimController {
        SimController {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Test-side handle to a [`SimBackend`].
#[derive(Clone)]
pub struct SimController {
    shared: Arc<SimShared>,
}

impl SimController {
    /// Script the next attach of (pid, probe name) to fail with the given
    /// error.
    pub fn fail_next(&self, pid: u32, probe_name: &str, err: AttachError) {
        self.shared
            .failures
            .lock()
            .insert((pid, probe_name.to_string()), err);
    }

    /// Delay every attach by the given duration, opening the window in
    /// which a disappearance can race an in-flight attach.
    pub fn set_attach_delay(&self, delay: Duration) {
        *self.shared.attach_delay.lock() = Some(delay);
    }

    /// Inject one captured event for an attached (pid, probe). Returns
    /// false if the attachment does not exist, mirroring a probe that can
    /// no longer fire.
    pub fn emit(&self, pid: u32, probe: ProbeId, label: u8, value: u64, timestamp_ns: u64) -> bool {
        let sink = {
            let active = self.shared.active.lock();
            match active.get(&(pid, probe)) {
                Some(sink) => sink.clone(),
                None => return false,
            }
        };

        sink.deliver_event(pid, probe, label, value, timestamp_ns);
        true
    }

    pub fn is_attached(&self, pid: u32, probe: ProbeId) -> bool {
        self.shared.active.lock().contains_key(&(pid, probe))
    }

    pub fn attach_attempts(&self) -> u64 {
        self.shared.attach_attempts.load(Ordering::Relaxed)
    }
}

/// Token representing one simulated attachment.
#[derive(Debug)]
pub struct SimAttachment {
    key: (u32, ProbeId),
}

impl AttachBackend for SimBackend {
    type Attachment = SimAttachment;

    async fn attach(
        &self,
        pid: u32,
        probe_id: ProbeId,
        probe: Arc<ProbeDefinition>,
        sink: SampleSink,
    ) -> Result<SimAttachment, AttachError> {
        self.shared.attach_attempts.fetch_add(1, Ordering::Relaxed);

        let delay = *self.shared.attach_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .shared
            .failures
            .lock()
            .remove(&(pid, probe.name.to_string()));
        if let Some(err) = scripted {
            return Err(err);
        }

        let key = (pid, probe_id);
        self.shared.active.lock().insert(key, sink);

        Ok(SimAttachment { key })
    }

    async fn detach(&self, _pid: u32, attachment: SimAttachment) {
        self.shared.active.lock().remove(&attachment.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::config::test_catalog;
    use crate::export::health::HealthMetrics;

    fn sink() -> (SampleSink, Arc<HealthMetrics>) {
        let catalog = Arc::new(test_catalog());
        let health = Arc::new(HealthMetrics::new().expect("health metrics"));
        let collector = Collector::new(catalog, Arc::clone(&health), 2, 64);
        (collector.sink(), health)
    }

    #[tokio::test]
    async fn test_attach_then_emit_then_detach() {
        let backend = SimBackend::new();
        let controller = backend.controller();
        let (sink, health) = sink();
        let catalog = test_catalog();
        let (_, probe) = catalog.by_name("test_latency").expect("probe");

        let attachment = backend
            .attach(10, 0, Arc::clone(probe), sink)
            .await
            .expect("attach");

        assert!(controller.emit(10, 0, 0, 123, 0));
        assert_eq!(health.samples_received.get() as u64, 1);

        backend.detach(10, attachment).await;
        assert!(!controller.emit(10, 0, 0, 123, 0));
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let backend = SimBackend::new();
        let controller = backend.controller();
        let (sink, _health) = sink();
        let catalog = test_catalog();
        let (_, probe) = catalog.by_name("test_latency").expect("probe");

        controller.fail_next(10, "test_latency", AttachError::PermissionDenied);

        let err = backend
            .attach(10, 0, Arc::clone(probe), sink.clone())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "permission_denied");

        // The script is consumed; the next attempt succeeds.
        backend
            .attach(10, 0, Arc::clone(probe), sink)
            .await
            .expect("attach succeeds after scripted failure consumed");
    }
}
