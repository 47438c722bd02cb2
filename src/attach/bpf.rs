//! Kernel-assisted attach backend.
//!
//! Implements [`AttachBackend`] using aya to manage eBPF uprobe programs.
//! All code is gated behind `#[cfg(feature = "bpf")]`; builds without the
//! feature fall back to the simulated backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::UProbe;
use aya::Ebpf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AttachBackend, AttachError};
use crate::catalog::{AttachTarget, ProbeDefinition, ProbeId};
use crate::collector::SampleSink;

/// Ring buffer poll interval when no samples are pending.
const POLL_INTERVAL_MS: u64 = 10;

/// Name of the sample ring buffer map in the BPF object.
const SAMPLES_MAP: &str = "SAMPLES";

/// Kernel resources backing one attachment: the uprobe links created for
/// the (pid, probe) pair.
pub struct KernelAttachment {
    program: Arc<str>,
    links: Vec<UProbeLinkId>,
}

/// aya-backed attach backend reading captured samples from the BPF ring
/// buffer map and feeding them to the collector.
pub struct KernelBackend {
    ebpf: tokio::sync::Mutex<Ebpf>,
    loaded: parking_lot::Mutex<HashSet<String>>,
}

impl KernelBackend {
    /// Load the BPF object and start the ring buffer reader.
    ///
    /// The object must define one uprobe program per catalog probe, named
    /// after the probe, plus the `SAMPLES` ring buffer map.
    pub fn new(object_path: &Path, sink: SampleSink, cancel: CancellationToken) -> Result<Self> {
        bump_memlock_rlimit();

        let mut ebpf = Ebpf::load_file(object_path)
            .with_context(|| format!("loading BPF object {}", object_path.display()))?;

        let samples_map = ebpf
            .take_map(SAMPLES_MAP)
            .with_context(|| format!("{SAMPLES_MAP} map not found in BPF object"))?;
        let ring_buf = RingBuf::try_from(samples_map).context("creating sample ring buffer")?;

        spawn_reader(ring_buf, sink, cancel);

        Ok(Self {
            ebpf: tokio::sync::Mutex::new(ebpf),
            loaded: parking_lot::Mutex::new(HashSet::new()),
        })
    }
}

impl AttachBackend for KernelBackend {
    type Attachment = KernelAttachment;

    async fn attach(
        &self,
        pid: u32,
        _probe_id: ProbeId,
        probe: Arc<ProbeDefinition>,
        _sink: SampleSink,
    ) -> Result<KernelAttachment, AttachError> {
        let (library, symbol) = match &probe.target {
            AttachTarget::Uprobe { library, symbol } => (library.clone(), symbol.clone()),
            // TODO: parse the target's stapsdt ELF notes for the probe
            // address instead of treating the USDT name as a symbol.
            AttachTarget::Usdt { provider, probe } => (provider.clone(), probe.clone()),
        };

        let target_path = resolve_library_path(pid, &library)
            .ok_or_else(|| AttachError::SymbolMissing(format!("{library} not mapped by {pid}")))?;

        let mut ebpf = self.ebpf.lock().await;

        let program: &mut UProbe = ebpf
            .program_mut(&probe.name)
            .ok_or_else(|| {
                AttachError::Backend(format!("program {} not found in BPF object", probe.name))
            })?
            .try_into()
            .map_err(|e| AttachError::Backend(format!("program {}: {e}", probe.name)))?;

        {
            let mut loaded = self.loaded.lock();
            if !loaded.contains(&*probe.name) {
                program
                    .load()
                    .map_err(|e| AttachError::Backend(format!("loading {}: {e}", probe.name)))?;
                loaded.insert(probe.name.to_string());
            }
        }

        let link = program
            .attach(Some(&symbol), 0, &target_path, Some(pid as i32))
            .map_err(|e| map_attach_error(&symbol, pid, e))?;

        debug!(pid, probe = %probe.name, target = %target_path.display(), "uprobe attached");

        Ok(KernelAttachment {
            program: Arc::clone(&probe.name),
            links: vec![link],
        })
    }

    async fn detach(&self, pid: u32, attachment: KernelAttachment) {
        let mut ebpf = self.ebpf.lock().await;

        let program: &mut UProbe = match ebpf
            .program_mut(&attachment.program)
            .and_then(|p| p.try_into().ok())
        {
            Some(p) => p,
            None => return,
        };

        for link in attachment.links {
            if let Err(e) = program.detach(link) {
                warn!(pid, program = %attachment.program, error = %e, "uprobe detach failed");
            }
        }
    }
}

/// Classify an aya attach failure into the attach error taxonomy.
fn map_attach_error(symbol: &str, pid: u32, e: aya::programs::ProgramError) -> AttachError {
    let text = e.to_string();

    if text.contains("symbol") || text.contains("not found") {
        return AttachError::SymbolMissing(symbol.to_string());
    }
    if text.contains("EPERM") || text.contains("EACCES") || text.contains("permission") {
        return AttachError::PermissionDenied;
    }
    if text.contains("ESRCH") || text.contains("No such process") {
        return AttachError::TargetVanished;
    }

    AttachError::Backend(format!("attaching {symbol} for pid {pid}: {text}"))
}

/// Resolve a library name to a host path mapped by the target process.
///
/// Scans `/proc/<pid>/maps` for a mapping whose file name starts with the
/// library name and resolves it through `/proc/<pid>/root` so containerized
/// targets attach against the correct filesystem.
fn resolve_library_path(pid: u32, library: &str) -> Option<PathBuf> {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps")).ok()?;

    for line in maps.lines() {
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }

        let file_name = Path::new(path).file_name()?.to_string_lossy();
        if file_name.starts_with(library) {
            let host_path = PathBuf::from(format!("/proc/{pid}/root")).join(&path[1..]);
            if host_path.exists() {
                return Some(host_path);
            }
            return Some(PathBuf::from(path));
        }
    }

    // The target may be a static binary exposing the symbol itself.
    let exe = PathBuf::from(format!("/proc/{pid}/exe"));
    exe.exists().then_some(exe)
}

/// Drain the ring buffer on a blocking worker until cancellation.
fn spawn_reader(mut ring_buf: RingBuf<aya::maps::MapData>, sink: SampleSink, cancel: CancellationToken) {
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                sink.deliver_raw(&item);
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
}

/// eBPF maps live in locked kernel memory; lift RLIMIT_MEMLOCK so loading
/// does not fail on conservative defaults.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("failed to raise RLIMIT_MEMLOCK");
    }
}
