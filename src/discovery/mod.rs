use std::collections::HashMap;

#[cfg(target_os = "linux")]
use anyhow::Context;
use anyhow::Result;
#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

use crate::config::DiscoveryConfig;

/// Classification tags for a discovered process, matched against the
/// catalog's process matchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTags {
    /// Executable name from `/proc/<pid>/comm`.
    pub comm: String,
    /// Whether the pid was found through the configured cgroup.
    pub from_cgroup: bool,
}

/// A process visible to the exporter at scan time.
#[derive(Debug, Clone)]
pub struct DiscoveredProcess {
    pub pid: u32,
    pub tags: ProcessTags,
}

/// Target process discovery.
pub trait Discovery: Send + Sync {
    /// Produce the current set of candidate target processes.
    fn discover(&self) -> Result<Vec<DiscoveredProcess>>;
}

/// Composite discovery combining `/proc` comm scanning and cgroup membership.
pub struct ProcDiscovery {
    process_names: Vec<String>,
    cgroup_path: String,
}

impl ProcDiscovery {
    /// Create a discovery source from config. When no process names are
    /// configured, the union of the catalog's matcher names is used so that
    /// every probe's targets are discoverable by default.
    pub fn new(cfg: &DiscoveryConfig, catalog: &crate::catalog::Catalog) -> Self {
        let process_names = if cfg.process_names.is_empty() {
            let mut names: Vec<String> = Vec::new();
            for (_, probe) in catalog.probes() {
                for name in &probe.matcher.process_names {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            names
        } else {
            cfg.process_names.clone()
        };

        Self {
            process_names,
            cgroup_path: cfg.cgroup_path.clone(),
        }
    }
}

impl Discovery for ProcDiscovery {
    #[cfg(target_os = "linux")]
    fn discover(&self) -> Result<Vec<DiscoveredProcess>> {
        use std::collections::HashSet;

        let mut seen = HashSet::with_capacity(64);
        let mut result = Vec::with_capacity(64);

        if !self.process_names.is_empty() {
            match discover_by_process_name(&self.process_names) {
                Ok(procs) => {
                    for p in procs {
                        if seen.insert(p.pid) {
                            result.push(p);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "process name discovery failed");
                }
            }
        }

        if !self.cgroup_path.is_empty() {
            match discover_by_cgroup(&self.cgroup_path) {
                Ok(procs) => {
                    for p in procs {
                        if seen.insert(p.pid) {
                            result.push(p);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cgroup discovery failed");
                }
            }
        }

        debug!(count = result.len(), "discovered target processes");

        Ok(result)
    }

    #[cfg(not(target_os = "linux"))]
    fn discover(&self) -> Result<Vec<DiscoveredProcess>> {
        warn!("process discovery is only supported on Linux");
        Ok(Vec::new())
    }
}

/// Scan /proc for processes whose comm matches one of the given names.
#[cfg(target_os = "linux")]
fn discover_by_process_name(names: &[String]) -> Result<Vec<DiscoveredProcess>> {
    use std::collections::HashSet;
    use std::fs;

    let name_set: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();

    let entries = fs::read_dir("/proc").context("reading /proc")?;

    let mut procs = Vec::with_capacity(16);

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let file_name = entry.file_name();
        let name_str = file_name.to_string_lossy();

        let pid: u32 = match name_str.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        // Processes can exit between readdir and the comm read; skip quietly.
        let comm = match read_proc_comm(pid) {
            Ok(c) => c,
            Err(_) => continue,
        };

        if name_set.contains(comm.as_str()) {
            debug!(pid, comm = %comm, "found matching process");
            procs.push(DiscoveredProcess {
                pid,
                tags: ProcessTags {
                    comm,
                    from_cgroup: false,
                },
            });
        }
    }

    Ok(procs)
}

/// Read PIDs from a cgroup v2 cgroup.procs file.
#[cfg(target_os = "linux")]
fn discover_by_cgroup(cgroup_path: &str) -> Result<Vec<DiscoveredProcess>> {
    use std::fs;
    use std::path::Path;

    let procs_path = Path::new(cgroup_path).join("cgroup.procs");
    let content = fs::read_to_string(&procs_path)
        .with_context(|| format!("reading {}", procs_path.display()))?;

    let mut procs = Vec::with_capacity(16);

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.parse::<u32>() {
            Ok(pid) => {
                let comm = read_proc_comm(pid).unwrap_or_default();
                procs.push(DiscoveredProcess {
                    pid,
                    tags: ProcessTags {
                        comm,
                        from_cgroup: true,
                    },
                });
            }
            Err(_) => {
                warn!(line, "non-numeric line in cgroup.procs");
            }
        }
    }

    Ok(procs)
}

/// Read /proc/<pid>/comm, returning the trimmed process name.
#[cfg(target_os = "linux")]
fn read_proc_comm(pid: u32) -> Result<String> {
    let path = format!("/proc/{pid}/comm");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(data.trim().to_string())
}

/// Lifecycle events derived from successive discovery scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Appeared { pid: u32, tags: ProcessTags },
    Disappeared { pid: u32 },
}

/// Diffs successive scans into appearance/disappearance events.
///
/// Re-sighting a known pid emits nothing; a pid absent from the scan is
/// reported gone exactly once. Short-lived processes that appear and vanish
/// between scans are never observed and leak no state.
#[derive(Default)]
pub struct Reconciler {
    known: HashMap<u32, ProcessTags>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&mut self, current: &[DiscoveredProcess]) -> Vec<ProcessEvent> {
        let mut events = Vec::new();

        let mut live: HashMap<u32, &ProcessTags> = HashMap::with_capacity(current.len());
        for p in current {
            live.insert(p.pid, &p.tags);
        }

        let gone: Vec<u32> = self
            .known
            .keys()
            .copied()
            .filter(|pid| !live.contains_key(pid))
            .collect();
        for pid in gone {
            self.known.remove(&pid);
            events.push(ProcessEvent::Disappeared { pid });
        }

        for p in current {
            if !self.known.contains_key(&p.pid) {
                self.known.insert(p.pid, p.tags.clone());
                events.push(ProcessEvent::Appeared {
                    pid: p.pid,
                    tags: p.tags.clone(),
                });
            }
        }

        events
    }

    pub fn is_known(&self, pid: u32) -> bool {
        self.known.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, comm: &str) -> DiscoveredProcess {
        DiscoveredProcess {
            pid,
            tags: ProcessTags {
                comm: comm.to_string(),
                from_cgroup: false,
            },
        }
    }

    #[test]
    fn test_reconciler_reports_new_pids_once() {
        let mut rec = Reconciler::new();

        let events = rec.reconcile(&[proc(100, "redis-server")]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProcessEvent::Appeared { pid: 100, .. }));

        // Re-sighting the same pid is idempotent.
        let events = rec.reconcile(&[proc(100, "redis-server")]);
        assert!(events.is_empty());
        assert!(rec.is_known(100));
    }

    #[test]
    fn test_reconciler_reports_disappearance() {
        let mut rec = Reconciler::new();
        rec.reconcile(&[proc(100, "redis-server"), proc(200, "gunicorn")]);

        let events = rec.reconcile(&[proc(200, "gunicorn")]);
        assert_eq!(events, vec![ProcessEvent::Disappeared { pid: 100 }]);
        assert!(!rec.is_known(100));
        assert!(rec.is_known(200));
    }

    #[test]
    fn test_reconciler_handles_churn_in_one_scan() {
        let mut rec = Reconciler::new();
        rec.reconcile(&[proc(100, "gunicorn")]);

        // 100 exits while 101 and 102 fork in.
        let events = rec.reconcile(&[proc(101, "gunicorn"), proc(102, "gunicorn")]);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&ProcessEvent::Disappeared { pid: 100 }));
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn test_reconciler_empty_scan_drains_all() {
        let mut rec = Reconciler::new();
        rec.reconcile(&[proc(1, "a"), proc(2, "b")]);

        let events = rec.reconcile(&[]);
        assert_eq!(events.len(), 2);
        assert!(rec.is_empty());

        // Disappearance of already-unknown pids produces nothing.
        let events = rec.reconcile(&[]);
        assert!(events.is_empty());
    }
}
