//! The probe catalog: the fixed set of named instrumentation points this
//! exporter knows how to attach.
//!
//! Loaded once at startup from configuration and immutable afterwards.
//! Each probe's metric behavior is selected here, at load time, so the
//! hot path dispatches on a plain enum instead of inspecting types.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::discovery::ProcessTags;

/// Prometheus namespace for every exposed metric family.
pub const NAMESPACE: &str = "userspace_exporter";

/// Index of a probe within the catalog. Stable for the process lifetime.
pub type ProbeId = usize;

/// How a probe binds to a function inside the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Entry/return uprobe on a symbol in a shared library mapped by the target.
    Uprobe { library: String, symbol: String },
    /// USDT tracepoint compiled into the target binary or runtime.
    Usdt { provider: String, probe: String },
}

impl AttachTarget {
    /// Parse a target spec string: `uprobe:<library>:<symbol>` or
    /// `usdt:<provider>:<probe>`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        let first = parts.next();
        let second = parts.next();

        match (kind, first, second) {
            ("uprobe", Some(library), Some(symbol)) if !library.is_empty() && !symbol.is_empty() => {
                Ok(Self::Uprobe {
                    library: library.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            ("usdt", Some(provider), Some(probe)) if !provider.is_empty() && !probe.is_empty() => {
                Ok(Self::Usdt {
                    provider: provider.to_string(),
                    probe: probe.to_string(),
                })
            }
            _ => bail!("invalid attach target {spec:?} (expected uprobe:<lib>:<symbol> or usdt:<provider>:<probe>)"),
        }
    }
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uprobe { library, symbol } => write!(f, "uprobe:{library}:{symbol}"),
            Self::Usdt { provider, probe } => write!(f, "usdt:{provider}:{probe}"),
        }
    }
}

/// Metric behavior of a probe, fixed at catalog load time.
#[derive(Debug, Clone)]
pub enum ProbeKind {
    /// Cumulative latency histogram. Boundaries are ascending, finite
    /// nanosecond values; the `+Inf` bucket is implicit.
    LatencyHistogram { boundaries: Arc<[u64]> },
    /// Monotonic counter, incremented by the sample value.
    Counter,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LatencyHistogram { .. } => "latency_histogram",
            Self::Counter => "counter",
        }
    }
}

/// Which processes a probe applies to, matched against discovery tags.
#[derive(Debug, Clone, Default)]
pub struct ProcessMatch {
    /// Executable comm names this probe attaches to.
    pub process_names: Vec<String>,
    /// Also match processes discovered through the configured cgroup.
    pub match_cgroup: bool,
}

impl ProcessMatch {
    pub fn matches(&self, tags: &ProcessTags) -> bool {
        if self.match_cgroup && tags.from_cgroup {
            return true;
        }
        self.process_names.iter().any(|n| n == &tags.comm)
    }

    pub fn is_empty(&self) -> bool {
        self.process_names.is_empty() && !self.match_cgroup
    }
}

/// A named instrumentation point. Immutable after catalog load.
#[derive(Debug, Clone)]
pub struct ProbeDefinition {
    /// Program name, used as the `name` label of `enabled_programs`.
    pub name: Arc<str>,
    /// Exposed metric base name, prefixed with [`NAMESPACE`] at render time.
    pub metric: String,
    /// Help text for the metric family.
    pub help: String,
    pub kind: ProbeKind,
    pub target: AttachTarget,
    /// Label schema beyond the implicit `pid` label. At most one entry:
    /// the wire sample format carries a single label ordinal.
    pub labels: Vec<String>,
    pub matcher: ProcessMatch,
}

impl ProbeDefinition {
    /// Full metric family name, e.g. `userspace_exporter_gc`.
    pub fn family_name(&self) -> String {
        format!("{NAMESPACE}_{}", self.metric)
    }
}

/// The immutable set of probes loaded at startup.
#[derive(Debug)]
pub struct Catalog {
    probes: Vec<Arc<ProbeDefinition>>,
}

impl Catalog {
    /// Build a catalog from validated definitions.
    ///
    /// Enforces: at least one probe, unique names, valid metric names,
    /// ascending histogram boundaries, label schema width, and a non-empty
    /// matcher per probe. Violations are configuration errors and fatal.
    pub fn new(probes: Vec<ProbeDefinition>) -> Result<Self> {
        if probes.is_empty() {
            bail!("probe catalog is empty");
        }

        for (i, probe) in probes.iter().enumerate() {
            if probe.name.is_empty() {
                bail!("probe #{i} has an empty name");
            }
            if !is_valid_metric_name(&probe.metric) {
                bail!("probe {:?} has invalid metric name {:?}", probe.name, probe.metric);
            }
            if probe.labels.len() > 1 {
                bail!(
                    "probe {:?} declares {} labels; the sample format carries at most one",
                    probe.name,
                    probe.labels.len()
                );
            }
            if probe.matcher.is_empty() {
                bail!("probe {:?} matches no processes", probe.name);
            }

            if let ProbeKind::LatencyHistogram { boundaries } = &probe.kind {
                if boundaries.is_empty() {
                    bail!("histogram probe {:?} has no bucket boundaries", probe.name);
                }
                if !boundaries.windows(2).all(|w| w[0] < w[1]) {
                    bail!(
                        "histogram probe {:?} has non-ascending bucket boundaries",
                        probe.name
                    );
                }
            }

            for other in &probes[..i] {
                if other.name == probe.name {
                    bail!("duplicate probe name {:?}", probe.name);
                }
            }
        }

        Ok(Self {
            probes: probes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn probes(&self) -> impl Iterator<Item = (ProbeId, &Arc<ProbeDefinition>)> {
        self.probes.iter().enumerate()
    }

    pub fn get(&self, id: ProbeId) -> Option<&Arc<ProbeDefinition>> {
        self.probes.get(id)
    }

    pub fn by_name(&self, name: &str) -> Option<(ProbeId, &Arc<ProbeDefinition>)> {
        self.probes
            .iter()
            .enumerate()
            .find(|(_, p)| &*p.name == name)
    }

    /// Probes whose matcher accepts the given process tags.
    pub fn matching<'a>(
        &'a self,
        tags: &'a ProcessTags,
    ) -> impl Iterator<Item = (ProbeId, &'a Arc<ProbeDefinition>)> {
        self.probes
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.matcher.matches(tags))
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

/// Prometheus metric name charset: `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
