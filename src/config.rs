use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::catalog::{AttachTarget, Catalog, ProbeDefinition, ProbeKind, ProcessMatch};

/// Top-level configuration for the exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Scrape endpoint configuration.
    #[serde(default)]
    pub exposition: ExpositionConfig,

    /// Process discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Sample collection configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Probe catalog. Loaded once at startup; not reloadable.
    #[serde(default = "default_probes")]
    pub probes: Vec<ProbeConfig>,

    /// Maximum time to spend tearing down attachments on shutdown.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Kernel backend configuration (used with the `bpf` feature).
    #[serde(default)]
    #[allow(dead_code)]
    pub bpf: BpfConfig,
}

/// Scrape endpoint configuration.
#[derive(Debug, Deserialize)]
pub struct ExpositionConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_exposition_addr")]
    pub addr: String,
}

/// Process discovery configuration.
#[derive(Debug, Deserialize)]
pub struct DiscoveryConfig {
    /// Reconciliation interval. Default: 5s.
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Process names to discover by scanning /proc. When empty, the union
    /// of the catalog's process matchers is used.
    #[serde(default)]
    pub process_names: Vec<String>,

    /// Cgroup v2 path containing target processes.
    #[serde(default)]
    pub cgroup_path: String,
}

/// Sample collection configuration.
#[derive(Debug, Deserialize)]
pub struct CollectorConfig {
    /// Number of pid shards, each with its own bounded channel and
    /// consumer task. Default: 8.
    #[serde(default = "default_collector_shards")]
    pub shards: usize,

    /// Per-shard channel capacity. Producers drop samples once a shard is
    /// full. Default: 8192.
    #[serde(default = "default_collector_capacity")]
    pub channel_capacity: usize,
}

/// Kernel backend configuration.
#[derive(Debug, Default, Deserialize)]
pub struct BpfConfig {
    /// Path to the compiled BPF object with one program per probe.
    #[serde(default)]
    #[allow(dead_code)]
    pub object: String,
}

/// Metric behavior of a configured probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKindConfig {
    LatencyHistogram,
    Counter,
}

/// One probe catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Program name, exposed as the `name` label of `enabled_programs`.
    pub name: String,

    /// Exposed metric base name. Defaults to the program name.
    #[serde(default)]
    pub metric: String,

    /// Help text for the metric family.
    #[serde(default)]
    pub help: String,

    pub kind: ProbeKindConfig,

    /// Attach target: `uprobe:<library>:<symbol>` or `usdt:<provider>:<probe>`.
    pub target: String,

    /// Label schema beyond the implicit `pid` label.
    #[serde(default)]
    pub labels: Vec<String>,

    /// Ascending finite bucket boundaries in nanoseconds. Histograms only;
    /// the `+Inf` bucket is implicit.
    #[serde(default)]
    pub buckets: Vec<u64>,

    /// Process names this probe attaches to.
    #[serde(default)]
    pub processes: Vec<String>,

    /// Also attach to processes discovered through the configured cgroup.
    #[serde(default)]
    pub match_cgroup: bool,
}

/// The builtin catalog: malloc latency for redis-style targets and CPython
/// garbage collections for gunicorn-style targets.
fn default_probes() -> Vec<ProbeConfig> {
    vec![
        ProbeConfig {
            name: "malloc_latency".to_string(),
            metric: "malloc_latency_nanoseconds".to_string(),
            help: "Latency of malloc calls in the target process".to_string(),
            kind: ProbeKindConfig::LatencyHistogram,
            target: "uprobe:libc:malloc".to_string(),
            labels: Vec::new(),
            buckets: power_of_two_buckets(),
            processes: vec!["redis-server".to_string()],
            match_cgroup: false,
        },
        ProbeConfig {
            name: "gc_total".to_string(),
            metric: "gc".to_string(),
            help: "Garbage collections completed, by generation".to_string(),
            kind: ProbeKindConfig::Counter,
            target: "usdt:python:gc__done".to_string(),
            labels: vec!["gen".to_string()],
            buckets: Vec::new(),
            processes: vec![
                "python".to_string(),
                "python3".to_string(),
                "gunicorn".to_string(),
            ],
            match_cgroup: false,
        },
    ]
}

/// 32 finite power-of-two boundaries (2^0 .. 2^31 ns); with the implicit
/// `+Inf` bucket a pid renders 33 bucket lines.
pub fn power_of_two_buckets() -> Vec<u64> {
    (0..32).map(|i| 1u64 << i).collect()
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exposition_addr() -> String {
    ":8080".to_string()
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_collector_shards() -> usize {
    8
}

fn default_collector_capacity() -> usize {
    8192
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            exposition: ExpositionConfig::default(),
            discovery: DiscoveryConfig::default(),
            collector: CollectorConfig::default(),
            probes: default_probes(),
            shutdown_timeout: default_shutdown_timeout(),
            bpf: BpfConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: default_discovery_interval(),
            process_names: Vec::new(),
            cgroup_path: String::new(),
        }
    }
}

impl Default for ExpositionConfig {
    fn default() -> Self {
        Self {
            addr: default_exposition_addr(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            shards: default_collector_shards(),
            channel_capacity: default_collector_capacity(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration. Violations are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.discovery.interval.is_zero() {
            bail!("discovery.interval must be positive");
        }
        if self.collector.shards == 0 {
            bail!("collector.shards must be positive");
        }
        if self.collector.channel_capacity == 0 {
            bail!("collector.channel_capacity must be positive");
        }
        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be positive");
        }

        // The catalog builder enforces per-probe invariants.
        self.catalog().map(|_| ())
    }

    /// Build the immutable probe catalog from the configured entries.
    pub fn catalog(&self) -> Result<Catalog> {
        let mut probes = Vec::with_capacity(self.probes.len());

        for p in &self.probes {
            let target = AttachTarget::parse(&p.target)
                .with_context(|| format!("probe {:?}", p.name))?;

            let kind = match p.kind {
                ProbeKindConfig::LatencyHistogram => {
                    if p.buckets.is_empty() {
                        bail!("histogram probe {:?} requires bucket boundaries", p.name);
                    }
                    ProbeKind::LatencyHistogram {
                        boundaries: Arc::from(p.buckets.as_slice()),
                    }
                }
                ProbeKindConfig::Counter => {
                    if !p.buckets.is_empty() {
                        bail!("counter probe {:?} must not define buckets", p.name);
                    }
                    ProbeKind::Counter
                }
            };

            let metric = if p.metric.is_empty() {
                p.name.clone()
            } else {
                p.metric.clone()
            };

            probes.push(ProbeDefinition {
                name: p.name.as_str().into(),
                metric,
                help: p.help.clone(),
                kind,
                target,
                labels: p.labels.clone(),
                matcher: ProcessMatch {
                    process_names: p.processes.clone(),
                    match_cgroup: p.match_cgroup,
                },
            });
        }

        Catalog::new(probes)
    }
}

/// Small fixed catalog used by unit tests across the crate: one histogram
/// probe with three boundaries and one labeled counter probe.
#[cfg(test)]
pub fn test_catalog() -> Catalog {
    Catalog::new(vec![
        ProbeDefinition {
            name: "test_latency".into(),
            metric: "test_latency_nanoseconds".to_string(),
            help: String::new(),
            kind: ProbeKind::LatencyHistogram {
                boundaries: Arc::from([1_000u64, 10_000, 100_000]),
            },
            target: AttachTarget::Uprobe {
                library: "libc".to_string(),
                symbol: "malloc".to_string(),
            },
            labels: Vec::new(),
            matcher: ProcessMatch {
                process_names: vec!["test-target".to_string()],
                match_cgroup: false,
            },
        },
        ProbeDefinition {
            name: "test_counter".into(),
            metric: "test_events".to_string(),
            help: String::new(),
            kind: ProbeKind::Counter,
            target: AttachTarget::Usdt {
                provider: "python".to_string(),
                probe: "gc__done".to_string(),
            },
            labels: vec!["gen".to_string()],
            matcher: ProcessMatch {
                process_names: vec!["test-target".to_string(), "counter-only".to_string()],
                match_cgroup: false,
            },
        },
    ])
    .expect("test catalog is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.exposition.addr, ":8080");
        assert_eq!(cfg.discovery.interval, Duration::from_secs(5));
        assert_eq!(cfg.collector.shards, 8);
        assert_eq!(cfg.collector.channel_capacity, 8192);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_default_catalog_shape() {
        let catalog = Config::default().catalog().expect("valid catalog");
        assert_eq!(catalog.len(), 2);

        let (_, malloc) = catalog.by_name("malloc_latency").expect("probe exists");
        assert_eq!(malloc.metric, "malloc_latency_nanoseconds");
        match &malloc.kind {
            ProbeKind::LatencyHistogram { boundaries } => {
                assert_eq!(boundaries.len(), 32);
                assert_eq!(boundaries[0], 1);
                assert_eq!(boundaries[31], 1 << 31);
            }
            ProbeKind::Counter => panic!("malloc_latency must be a histogram"),
        }

        let (_, gc) = catalog.by_name("gc_total").expect("probe exists");
        assert_eq!(gc.metric, "gc");
        assert_eq!(gc.labels, vec!["gen"]);
    }

    #[test]
    fn test_load_yaml_config() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
exposition:
  addr: "127.0.0.1:9435"
discovery:
  interval: 2s
  process_names: [redis-server]
probes:
  - name: malloc_latency
    metric: malloc_latency_nanoseconds
    kind: latency_histogram
    target: uprobe:libc:malloc
    buckets: [1000, 10000, 100000]
    processes: [redis-server]
"#
        )
        .expect("write config");

        let cfg = Config::load(file.path()).expect("valid config");
        assert_eq!(cfg.exposition.addr, "127.0.0.1:9435");
        assert_eq!(cfg.discovery.interval, Duration::from_secs(2));
        assert_eq!(cfg.probes.len(), 1);
    }

    #[test]
    fn test_histogram_requires_buckets() {
        let mut cfg = Config::default();
        cfg.probes[0].buckets.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("requires bucket boundaries"));
    }

    #[test]
    fn test_counter_rejects_buckets() {
        let mut cfg = Config::default();
        cfg.probes[1].buckets = vec![1, 2, 3];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must not define buckets"));
    }

    #[test]
    fn test_invalid_target_rejected() {
        let mut cfg = Config::default();
        cfg.probes[0].target = "tracepoint:syscalls:sys_enter_openat".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("invalid attach target"));
    }

    #[test]
    fn test_zero_shards_rejected() {
        let mut cfg = Config::default();
        cfg.collector.shards = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("collector.shards"));
    }

    #[test]
    fn test_metric_defaults_to_probe_name() {
        let mut cfg = Config::default();
        cfg.probes[0].metric = String::new();
        let catalog = cfg.catalog().expect("valid catalog");
        let (_, probe) = catalog.by_name("malloc_latency").expect("probe exists");
        assert_eq!(probe.metric, "malloc_latency");
    }
}
