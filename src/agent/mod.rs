use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregate::Aggregator;
use crate::attach::AttachmentManager;
use crate::catalog::Catalog;
use crate::collector::Collector;
use crate::config::Config;
use crate::discovery::{Discovery, ProcDiscovery, ProcessEvent, Reconciler};
use crate::export::health::HealthMetrics;
use crate::export::ExpositionServer;

#[cfg(feature = "bpf")]
type Backend = crate::attach::bpf::KernelBackend;
#[cfg(not(feature = "bpf"))]
type Backend = crate::attach::sim::SimBackend;

/// Agent orchestrates all components: discovery, attachment manager,
/// collector, aggregator, and the exposition server.
pub struct Agent {
    cfg: Config,
    catalog: Arc<Catalog>,
    health: Arc<HealthMetrics>,
    aggregator: Arc<Aggregator>,
    manager: Arc<AttachmentManager<Backend>>,
    server: ExpositionServer,
    collector: Option<Collector>,
    cancel: CancellationToken,
}

impl Agent {
    /// Wire up all components. Configuration errors are fatal here; nothing
    /// has started yet.
    pub fn new(cfg: Config) -> Result<Self> {
        let catalog = Arc::new(cfg.catalog().context("building probe catalog")?);
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&catalog)));

        let collector = Collector::new(
            Arc::clone(&catalog),
            Arc::clone(&health),
            cfg.collector.shards,
            cfg.collector.channel_capacity,
        );
        let sink = collector.sink();

        let cancel = CancellationToken::new();

        #[cfg(feature = "bpf")]
        let backend = {
            if cfg.bpf.object.is_empty() {
                anyhow::bail!("bpf.object is required when built with the bpf feature");
            }
            Backend::new(
                std::path::Path::new(&cfg.bpf.object),
                sink.clone(),
                cancel.child_token(),
            )
            .context("initializing kernel attach backend")?
        };

        #[cfg(not(feature = "bpf"))]
        let backend = {
            warn!("built without the bpf feature; using the simulated attach backend");
            Backend::new()
        };

        let manager = AttachmentManager::new(
            backend,
            Arc::clone(&catalog),
            Arc::clone(&aggregator),
            sink,
            Arc::clone(&health),
        );

        let server = ExpositionServer::new(
            &cfg.exposition.addr,
            Arc::clone(&catalog),
            Arc::clone(&aggregator),
            Arc::clone(&manager) as Arc<dyn crate::attach::AttachmentView>,
            Arc::clone(&health),
        );

        Ok(Self {
            cfg,
            catalog,
            health,
            aggregator,
            manager,
            server,
            collector: Some(collector),
            cancel,
        })
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Exposition server first, so scrapes respond from the start.
        self.server.start().await.context("starting exposition server")?;

        // 2. Collector consumers.
        if let Some(mut collector) = self.collector.take() {
            collector.start(
                Arc::clone(&self.manager) as Arc<dyn crate::collector::ActiveLookup>,
                Arc::clone(&self.aggregator),
                self.cancel.child_token(),
            );
        }

        // 3. Discovery reconciliation loop.
        self.spawn_discovery_loop();

        info!(probes = self.catalog.len(), "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components. Attachments are torn down
    /// best-effort, bounded by the configured shutdown timeout.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        self.manager.shutdown(self.cfg.shutdown_timeout).await;

        self.server.stop().await?;

        Ok(())
    }

    /// Spawn the periodic discovery loop. The first tick fires
    /// immediately; scan failures are logged and retried next tick.
    fn spawn_discovery_loop(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let manager = Arc::clone(&self.manager);
        let disc = ProcDiscovery::new(&self.cfg.discovery, &self.catalog);
        let interval = self.cfg.discovery.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut reconciler = Reconciler::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let start = Instant::now();

                        let procs = match disc.discover() {
                            Ok(procs) => procs,
                            Err(e) => {
                                warn!(error = %e, "discovery scan failed");
                                health.discovery_errors.inc();
                                continue;
                            }
                        };

                        health.pids_tracked.set(procs.len() as f64);

                        for event in reconciler.reconcile(&procs) {
                            let manager = Arc::clone(&manager);
                            match event {
                                ProcessEvent::Appeared { pid, tags } => {
                                    tokio::spawn(async move {
                                        manager.process_appeared(pid, &tags).await;
                                    });
                                }
                                ProcessEvent::Disappeared { pid } => {
                                    tokio::spawn(async move {
                                        manager.process_disappeared(pid).await;
                                    });
                                }
                            }
                        }

                        health.discovery_duration.observe(start.elapsed().as_secs_f64());
                    }
                }
            }
        });
    }
}
