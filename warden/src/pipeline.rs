// warden/src/pipeline.rs
//
// Wires the stages together and owns their tasks.
//
//   detection loops ──► IntakeQueue ──► FusionStage ──mpsc──► PolicyStage ──mpsc──► Dispatcher
//        (1/category)     (bounded)       (single)               (single)           (1 worker/channel)
//                                             │                      │
//                                             └──► ThreatStore ◄─────┘
//
// Shutdown: the intake is closed and the watch signal raised. Loops stop at
// once, fusion discards open candidates, the policy task evaluates every
// Threat fusion already emitted, and the dispatcher drains what is queued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::detect::DetectionLoop;
use crate::engine::{FusionEngine, FusionStage, PolicyEngine, PolicyStage, SafeList};
use crate::events::{ActionType, AnomalyObservation, Category};
use crate::intake::IntakeQueue;
use crate::metrics::{health_loop, HealthSink, LogHealthSink, MetricsServer, MetricsSnapshot, PipelineMetrics};
use crate::notify::{build_channels, DeliveryError, Dispatcher, NotificationChannel, RetryPolicy};
use crate::response::{CommandEnforcer, Enforcer};
use crate::sampler::Sampler;
use crate::scorer::{RegistryError, Scorer, ScorerRegistry};
use crate::store::{Journal, ManualAction, ThreatQuery, ThreatStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no sampler registered for enabled category {0}")]
    MissingSampler(Category),
    #[error(transparent)]
    Channel(#[from] DeliveryError),
    #[error("journal: {0}")]
    Journal(String),
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct PipelineBuilder {
    config:   PipelineConfig,
    registry: Arc<ScorerRegistry>,
    samplers: BTreeMap<Category, Arc<dyn Sampler>>,
    enforcer: Option<Arc<dyn Enforcer>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    sink:     Arc<dyn HealthSink>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ScorerRegistry::new()),
            samplers: BTreeMap::new(),
            enforcer: None,
            channels: Vec::new(),
            sink:     Arc::new(LogHealthSink),
        }
    }

    /// Live registry. Scorers can still be added or replaced after start.
    pub fn registry(&self) -> Arc<ScorerRegistry> {
        self.registry.clone()
    }

    pub fn scorer(self, category: Category, scorer: Arc<dyn Scorer>) -> Result<Self, RegistryError> {
        self.registry.register(category, scorer)?;
        Ok(self)
    }

    pub fn sampler(mut self, category: Category, sampler: Arc<dyn Sampler>) -> Self {
        self.samplers.insert(category, sampler);
        self
    }

    pub fn enforcer(mut self, enforcer: Arc<dyn Enforcer>) -> Self {
        self.enforcer = Some(enforcer);
        self
    }

    /// Adds a channel. When none are added the configured channels are built.
    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn health_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate and spawn every stage. Configuration problems are fatal here
    /// and never surface later at runtime.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let config = self.config;
        config.validate()?;

        let enabled: Vec<Category> = config.detection.enabled().map(|(c, _)| c.clone()).collect();
        self.registry.validate(enabled.iter())?;
        if let Some(missing) = enabled.iter().find(|c| !self.samplers.contains_key(*c)) {
            return Err(PipelineError::MissingSampler(missing.clone()));
        }

        let channels = if self.channels.is_empty() {
            build_channels(&config.notification)?
        } else {
            self.channels
        };

        let metrics = PipelineMetrics::new();
        let intake = Arc::new(IntakeQueue::new(config.detection.intake_capacity));
        let journal = match config.store.journal_dir {
            Some(ref dir) => Some(Journal::spawn(dir).map_err(|e| PipelineError::Journal(e.to_string()))?),
            None => None,
        };
        let store = Arc::new(match journal {
            Some(ref j) => ThreatStore::with_journal(j),
            None => ThreatStore::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (threat_tx, threat_rx) = mpsc::unbounded_channel();
        let (note_tx, note_rx) = mpsc::unbounded_channel();

        // Dispatcher
        let dispatcher = Dispatcher::spawn(channels, RetryPolicy::from_config(&config.notification), metrics.clone());
        let dispatcher = tokio::spawn(dispatcher.run(note_rx));

        // Policy
        let enforcer = self
            .enforcer
            .unwrap_or_else(|| Arc::new(CommandEnforcer::new(config.response.simulation_mode)));
        let policy = Arc::new(PolicyEngine::new(config.response.clone(), enforcer, store.clone(), metrics.clone()));
        let policy_task = tokio::spawn(
            PolicyStage {
                engine:        policy.clone(),
                threats:       threat_rx,
                notifications: note_tx,
                metrics:       metrics.clone(),
            }
            .run(shutdown_rx.clone()),
        );

        // Fusion
        let flush = Arc::new(Notify::new());
        let fusion = tokio::spawn(
            FusionStage {
                engine:  FusionEngine::from_config(&config.fusion),
                intake:  intake.clone(),
                store:   store.clone(),
                threats: threat_tx,
                metrics: metrics.clone(),
                tick:    Duration::from_millis(config.fusion.tick_ms),
                flush:   flush.clone(),
            }
            .run(shutdown_rx.clone()),
        );

        // Detection
        let mut force = BTreeMap::new();
        let mut loops = Vec::new();
        for category in &enabled {
            let sampler = match self.samplers.get(category) {
                Some(s) => s.clone(),
                None => return Err(PipelineError::MissingSampler(category.clone())),
            };
            let dl = DetectionLoop::new(
                category.clone(),
                config.detection.detector(category),
                sampler,
                self.registry.clone(),
                intake.clone(),
                metrics.clone(),
            );
            force.insert(category.clone(), dl.force_handle());
            loops.push(tokio::spawn(dl.run(shutdown_rx.clone())));
        }

        // Auxiliary
        let mut aux = Vec::new();
        aux.push(tokio::spawn(health_loop(
            metrics.clone(),
            self.sink,
            Duration::from_secs(config.health.report_interval_secs.max(1)),
            config.health.backlog_warning,
            shutdown_rx.clone(),
        )));
        if let Some(addr) = config.health.metrics_addr {
            let server = MetricsServer::new(metrics.clone(), addr);
            let rx = shutdown_rx.clone();
            aux.push(tokio::spawn(async move {
                if let Err(e) = server.serve(rx).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            }));
        }
        aux.push(tokio::spawn(retention_loop(store.clone(), policy.clone(), config.clone(), shutdown_rx)));

        info!(categories = ?enabled, auto_response = config.response.auto_response, "pipeline started");
        Ok(PipelineHandle {
            shutdown: shutdown_tx,
            intake,
            force,
            flush,
            store,
            policy,
            registry: self.registry,
            metrics,
            loops,
            fusion,
            policy_task,
            dispatcher,
            aux,
            journal,
        })
    }
}

/// Periodic retention sweep plus expiry of stale cooldown entries.
async fn retention_loop(
    store:        Arc<ThreatStore>,
    policy:       Arc<PolicyEngine>,
    config:       PipelineConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let every = Duration::from_secs(config.store.sweep_interval_secs.max(1));
    let retention = config.store.retention();
    let actioned = config.store.actioned_retention();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(every) => {}
        }
        let now = chrono::Utc::now();
        let expired = store.sweep(now, retention, actioned);
        let cooled = policy.cooldowns().purge_expired(now);
        if expired + cooled > 0 {
            info!(expired, cooldowns = cooled, "retention sweep");
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────────────

pub struct PipelineHandle {
    shutdown:    watch::Sender<bool>,
    intake:      Arc<IntakeQueue>,
    force:       BTreeMap<Category, Arc<Notify>>,
    flush:       Arc<Notify>,
    store:       Arc<ThreatStore>,
    policy:      Arc<PolicyEngine>,
    registry:    Arc<ScorerRegistry>,
    metrics:     Arc<PipelineMetrics>,
    loops:       Vec<JoinHandle<()>>,
    fusion:      JoinHandle<()>,
    policy_task: JoinHandle<()>,
    dispatcher:  JoinHandle<()>,
    aux:         Vec<JoinHandle<()>>,
    journal:     Option<Journal>,
}

impl PipelineHandle {
    /// Run the category's next cycle now. False if the category is not running.
    pub fn force_scan(&self, category: &Category) -> bool {
        match self.force.get(category) {
            Some(n) => {
                n.notify_one();
                true
            }
            None => false,
        }
    }

    /// Close every open fusion candidate now instead of waiting for its window.
    pub fn flush(&self) {
        self.flush.notify_one();
    }

    /// Feed an observation from outside the detection loops.
    pub fn submit(&self, obs: AnomalyObservation) -> bool {
        let accepted = self.intake.push(obs);
        if accepted {
            self.metrics.observations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        accepted
    }

    pub fn queries(&self) -> ThreatQuery {
        ThreatQuery::new(self.store.clone())
    }

    pub fn registry(&self) -> Arc<ScorerRegistry> {
        self.registry.clone()
    }

    pub fn safelist(&self) -> Arc<SafeList> {
        self.policy.safelist()
    }

    pub async fn manual_block(&self, action: ActionType, target: &str) -> ManualAction {
        self.policy.manual_block(action, target).await
    }

    pub async fn manual_unblock(&self, action: ActionType, target: &str) -> ManualAction {
        self.policy.manual_unblock(action, target).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn prometheus_text(&self) -> String {
        self.metrics.prometheus_text()
    }

    pub async fn shutdown(self) {
        let PipelineHandle {
            shutdown, intake, store, policy, loops, fusion, policy_task, dispatcher, aux, journal, ..
        } = self;

        info!("pipeline shutting down");
        intake.close();
        let _ = shutdown.send(true);

        for h in loops {
            let _ = h.await;
        }
        let _ = fusion.await;
        let _ = policy_task.await;
        if tokio::time::timeout(Duration::from_secs(30), dispatcher).await.is_err() {
            warn!("dispatcher did not drain in time");
        }
        for h in aux {
            let _ = h.await;
        }

        drop(policy);
        drop(store);
        if let Some(j) = journal {
            if tokio::time::timeout(Duration::from_secs(30), j.close()).await.is_err() {
                warn!("threat journal did not flush in time");
            }
        }
        info!("pipeline stopped");
    }
}
