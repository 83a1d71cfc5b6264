// warden/src/detect/mod.rs
//
// One detection loop per category. Each cycle:
//
//   sampler.sample()  ──►  every scorer × every sample, concurrently,
//                          each call bounded by scorer_timeout
//                     ──►  AnomalyObservation per verdict ≥ min_emit_score
//                     ──►  IntakeQueue (never blocks)
//
// A cycle fails when the sampler fails or times out, or when samples were
// produced but no scorer returned a verdict. Loops never exit on error; after
// `failure_threshold` consecutive failures they degrade and back off.

mod health;

pub use health::{HealthTransition, LoopHealth};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::events::{AnomalyObservation, Category, ObservationKind, Sample};
use crate::intake::IntakeQueue;
use crate::metrics::PipelineMetrics;
use crate::sampler::Sampler;
use crate::scorer::{ScorerError, ScorerRegistry, Verdict};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub samples:         usize,
    pub verdicts:        usize,
    pub scorer_failures: usize,
    pub emitted:         usize,
    pub failed:          bool,
}

pub struct DetectionLoop {
    category: Category,
    config:   DetectorConfig,
    sampler:  Arc<dyn Sampler>,
    registry: Arc<ScorerRegistry>,
    intake:   Arc<IntakeQueue>,
    metrics:  Arc<PipelineMetrics>,
    force:    Arc<Notify>,
}

impl DetectionLoop {
    pub fn new(
        category: Category,
        config:   DetectorConfig,
        sampler:  Arc<dyn Sampler>,
        registry: Arc<ScorerRegistry>,
        intake:   Arc<IntakeQueue>,
        metrics:  Arc<PipelineMetrics>,
    ) -> Self {
        Self { category, config, sampler, registry, intake, metrics, force: Arc::new(Notify::new()) }
    }

    /// Wakes the loop for an immediate cycle.
    pub fn force_handle(&self) -> Arc<Notify> {
        self.force.clone()
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let samples = match tokio::time::timeout(self.config.sample_timeout(), self.sampler.sample()).await {
            Ok(Ok(samples)) => samples,
            Ok(Err(e)) => {
                self.metrics.sampler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(category = %self.category, sampler = self.sampler.name(), error = %e, "sampler failed");
                report.failed = true;
                return report;
            }
            Err(_) => {
                self.metrics.sampler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(category = %self.category, sampler = self.sampler.name(), "sampler timed out");
                report.failed = true;
                return report;
            }
        };
        report.samples = samples.len();
        if samples.is_empty() {
            return report;
        }

        // Snapshot once; a hot-swap mid-cycle applies from the next cycle.
        let scorers = self.registry.snapshot(&self.category);
        let samples: Vec<Arc<Sample>> = samples.into_iter().map(Arc::new).collect();
        let timeout = self.config.scorer_timeout();

        let mut tasks = JoinSet::new();
        for (si, sample) in samples.iter().enumerate() {
            for (ci, scorer) in scorers.iter().enumerate() {
                let scorer = scorer.clone();
                let sample = sample.clone();
                tasks.spawn(async move {
                    let outcome = match tokio::time::timeout(timeout, scorer.score(&sample)).await {
                        Ok(r) => r,
                        Err(_) => Err(ScorerError::Unavailable(format!("timed out after {:?}", timeout))),
                    };
                    (si, ci, outcome)
                });
            }
        }

        let mut results: Vec<(usize, usize, Result<Verdict, ScorerError>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => {
                    self.metrics.scorer_failures.fetch_add(1, Ordering::Relaxed);
                    report.scorer_failures += 1;
                    warn!(category = %self.category, error = %e, "scorer task panicked");
                }
            }
        }
        // Completion order is nondeterministic; emission order is not.
        results.sort_by_key(|(si, ci, _)| (*si, *ci));

        for (si, ci, outcome) in results {
            let sample = &samples[si];
            let scorer = &scorers[ci];
            match outcome {
                Ok(verdict) => {
                    report.verdicts += 1;
                    let (score, confidence) = verdict.normalized();
                    if score < self.config.min_emit_score {
                        continue;
                    }
                    let obs = AnomalyObservation {
                        origin:      self.category.clone(),
                        subject_key: sample.subject.clone(),
                        scorer:      scorer.name().to_string(),
                        kind:        ObservationKind::Anomaly,
                        score,
                        confidence,
                        features:    sample.features.clone(),
                        timestamp:   Utc::now(),
                    };
                    if self.intake.push(obs) {
                        report.emitted += 1;
                        self.metrics.observations.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    report.scorer_failures += 1;
                    self.metrics.scorer_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        category = %self.category, scorer = scorer.name(),
                        subject = %sample.subject, error = %e, "scorer skipped"
                    );
                }
            }
        }

        report.failed = report.verdicts == 0;
        report
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut health = LoopHealth::new(
            self.config.interval(),
            self.config.backoff_ceiling(),
            self.config.failure_threshold,
        );
        info!(category = %self.category, interval = ?self.config.interval(), "detection loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                r = self.run_cycle() => r,
            };
            debug!(
                category = %self.category, samples = report.samples,
                emitted = report.emitted, failed = report.failed, "cycle complete"
            );
            self.apply_health(&mut health, &report);

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.force.notified() => {
                    info!(category = %self.category, "forced scan");
                }
                _ = tokio::time::sleep(health.interval()) => {}
            }
        }
        if health.is_degraded() {
            self.metrics.degraded_loops.fetch_sub(1, Ordering::Relaxed);
        }
        info!(category = %self.category, "detection loop stopped");
    }

    fn apply_health(&self, health: &mut LoopHealth, report: &CycleReport) {
        let transition = if report.failed { health.record_failure() } else { health.record_success() };
        match transition {
            HealthTransition::EnteredDegraded => {
                warn!(
                    category = %self.category, failures = health.consecutive_failures(),
                    interval = ?health.interval(), "detection loop degraded"
                );
                self.metrics.health_alerts.fetch_add(1, Ordering::Relaxed);
                self.metrics.degraded_loops.fetch_add(1, Ordering::Relaxed);
                let alert = AnomalyObservation::health_alert(
                    self.category.clone(),
                    health.consecutive_failures(),
                    health.interval().as_secs_f64(),
                );
                if self.intake.push(alert) {
                    self.metrics.observations.fetch_add(1, Ordering::Relaxed);
                }
            }
            HealthTransition::BackedOff => {
                debug!(category = %self.category, interval = ?health.interval(), "degraded backoff");
            }
            HealthTransition::Recovered => {
                info!(category = %self.category, "detection loop recovered");
                self.metrics.degraded_loops.fetch_sub(1, Ordering::Relaxed);
            }
            HealthTransition::Failed | HealthTransition::Healthy => {}
        }
    }
}
