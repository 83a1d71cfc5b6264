// warden/src/engine/fusion.rs
//
// Score fusion: groups observations per subject inside a time window and
// turns each closed group into one Threat.
//
//   combined = clamp(0.6 × max_score + 0.4 × weighted_avg, 0, 1)
//   weighted_avg = Σ(score × confidence) / Σ(confidence)   (plain mean if Σ = 0)
//   severity = round(1 + 4 × combined)                      → 1..=5
//
// A candidate closes when an observation for the same subject lands outside
// its window, when the window has elapsed on the wall clock, or on an
// explicit flush. Health alerts are grouped separately from anomalies.
// Threat ids come from a monotonic counter and are assigned at emission only,
// so a candidate that falls below the reporting floor consumes no id.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::FusionConfig;
use crate::events::{AnomalyObservation, ObservationKind, Threat, ThreatCategory, ThreatId, ThreatStatus};
use crate::intake::IntakeQueue;
use crate::metrics::PipelineMetrics;
use crate::store::ThreatStore;

const MAX_WEIGHT: f64 = 0.6;
const AVG_WEIGHT: f64 = 0.4;

/// Severity in 1..=5 from a non-empty observation group.
pub fn compute_severity(observations: &[AnomalyObservation]) -> u8 {
    if observations.is_empty() {
        return 1;
    }
    let max = observations.iter().map(|o| o.score).fold(0.0f64, f64::max);

    let conf_sum: f64 = observations.iter().map(|o| o.confidence).sum();
    let weighted = if conf_sum > 0.0 {
        observations.iter().map(|o| o.score * o.confidence).sum::<f64>() / conf_sum
    } else {
        observations.iter().map(|o| o.score).sum::<f64>() / observations.len() as f64
    };

    let mut combined = (MAX_WEIGHT * max + AVG_WEIGHT * weighted).clamp(0.0, 1.0);
    combined = (combined * 10000.0).round() / 10000.0;
    (1.0 + 4.0 * combined).round().clamp(1.0, 5.0) as u8
}

/// Single origin → its `-anomaly` category; mixed origins → composite.
pub fn threat_category(observations: &[AnomalyObservation]) -> ThreatCategory {
    match observations.split_first() {
        Some((first, rest)) if rest.iter().all(|o| o.origin == first.origin) => {
            ThreatCategory::Anomaly(first.origin.clone())
        }
        Some(_) => ThreatCategory::Composite,
        None => ThreatCategory::Composite,
    }
}

struct Candidate {
    opened_seq:   u64,
    first_at:     DateTime<Utc>,
    observations: Vec<AnomalyObservation>,
}

type CandidateKey = (ObservationKind, String);

pub struct FusionEngine {
    window:          Duration,
    reporting_floor: u8,
    next_id:         u64,
    next_seq:        u64,
    open:            BTreeMap<CandidateKey, Candidate>,
    below_floor:     u64,
}

impl FusionEngine {
    pub fn new(window: StdDuration, reporting_floor: u8) -> Self {
        Self {
            window:          Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(10)),
            reporting_floor: reporting_floor.clamp(1, 5),
            next_id:         1,
            next_seq:        0,
            open:            BTreeMap::new(),
            below_floor:     0,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(StdDuration::from_secs(config.window_secs), config.reporting_floor)
    }

    /// Add one observation. Returns the Threat closed by it, if any.
    pub fn ingest(&mut self, obs: AnomalyObservation) -> Option<Threat> {
        let key = (obs.kind, obs.subject_key.clone());

        if let Some(c) = self.open.get_mut(&key) {
            let delta = obs.timestamp - c.first_at;
            if delta <= self.window && delta >= -self.window {
                c.observations.push(obs);
                return None;
            }
        }

        let closed = self.open.remove(&key).and_then(|c| self.close(c));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.open.insert(key, Candidate { opened_seq: seq, first_at: obs.timestamp, observations: vec![obs] });
        closed
    }

    /// Close every candidate whose window has elapsed at `now`, in the order
    /// the candidates were opened.
    pub fn flush_expired(&mut self, now: DateTime<Utc>) -> Vec<Threat> {
        let expired: Vec<CandidateKey> = self
            .open
            .iter()
            .filter(|(_, c)| now - c.first_at > self.window)
            .map(|(k, _)| k.clone())
            .collect();
        self.close_keys(expired)
    }

    pub fn flush_all(&mut self) -> Vec<Threat> {
        let keys: Vec<CandidateKey> = self.open.keys().cloned().collect();
        self.close_keys(keys)
    }

    pub fn open_candidates(&self) -> usize {
        self.open.len()
    }

    /// Candidates closed below the reporting floor so far.
    pub fn below_floor(&self) -> u64 {
        self.below_floor
    }

    fn close_keys(&mut self, keys: Vec<CandidateKey>) -> Vec<Threat> {
        let mut closing: Vec<Candidate> = keys.iter().filter_map(|k| self.open.remove(k)).collect();
        closing.sort_by_key(|c| c.opened_seq);
        closing.into_iter().filter_map(|c| self.close(c)).collect()
    }

    fn close(&mut self, candidate: Candidate) -> Option<Threat> {
        let severity = compute_severity(&candidate.observations);
        if severity < self.reporting_floor {
            self.below_floor += 1;
            return None;
        }
        let id = ThreatId(self.next_id);
        self.next_id += 1;
        Some(Threat {
            id,
            subject_key:  candidate.observations[0].subject_key.clone(),
            category:     threat_category(&candidate.observations),
            severity,
            observations: candidate.observations,
            created_at:   Utc::now(),
            status:       ThreatStatus::New,
        })
    }
}

// ── Fusion task ──────────────────────────────────────────────────────────────

pub struct FusionStage {
    pub engine:  FusionEngine,
    pub intake:  Arc<IntakeQueue>,
    pub store:   Arc<ThreatStore>,
    pub threats: mpsc::UnboundedSender<Threat>,
    pub metrics: Arc<PipelineMetrics>,
    pub tick:    StdDuration,
    pub flush:   Arc<Notify>,
}

impl FusionStage {
    /// Single consumer of the intake. On shutdown open candidates are
    /// discarded rather than emitted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(window = ?self.engine.window.to_std().ok(), floor = self.engine.reporting_floor, "fusion started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                obs = self.intake.recv() => match obs {
                    Some(obs) => {
                        if let Some(threat) = self.engine.ingest(obs) {
                            self.emit(threat);
                        }
                    }
                    None => break,
                },
                _ = self.flush.notified() => {
                    for threat in self.engine.flush_all() {
                        self.emit(threat);
                    }
                }
                _ = ticker.tick() => {
                    for threat in self.engine.flush_expired(Utc::now()) {
                        self.emit(threat);
                    }
                    self.metrics.threats_below_floor.store(self.engine.below_floor(), Ordering::Relaxed);
                    self.metrics.observations_dropped.store(self.intake.dropped.load(Ordering::Relaxed), Ordering::Relaxed);
                }
            }
        }

        let dropped = self.engine.open_candidates();
        if dropped > 0 {
            info!(candidates = dropped, "fusion stopped, open candidates discarded");
        } else {
            info!("fusion stopped");
        }
    }

    fn emit(&self, threat: Threat) {
        if let Err(e) = self.store.insert(threat.clone()) {
            error!(threat_id = %threat.id, error = %e, "threat not stored");
            return;
        }
        self.metrics.threats.fetch_add(1, Ordering::Relaxed);
        warn!(
            threat_id = %threat.id, subject = %threat.subject_key, category = %threat.category,
            severity = threat.severity, observations = threat.observations.len(), "threat emitted"
        );
        if self.threats.send(threat).is_ok() {
            self.metrics.policy_backlog.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("policy engine gone, threat not evaluated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Category, Features};

    fn obs(subject: &str, origin: Category, score: f64, confidence: f64, at: DateTime<Utc>) -> AnomalyObservation {
        AnomalyObservation {
            origin,
            subject_key: subject.into(),
            scorer:      "s".into(),
            kind:        ObservationKind::Anomaly,
            score,
            confidence,
            features:    Features::new(),
            timestamp:   at,
        }
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(StdDuration::from_secs(10), 1)
    }

    #[test]
    fn three_network_observations_fuse_to_severity_five() {
        let t0 = Utc::now();
        let mut e = engine();
        for (i, (s, c)) in [(0.9, 0.9), (0.95, 0.9), (0.4, 0.5)].into_iter().enumerate() {
            let at = t0 + Duration::seconds(i as i64 * 2);
            assert!(e.ingest(obs("10.0.0.5", Category::Network, s, c, at)).is_none());
        }
        let threats = e.flush_all();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].severity, 5);
        assert_eq!(threats[0].category, ThreatCategory::network());
        assert_eq!(threats[0].observations.len(), 3);
        assert_eq!(threats[0].id, ThreatId(1));
    }

    #[test]
    fn severity_bounds_and_monotonic_in_max() {
        let t = Utc::now();
        let mut last = 0;
        for step in 0..=20 {
            let max = step as f64 / 20.0;
            let sev = compute_severity(&[
                obs("a", Category::Log, max, 0.7, t),
                obs("a", Category::Log, 0.1, 0.3, t),
            ]);
            assert!((1..=5).contains(&sev));
            assert!(sev >= last, "severity dropped at max={}", max);
            last = sev;
        }
        assert_eq!(compute_severity(&[obs("a", Category::Log, 0.0, 0.0, t)]), 1);
        assert_eq!(compute_severity(&[obs("a", Category::Log, 1.0, 0.0, t)]), 5);
    }

    #[test]
    fn zero_confidence_falls_back_to_plain_mean() {
        let t = Utc::now();
        // max 0.5, mean 0.25 → 0.3 + 0.1 = 0.4 → round(2.6) = 3
        let sev = compute_severity(&[
            obs("a", Category::Log, 0.5, 0.0, t),
            obs("a", Category::Log, 0.0, 0.0, t),
        ]);
        assert_eq!(sev, 3);
    }

    #[test]
    fn mixed_origins_are_composite() {
        let t = Utc::now();
        let mut e = engine();
        e.ingest(obs("10.0.0.5", Category::Network, 0.8, 1.0, t));
        e.ingest(obs("10.0.0.5", Category::Log, 0.8, 1.0, t + Duration::seconds(1)));
        assert_eq!(e.flush_all()[0].category, ThreatCategory::Composite);
    }

    #[test]
    fn observation_outside_window_closes_candidate() {
        let t = Utc::now();
        let mut e = engine();
        e.ingest(obs("h", Category::System, 0.9, 1.0, t));
        let closed = e.ingest(obs("h", Category::System, 0.1, 1.0, t + Duration::seconds(11))).unwrap();
        assert_eq!(closed.observations.len(), 1);
        assert_eq!(e.open_candidates(), 1);
        assert_eq!(e.flush_all()[0].id, ThreatId(2));
    }

    #[test]
    fn wall_clock_expiry_in_open_order() {
        let t = Utc::now();
        let mut e = engine();
        e.ingest(obs("b", Category::System, 0.5, 1.0, t));
        e.ingest(obs("a", Category::System, 0.5, 1.0, t + Duration::seconds(1)));
        e.ingest(obs("c", Category::System, 0.5, 1.0, t + Duration::seconds(8)));

        let closed = e.flush_expired(t + Duration::seconds(12));
        let subjects: Vec<&str> = closed.iter().map(|t| t.subject_key.as_str()).collect();
        assert_eq!(subjects, vec!["b", "a"]);
        assert_eq!(e.open_candidates(), 1);
    }

    #[test]
    fn health_alerts_never_merge_with_anomalies() {
        let t = Utc::now();
        let mut e = engine();
        let mut alert = AnomalyObservation::health_alert(Category::System, 5, 120.0);
        alert.timestamp = t;
        e.ingest(obs("detector/system", Category::System, 0.9, 1.0, t));
        e.ingest(alert);
        let threats = e.flush_all();
        assert_eq!(threats.len(), 2);
        assert_eq!(threats.iter().filter(|t| t.is_health_alert()).count(), 1);
    }

    #[test]
    fn reporting_floor_consumes_no_id() {
        let t = Utc::now();
        let mut e = FusionEngine::new(StdDuration::from_secs(10), 3);
        e.ingest(obs("quiet", Category::Network, 0.1, 1.0, t));
        e.ingest(obs("loud", Category::Network, 0.9, 1.0, t));
        let threats = e.flush_all();
        assert_eq!(threats.len(), 1);
        assert_eq!(threats[0].subject_key, "loud");
        assert_eq!(threats[0].id, ThreatId(1));
        assert_eq!(e.below_floor(), 1);
    }

    #[test]
    fn replay_yields_identical_severities() {
        let t = Utc::now();
        let seq: Vec<AnomalyObservation> = (0..40)
            .map(|i| {
                let subject = format!("10.0.0.{}", i % 4);
                let score = ((i * 37) % 100) as f64 / 100.0;
                let conf = ((i * 11) % 10) as f64 / 10.0;
                obs(&subject, Category::Network, score, conf, t + Duration::seconds(i as i64))
            })
            .collect();

        let run = |seq: &[AnomalyObservation]| {
            let mut e = engine();
            let mut out: Vec<(u64, String, u8)> = Vec::new();
            for o in seq.iter().cloned() {
                out.extend(e.ingest(o).map(|t| (t.id.0, t.subject_key, t.severity)));
            }
            out.extend(e.flush_all().into_iter().map(|t| (t.id.0, t.subject_key, t.severity)));
            out
        };
        assert_eq!(run(&seq), run(&seq));
    }

    #[tokio::test]
    async fn stage_stores_and_forwards_threats() {
        let intake = Arc::new(IntakeQueue::new(16));
        let store = Arc::new(ThreatStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let flush = Arc::new(Notify::new());
        let metrics = PipelineMetrics::new();
        let stage = FusionStage {
            engine:  engine(),
            intake:  intake.clone(),
            store:   store.clone(),
            threats: tx,
            metrics: metrics.clone(),
            tick:    StdDuration::from_secs(3600),
            flush:   flush.clone(),
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(stage.run(stop_rx));

        intake.push(obs("10.0.0.5", Category::Network, 0.9, 1.0, Utc::now()));
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        flush.notify_one();

        let threat = rx.recv().await.unwrap();
        assert_eq!(threat.subject_key, "10.0.0.5");
        assert!(store.get(threat.id).is_some());
        assert_eq!(metrics.threats.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.policy_backlog.load(Ordering::Relaxed), 1);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
