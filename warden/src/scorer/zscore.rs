// warden/src/scorer/zscore.rs
//
// Statistical scorer: rolling per-subject, per-feature baseline.
//
//   z          = (value - mean) / max(std, min_std)
//   score      = clamp(z / (2 * z_threshold), 0, 1)    → 0.5 at the threshold
//   confidence = min(0.5 + z / 10, 0.95)
//
// Optional hard limits short-circuit the baseline: a breach scores at least
// 0.9 with base confidence 0.8, even before enough history exists. The value
// is scored against the baseline first and appended afterwards.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Scorer, ScorerError, ScorerKind, Verdict};
use crate::events::Sample;

const MIN_HISTORY: usize = 3;
const MAX_SUBJECTS: usize = 10_000;

pub struct ZScoreScorer {
    name:        String,
    features:    Vec<String>,
    hard_limits: BTreeMap<String, f64>,
    z_threshold: f64,
    min_std:     f64,
    history_len: usize,
    // subject → feature → recent values
    history:     DashMap<String, HashMap<String, VecDeque<f64>>>,
}

impl ZScoreScorer {
    pub fn new(name: impl Into<String>, features: &[&str]) -> Self {
        Self {
            name:        name.into(),
            features:    features.iter().map(|f| f.to_string()).collect(),
            hard_limits: BTreeMap::new(),
            z_threshold: 3.0,
            min_std:     1.0,
            history_len: 100,
            history:     DashMap::new(),
        }
    }

    /// Connection count, bandwidth and packet rate, with fixed hard limits.
    pub fn network() -> Self {
        Self::new("network-zscore", &["connections", "bytes_per_sec", "packets_per_sec"])
            .with_hard_limit("connections", 50.0)
            .with_hard_limit("bytes_per_sec", 10_000_000.0)
            .with_hard_limit("packets_per_sec", 1_000.0)
    }

    pub fn system() -> Self {
        Self::new("system-zscore", &["cpu_percent", "memory_percent", "process_count"])
    }

    pub fn log() -> Self {
        Self::new("log-zscore", &["auth_failures", "errors", "privilege"])
    }

    pub fn with_hard_limit(mut self, feature: &str, limit: f64) -> Self {
        self.hard_limits.insert(feature.to_string(), limit);
        self
    }

    pub fn with_threshold(mut self, z: f64) -> Self {
        self.z_threshold = z.max(f64::EPSILON);
        self
    }

    pub fn with_history(mut self, len: usize) -> Self {
        self.history_len = len.max(MIN_HISTORY);
        self
    }

    fn score_feature(&self, feature: &str, value: f64, past: Option<&VecDeque<f64>>) -> (f64, f64) {
        let mut best = (0.0, 0.1);

        if let Some(limit) = self.hard_limits.get(feature) {
            if value > *limit {
                best = (0.9, 0.8);
            }
        }

        let Some(past) = past.filter(|p| p.len() >= MIN_HISTORY) else {
            return best;
        };
        let n = past.len() as f64;
        let mean = past.iter().sum::<f64>() / n;
        let var = past.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt().max(self.min_std);
        let z = (value - mean) / std;

        let score = (z / (2.0 * self.z_threshold)).clamp(0.0, 1.0);
        let confidence = (0.5 + z.max(0.0) / 10.0).min(0.95);
        if score > best.0 {
            best = (score, confidence);
        } else if best.0 == 0.0 {
            best.1 = confidence;
        }
        best
    }
}

#[async_trait]
impl Scorer for ZScoreScorer {
    fn name(&self) -> &str { &self.name }

    fn kind(&self) -> ScorerKind { ScorerKind::Statistical }

    async fn score(&self, sample: &Sample) -> Result<Verdict, ScorerError> {
        let present: Vec<(&str, f64)> = self
            .features
            .iter()
            .filter_map(|f| sample.feature(f).map(|v| (f.as_str(), v)))
            .collect();
        if present.is_empty() {
            return Err(ScorerError::FeatureMismatch { missing: self.features.clone() });
        }

        if !self.history.contains_key(&sample.subject) && self.history.len() >= MAX_SUBJECTS {
            // Baseline table full: still honour hard limits for new subjects.
            let best = present
                .iter()
                .map(|(f, v)| self.score_feature(f, *v, None))
                .fold((0.0, 0.1), |a, b| if b.0 > a.0 { b } else { a });
            return Ok(Verdict::new(best.0, best.1));
        }

        let mut entry = self.history.entry(sample.subject.clone()).or_default();
        let mut best = (0.0, 0.1);
        for (feature, value) in present {
            let verdict = self.score_feature(feature, value, entry.get(feature));
            if verdict.0 > best.0 || (best.0 == 0.0 && verdict.1 > best.1) {
                best = verdict;
            }
            let past = entry.entry(feature.to_string()).or_default();
            past.push_back(value);
            while past.len() > self.history_len {
                past.pop_front();
            }
        }
        Ok(Verdict::new(best.0, best.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conns(subject: &str, v: f64) -> Sample {
        Sample::new(subject).with("connections", v)
    }

    #[tokio::test]
    async fn needs_history_before_scoring() {
        let s = ZScoreScorer::new("z", &["connections"]);
        let v = s.score(&conns("10.0.0.5", 40.0)).await.unwrap();
        assert_eq!(v.score, 0.0);
        assert_eq!(v.confidence, Some(0.1));
    }

    #[tokio::test]
    async fn spike_over_baseline_scores_high() {
        let s = ZScoreScorer::new("z", &["connections"]);
        for v in [10.0, 11.0, 9.0, 10.0, 10.0] {
            s.score(&conns("10.0.0.5", v)).await.unwrap();
        }
        let calm = s.score(&conns("10.0.0.5", 10.0)).await.unwrap();
        assert_eq!(calm.score, 0.0);

        // std floors at 1.0 → z = 30 - 10 = 20
        let spike = s.score(&conns("10.0.0.5", 30.0)).await.unwrap();
        assert_eq!(spike.score, 1.0);
        assert_eq!(spike.confidence, Some(0.95));

        // Baselines are per subject.
        let other = s.score(&conns("10.0.0.6", 30.0)).await.unwrap();
        assert_eq!(other.score, 0.0);
    }

    #[tokio::test]
    async fn hard_limit_fires_without_history() {
        let s = ZScoreScorer::network();
        let v = s.score(&conns("host", 75.0)).await.unwrap();
        assert_eq!(v.score, 0.9);
        assert_eq!(v.confidence, Some(0.8));
    }

    #[tokio::test]
    async fn unrelated_sample_is_a_mismatch() {
        let s = ZScoreScorer::system();
        let err = s.score(&Sample::new("h").with("bytes_per_sec", 1.0)).await.unwrap_err();
        assert!(matches!(err, ScorerError::FeatureMismatch { .. }));
    }
}
