// warden/src/scorer/threshold.rs
//
// Rule scorer: static per-feature limits. Below every limit the score is 0;
// over a limit it starts at 0.7 and reaches 1.0 at twice the limit.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Scorer, ScorerError, ScorerKind, Verdict};
use crate::events::Sample;

const RULE_CONFIDENCE: f64 = 0.8;

pub struct ThresholdScorer {
    name:   String,
    limits: BTreeMap<String, f64>,
}

impl ThresholdScorer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), limits: BTreeMap::new() }
    }

    pub fn limit(mut self, feature: &str, value: f64) -> Self {
        self.limits.insert(feature.to_string(), value);
        self
    }

    pub fn network() -> Self {
        Self::new("network-threshold")
            .limit("connections", 50.0)
            .limit("bytes_per_sec", 10_000_000.0)
            .limit("packets_per_sec", 1_000.0)
            .limit("distinct_local_ports", 20.0)
    }

    pub fn system() -> Self {
        Self::new("system-threshold")
            .limit("cpu_percent", 90.0)
            .limit("memory_percent", 90.0)
    }

    pub fn log() -> Self {
        Self::new("log-threshold")
            .limit("auth_failures", 5.0)
            .limit("privilege", 3.0)
            .limit("errors", 50.0)
    }

    fn rule_score(value: f64, limit: f64) -> f64 {
        if value <= limit {
            return 0.0;
        }
        let over = if limit > 0.0 { (value - limit) / limit } else { 1.0 };
        0.7 + 0.3 * over.min(1.0)
    }
}

#[async_trait]
impl Scorer for ThresholdScorer {
    fn name(&self) -> &str { &self.name }

    fn kind(&self) -> ScorerKind { ScorerKind::Rule }

    async fn score(&self, sample: &Sample) -> Result<Verdict, ScorerError> {
        let mut seen = false;
        let mut best = 0.0f64;
        for (feature, limit) in &self.limits {
            if let Some(v) = sample.feature(feature) {
                seen = true;
                best = best.max(Self::rule_score(v, *limit));
            }
        }
        if !seen {
            return Err(ScorerError::FeatureMismatch { missing: self.limits.keys().cloned().collect() });
        }
        Ok(Verdict::new(best, RULE_CONFIDENCE))
    }
}
