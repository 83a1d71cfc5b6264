// warden/src/scorer/density.rs
//
// Density scorer: mean distance from the sample to its k nearest neighbours
// in a rolling per-subject window, each dimension standardised by the
// window's own spread. Points far from everything the subject has done
// recently score high.
//
//   score      = 1 - exp(-d_knn / scale)
//   confidence = min(window_fill, 1)

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{require_features, Scorer, ScorerError, ScorerKind, Verdict};
use crate::events::Sample;

pub struct DensityScorer {
    name:     String,
    features: Vec<String>,
    k:        usize,
    window:   usize,
    scale:    f64,
    points:   DashMap<String, VecDeque<Vec<f64>>>,
}

impl DensityScorer {
    pub fn new(name: impl Into<String>, features: &[&str]) -> Self {
        Self {
            name:     name.into(),
            features: features.iter().map(|f| f.to_string()).collect(),
            k:        5,
            window:   50,
            scale:    3.0,
            points:   DashMap::new(),
        }
    }

    pub fn network() -> Self {
        Self::new("network-density", &["connections", "established", "distinct_local_ports"])
    }

    pub fn system() -> Self {
        Self::new("system-density", &["cpu_percent", "memory_percent"])
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self.window = self.window.max(self.k + 1);
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(self.k + 1);
        self
    }

    fn knn_distance(&self, point: &[f64], past: &VecDeque<Vec<f64>>) -> f64 {
        let dims = point.len();
        let n = past.len() as f64;

        let spread: Vec<f64> = (0..dims)
            .map(|d| {
                let mean = past.iter().map(|p| p[d]).sum::<f64>() / n;
                let var = past.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n;
                var.sqrt().max(1e-6)
            })
            .collect();

        let mut dists: Vec<f64> = past
            .iter()
            .map(|p| {
                (0..dims)
                    .map(|d| ((point[d] - p[d]) / spread[d]).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect();
        dists.sort_by(|a, b| a.total_cmp(b));
        let k = self.k.min(dists.len());
        dists.iter().take(k).sum::<f64>() / k as f64
    }
}

#[async_trait]
impl Scorer for DensityScorer {
    fn name(&self) -> &str { &self.name }

    fn kind(&self) -> ScorerKind { ScorerKind::Density }

    async fn score(&self, sample: &Sample) -> Result<Verdict, ScorerError> {
        require_features(sample, &self.features)?;
        let point: Vec<f64> = self
            .features
            .iter()
            .map(|f| sample.feature(f).unwrap_or_default())
            .collect();

        let mut past = self.points.entry(sample.subject.clone()).or_default();
        let verdict = if past.len() < self.k {
            Verdict::new(0.0, 0.1)
        } else {
            let d = self.knn_distance(&point, &past);
            let fill = (past.len() as f64 / self.window as f64).min(1.0);
            Verdict::new(1.0 - (-d / self.scale).exp(), fill)
        };

        past.push_back(point);
        while past.len() > self.window {
            past.pop_front();
        }
        Ok(verdict)
    }
}
