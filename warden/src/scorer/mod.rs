// warden/src/scorer/mod.rs
//
// Scorer contract and the per-category registry.
//
// A scorer turns one Sample into (score, confidence), both in [0, 1]. The
// registry hands detection loops a cheap Arc snapshot of the scorer list so
// register / replace / remove never stall an in-flight cycle.
//
// Shipped variants:
//   ZScoreScorer     statistical  rolling per-subject baseline
//   DensityScorer    density      k-nearest-neighbour distance
//   ThresholdScorer  rule         static per-feature limits

pub mod density;
pub mod threshold;
pub mod zscore;

pub use density::DensityScorer;
pub use threshold::ThresholdScorer;
pub use zscore::ZScoreScorer;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::events::{Category, Sample};

// ── Contract ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScorerKind {
    Statistical,
    Density,
    Rule,
}

impl std::fmt::Display for ScorerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Statistical => write!(f, "statistical"),
            Self::Density     => write!(f, "density"),
            Self::Rule        => write!(f, "rule"),
        }
    }
}

/// Non-fatal scorer failures. The calling loop logs and skips the scorer
/// for the current cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScorerError {
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    #[error("sample is missing features {missing:?}")]
    FeatureMismatch { missing: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub score:      f64,
    /// `None` when the scorer has no opinion on its own certainty.
    pub confidence: Option<f64>,
}

impl Verdict {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self { score, confidence: Some(confidence) }
    }

    pub fn score_only(score: f64) -> Self {
        Self { score, confidence: None }
    }

    /// (score, confidence) clamped into [0, 1]; missing confidence is 1.0
    /// and NaN is treated as 0.
    pub fn normalized(&self) -> (f64, f64) {
        (clamp_unit(self.score), clamp_unit(self.confidence.unwrap_or(1.0)))
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Unique within a category; used for hot-swap and attribution.
    fn name(&self) -> &str;
    fn kind(&self) -> ScorerKind;
    async fn score(&self, sample: &Sample) -> Result<Verdict, ScorerError>;
}

/// Features a sample must carry, or `FeatureMismatch` listing the absent ones.
pub fn require_features(sample: &Sample, names: &[String]) -> Result<(), ScorerError> {
    let missing: Vec<String> = names
        .iter()
        .filter(|n| !sample.features.contains_key(n.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() { Ok(()) } else { Err(ScorerError::FeatureMismatch { missing }) }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("scorer {name:?} already registered for {category}")]
    Duplicate { category: Category, name: String },
    #[error("no scorer {name:?} registered for {category}")]
    NotFound { category: Category, name: String },
    #[error("enabled category {0} has no scorers")]
    Empty(Category),
}

pub type ScorerSet = Arc<[Arc<dyn Scorer>]>;

#[derive(Default)]
pub struct ScorerRegistry {
    by_category: RwLock<HashMap<Category, ScorerSet>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, category: Category, scorer: Arc<dyn Scorer>) -> Result<(), RegistryError> {
        let mut map = self.by_category.write();
        let current = map.get(&category).cloned().unwrap_or_else(|| Arc::from(Vec::new()));
        if current.iter().any(|s| s.name() == scorer.name()) {
            return Err(RegistryError::Duplicate { category, name: scorer.name().to_string() });
        }
        info!(category = %category, scorer = scorer.name(), kind = %scorer.kind(), "scorer registered");
        let mut next: Vec<Arc<dyn Scorer>> = current.iter().cloned().collect();
        next.push(scorer);
        map.insert(category, Arc::from(next));
        Ok(())
    }

    /// Hot-swap: replaces the scorer with the same name. Cycles already
    /// holding a snapshot finish with the old instance.
    pub fn replace(&self, category: Category, scorer: Arc<dyn Scorer>) -> Result<(), RegistryError> {
        let mut map = self.by_category.write();
        let current = map.get(&category).cloned().unwrap_or_else(|| Arc::from(Vec::new()));
        let pos = current.iter().position(|s| s.name() == scorer.name()).ok_or_else(|| {
            RegistryError::NotFound { category: category.clone(), name: scorer.name().to_string() }
        })?;
        info!(category = %category, scorer = scorer.name(), "scorer replaced");
        let mut next: Vec<Arc<dyn Scorer>> = current.iter().cloned().collect();
        next[pos] = scorer;
        map.insert(category, Arc::from(next));
        Ok(())
    }

    pub fn remove(&self, category: &Category, name: &str) -> Result<Arc<dyn Scorer>, RegistryError> {
        let mut map = self.by_category.write();
        let not_found = || RegistryError::NotFound { category: category.clone(), name: name.to_string() };
        let current = map.get(category).cloned().ok_or_else(not_found)?;
        let pos = current.iter().position(|s| s.name() == name).ok_or_else(not_found)?;
        let removed = current[pos].clone();
        let next: Vec<Arc<dyn Scorer>> = current
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != pos)
            .map(|(_, s)| s.clone())
            .collect();
        map.insert(category.clone(), Arc::from(next));
        info!(category = %category, scorer = name, "scorer removed");
        Ok(removed)
    }

    /// Current scorers for a category, in registration order.
    pub fn snapshot(&self, category: &Category) -> ScorerSet {
        self.by_category
            .read()
            .get(category)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    pub fn categories(&self) -> Vec<Category> {
        let mut cats: Vec<Category> = self.by_category.read().keys().cloned().collect();
        cats.sort();
        cats
    }

    /// Startup check: every enabled category must have at least one scorer.
    pub fn validate<'a>(&self, enabled: impl IntoIterator<Item = &'a Category>) -> Result<(), RegistryError> {
        let map = self.by_category.read();
        for category in enabled {
            if map.get(category).map(|s| s.is_empty()).unwrap_or(true) {
                return Err(RegistryError::Empty(category.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name:  &'static str,
        score: f64,
    }

    #[async_trait]
    impl Scorer for Fixed {
        fn name(&self) -> &str { self.name }
        fn kind(&self) -> ScorerKind { ScorerKind::Rule }
        async fn score(&self, _: &Sample) -> Result<Verdict, ScorerError> {
            Ok(Verdict::score_only(self.score))
        }
    }

    fn fixed(name: &'static str, score: f64) -> Arc<dyn Scorer> {
        Arc::new(Fixed { name, score })
    }

    #[test]
    fn verdict_clamps_and_defaults_confidence() {
        assert_eq!(Verdict::score_only(1.7).normalized(), (1.0, 1.0));
        assert_eq!(Verdict::new(-0.2, 0.4).normalized(), (0.0, 0.4));
        assert_eq!(Verdict::new(f64::NAN, 2.0).normalized(), (0.0, 1.0));
    }

    #[test]
    fn missing_features_are_listed() {
        let sample = Sample::new("h").with("cpu_percent", 12.0);
        let err = require_features(&sample, &["cpu_percent".into(), "memory_percent".into()]).unwrap_err();
        assert_eq!(err, ScorerError::FeatureMismatch { missing: vec!["memory_percent".into()] });
    }

    #[tokio::test]
    async fn hot_swap_leaves_old_snapshot_intact() {
        let reg = ScorerRegistry::new();
        reg.register(Category::Network, fixed("z", 0.1)).unwrap();
        reg.register(Category::Network, fixed("d", 0.2)).unwrap();
        assert!(matches!(
            reg.register(Category::Network, fixed("z", 0.3)),
            Err(RegistryError::Duplicate { .. })
        ));

        let before = reg.snapshot(&Category::Network);
        reg.replace(Category::Network, fixed("z", 0.9)).unwrap();
        let after = reg.snapshot(&Category::Network);

        let sample = Sample::new("10.0.0.1");
        assert_eq!(before[0].score(&sample).await.unwrap().score, 0.1);
        assert_eq!(after[0].score(&sample).await.unwrap().score, 0.9);
        assert_eq!(after[1].name(), "d");
    }

    #[test]
    fn validate_requires_scorers_for_enabled_categories() {
        let reg = ScorerRegistry::new();
        reg.register(Category::System, fixed("t", 0.0)).unwrap();
        assert!(reg.validate(&[Category::System]).is_ok());
        assert_eq!(reg.validate(&[Category::System, Category::Log]), Err(RegistryError::Empty(Category::Log)));

        reg.remove(&Category::System, "t").unwrap();
        assert_eq!(reg.validate(&[Category::System]), Err(RegistryError::Empty(Category::System)));
        assert!(matches!(reg.remove(&Category::System, "t"), Err(RegistryError::NotFound { .. })));
    }
}
