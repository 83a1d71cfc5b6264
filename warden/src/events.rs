// warden/src/events.rs
//
// Shared domain types flowing through the pipeline:
//   Sample              sampler output, one per observed subject
//   AnomalyObservation  one scorer's verdict on one sample
//   Threat              fused, user-facing security event
//   ResponseAction      policy outcome for one Threat
//   Notification        operator-facing message with urgency

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Feature name → value. Ordered so snapshots serialize deterministically.
pub type Features = BTreeMap<String, f64>;

// ── Categories ───────────────────────────────────────────────────────────────

/// Detector domain. New domains use `Other` and need no changes in fusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Network,
    System,
    Log,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Network  => "network",
            Self::System   => "system",
            Self::Log      => "log",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Self::Network,
            "system"  => Self::System,
            "log"     => Self::Log,
            other     => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self { Self::from(s.as_str()) }
}

impl From<Category> for String {
    fn from(c: Category) -> Self { c.as_str().to_string() }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threat category: the single contributing domain, or `Composite` when
/// observations from several domains were fused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ThreatCategory {
    Anomaly(Category),
    Composite,
}

impl ThreatCategory {
    pub fn network() -> Self { Self::Anomaly(Category::Network) }
    pub fn system()  -> Self { Self::Anomaly(Category::System) }
    pub fn log()     -> Self { Self::Anomaly(Category::Log) }
}

impl From<String> for ThreatCategory {
    fn from(s: String) -> Self {
        if s == "composite" {
            return Self::Composite;
        }
        let domain = s.strip_suffix("-anomaly").unwrap_or(&s);
        Self::Anomaly(Category::from(domain))
    }
}

impl From<ThreatCategory> for String {
    fn from(c: ThreatCategory) -> Self { c.to_string() }
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anomaly(c) => write!(f, "{}-anomaly", c),
            Self::Composite  => write!(f, "composite"),
        }
    }
}

// ── Samples and observations ─────────────────────────────────────────────────

/// One sampler reading for one subject (IP, `name:pid`, host, log source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub subject:  String,
    pub features: Features,
}

impl Sample {
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into(), features: Features::new() }
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.features.insert(name.to_string(), value);
        self
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationKind {
    Anomaly,
    /// Raised by a detection loop entering the degraded state.
    HealthAlert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyObservation {
    pub origin:      Category,
    pub subject_key: String,
    pub scorer:      String,
    pub kind:        ObservationKind,
    pub score:       f64,
    pub confidence:  f64,
    pub features:    Features,
    pub timestamp:   DateTime<Utc>,
}

impl AnomalyObservation {
    pub fn health_alert(origin: Category, consecutive_failures: u32, interval_secs: f64) -> Self {
        let mut features = Features::new();
        features.insert("consecutive_failures".into(), consecutive_failures as f64);
        features.insert("interval_secs".into(), interval_secs);
        Self {
            subject_key: format!("detector/{}", origin),
            origin,
            scorer:      "loop-health".into(),
            kind:        ObservationKind::HealthAlert,
            score:       0.5,
            confidence:  1.0,
            features,
            timestamp:   Utc::now(),
        }
    }
}

// ── Threats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreatId(pub u64);

impl std::fmt::Display for ThreatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatStatus {
    New,
    Actioned,
    Suppressed,
    Expired,
}

impl std::fmt::Display for ThreatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New        => write!(f, "new"),
            Self::Actioned   => write!(f, "actioned"),
            Self::Suppressed => write!(f, "suppressed"),
            Self::Expired    => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub id:            ThreatId,
    pub subject_key:   String,
    pub category:      ThreatCategory,
    pub severity:      u8,
    /// Never empty; insertion order.
    pub observations:  Vec<AnomalyObservation>,
    pub created_at:    DateTime<Utc>,
    pub status:        ThreatStatus,
}

impl Threat {
    pub fn max_score(&self) -> f64 {
        self.observations.iter().map(|o| o.score).fold(0.0, f64::max)
    }

    pub fn is_health_alert(&self) -> bool {
        self.observations.iter().all(|o| o.kind == ObservationKind::HealthAlert)
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    BlockConnection,
    TerminateProcess,
    IsolateHost,
    NotifyOnly,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockConnection  => write!(f, "block-connection"),
            Self::TerminateProcess => write!(f, "terminate-process"),
            Self::IsolateHost      => write!(f, "isolate-host"),
            Self::NotifyOnly       => write!(f, "notify-only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionResult {
    Applied,
    SkippedSafelist,
    SkippedCooldown,
    SkippedSeverityCeiling,
    Failed,
}

impl ActionResult {
    pub const ALL: [ActionResult; 5] = [
        Self::Applied,
        Self::SkippedSafelist,
        Self::SkippedCooldown,
        Self::SkippedSeverityCeiling,
        Self::Failed,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Applied                => 0,
            Self::SkippedSafelist        => 1,
            Self::SkippedCooldown        => 2,
            Self::SkippedSeverityCeiling => 3,
            Self::Failed                 => 4,
        }
    }
}

impl std::fmt::Display for ActionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied                => write!(f, "applied"),
            Self::SkippedSafelist        => write!(f, "skipped-safelist"),
            Self::SkippedCooldown        => write!(f, "skipped-cooldown"),
            Self::SkippedSeverityCeiling => write!(f, "skipped-severity-ceiling"),
            Self::Failed                 => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAction {
    pub threat_id:   ThreatId,
    pub action_type: ActionType,
    pub target:      String,
    pub result:      ActionResult,
    pub detail:      Option<String>,
    pub applied_at:  DateTime<Utc>,
}

// ── Notifications ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

impl Urgency {
    /// Message urgency from threat severity and the policy outcome.
    pub fn for_outcome(severity: u8, result: ActionResult) -> Self {
        match result {
            ActionResult::SkippedSeverityCeiling => Self::High,
            ActionResult::Failed if severity >= 5 => Self::Critical,
            ActionResult::Failed => Self::High,
            ActionResult::Applied if severity >= 4 => Self::High,
            ActionResult::Applied if severity == 3 => Self::Normal,
            ActionResult::Applied => Self::Low,
            ActionResult::SkippedCooldown | ActionResult::SkippedSafelist => Self::Low,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low      => write!(f, "LOW"),
            Self::Normal   => write!(f, "NORMAL"),
            Self::High     => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub threat_id:   Option<ThreatId>,
    pub title:       String,
    pub body:        String,
    pub urgency:     Urgency,
    pub severity:    u8,
    pub subject_key: String,
    pub category:    String,
    pub result:      Option<ActionResult>,
    pub created_at:  DateTime<Utc>,
}

impl Notification {
    pub fn for_outcome(threat: &Threat, action: &ResponseAction) -> Self {
        let urgency = Urgency::for_outcome(threat.severity, action.result);
        let title = format!(
            "[{}] {} on {} (severity {}/5)",
            urgency, threat.category, threat.subject_key, threat.severity
        );

        let mut body = String::new();
        body.push_str(&format!("Threat:   {}\n", threat.id));
        body.push_str(&format!("Subject:  {}\n", threat.subject_key));
        body.push_str(&format!("Category: {}\n", threat.category));
        body.push_str(&format!("Severity: {}/5  max_score={:.4}\n", threat.severity, threat.max_score()));
        body.push_str(&format!("Action:   {} -> {} ({})\n", action.action_type, action.target, action.result));
        if let Some(ref detail) = action.detail {
            body.push_str(&format!("Detail:   {}\n", detail));
        }
        body.push_str(&format!("Detected: {}\n", threat.created_at.to_rfc3339()));
        body.push_str("Signals:\n");
        for obs in &threat.observations {
            body.push_str(&format!(
                "  - {}/{} score={:.3} confidence={:.2}\n",
                obs.origin, obs.scorer, obs.score, obs.confidence
            ));
        }

        Self {
            threat_id:   Some(threat.id),
            title,
            body,
            urgency,
            severity:    threat.severity,
            subject_key: threat.subject_key.clone(),
            category:    threat.category.to_string(),
            result:      Some(action.result),
            created_at:  Utc::now(),
        }
    }
}
