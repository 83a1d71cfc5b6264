// warden/src/config.rs
//
// Typed pipeline configuration. Every section has defaults so a partial JSON
// file (or none at all) yields a runnable daemon. Named profiles cover the usual
// deployment presets: default, development, production, testing.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{ActionType, Category, ThreatCategory, Urgency};

/// Upper bound for any configured period, ten years in seconds.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange { field: String, range: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(String),
    #[error("no detection categories are enabled")]
    NoCategories,
    #[error("unknown profile {0:?}")]
    UnknownProfile(String),
}

// ── Detection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub enabled:              bool,
    pub interval_secs:        u64,
    /// Per-category floor below which scorer results are not emitted.
    pub min_emit_score:       f64,
    pub scorer_timeout_ms:    u64,
    pub sample_timeout_ms:    u64,
    /// Consecutive failed cycles before the loop is degraded.
    pub failure_threshold:    u32,
    pub backoff_ceiling_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled:              true,
            interval_secs:        60,
            min_emit_score:       0.0,
            scorer_timeout_ms:    2_000,
            sample_timeout_ms:    5_000,
            failure_threshold:    5,
            backoff_ceiling_secs: 600,
        }
    }
}

impl DetectorConfig {
    pub fn interval(&self)        -> Duration { Duration::from_secs(self.interval_secs) }
    pub fn scorer_timeout(&self)  -> Duration { Duration::from_millis(self.scorer_timeout_ms) }
    pub fn sample_timeout(&self)  -> Duration { Duration::from_millis(self.sample_timeout_ms) }
    pub fn backoff_ceiling(&self) -> Duration { Duration::from_secs(self.backoff_ceiling_secs) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub detectors:       BTreeMap<Category, DetectorConfig>,
    /// Intake queue capacity; the oldest observation is dropped when full.
    pub intake_capacity: usize,
    /// Log file tailed by the log sampler.
    pub log_path:        Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let detectors = [Category::Network, Category::System, Category::Log]
            .into_iter()
            .map(|c| (c, DetectorConfig::default()))
            .collect();
        Self { detectors, intake_capacity: 4_096, log_path: None }
    }
}

impl DetectionConfig {
    pub fn enabled(&self) -> impl Iterator<Item = (&Category, &DetectorConfig)> {
        self.detectors.iter().filter(|(_, d)| d.enabled)
    }

    pub fn detector(&self, category: &Category) -> DetectorConfig {
        self.detectors.get(category).cloned().unwrap_or_default()
    }
}

// ── Fusion ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub window_secs:     u64,
    pub reporting_floor: u8,
    /// How often open candidates are checked for window expiry.
    pub tick_ms:         u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { window_secs: 10, reporting_floor: 1, tick_ms: 500 }
    }
}

// ── Response ─────────────────────────────────────────────────────────────────

/// One row of the severity/category → action table. `category = None`
/// matches every category. First matching row wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRule {
    #[serde(default)]
    pub category:     Option<ThreatCategory>,
    pub min_severity: u8,
    pub action:       ActionType,
}

impl ActionRule {
    pub fn matches(&self, category: &ThreatCategory, severity: u8) -> bool {
        severity >= self.min_severity
            && self.category.as_ref().map(|c| c == category).unwrap_or(true)
    }
}

pub fn default_action_table() -> Vec<ActionRule> {
    vec![
        ActionRule { category: Some(ThreatCategory::network()), min_severity: 3, action: ActionType::BlockConnection },
        ActionRule { category: Some(ThreatCategory::system()),  min_severity: 4, action: ActionType::TerminateProcess },
        ActionRule { category: Some(ThreatCategory::Composite), min_severity: 4, action: ActionType::IsolateHost },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub auto_response:          bool,
    /// Severity ceiling for automated action. Above it a human decides.
    pub max_severity:           u8,
    pub cooldown_secs:          u64,
    pub enforcement_timeout_ms: u64,
    /// Log enforcement commands instead of executing them.
    pub simulation_mode:        bool,
    pub safe_ips:               Vec<IpAddr>,
    pub safe_processes:         Vec<String>,
    pub safe_subjects:          Vec<String>,
    pub action_table:           Vec<ActionRule>,
    /// When set, enforcement is written to this directory as JSONL instead
    /// of executing local commands.
    pub enforcement_journal:    Option<PathBuf>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            auto_response:          true,
            max_severity:           3,
            cooldown_secs:          300,
            enforcement_timeout_ms: 10_000,
            simulation_mode:        false,
            safe_ips:               vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)],
            safe_processes:         vec!["systemd".into(), "sshd".into(), "warden".into()],
            safe_subjects:          Vec::new(),
            action_table:           default_action_table(),
            enforcement_journal:    None,
        }
    }
}

impl ResponseConfig {
    pub fn cooldown(&self) -> chrono::Duration { chrono_secs(self.cooldown_secs) }
    pub fn enforcement_timeout(&self) -> Duration { Duration::from_millis(self.enforcement_timeout_ms) }
}

// ── Notification ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Writes alerts to the tracing log. Always available.
    Log {
        #[serde(default = "default_min_urgency")]
        min_urgency: Urgency,
    },
    /// SMTP delivery, optionally upgraded with STARTTLS and authenticated.
    Email {
        smtp_host:  String,
        #[serde(default = "default_smtp_port")]
        smtp_port:  u16,
        #[serde(default)]
        starttls:   bool,
        #[serde(default)]
        username:   Option<String>,
        #[serde(default)]
        password:   Option<String>,
        sender:     String,
        recipients: Vec<String>,
        #[serde(default = "default_min_urgency")]
        min_urgency: Urgency,
    },
    /// Slack-compatible incoming webhook.
    Chat {
        webhook_url: String,
        #[serde(default = "default_min_urgency")]
        min_urgency: Urgency,
    },
    /// Generic JSON webhook, optionally HMAC-SHA256 signed.
    Webhook {
        url:     String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        secret:  Option<String>,
        #[serde(default)]
        include_hostname: bool,
        #[serde(default = "default_min_urgency")]
        min_urgency: Urgency,
    },
}

fn default_min_urgency() -> Urgency { Urgency::Low }
fn default_smtp_port() -> u16 { 25 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channels:     Vec<ChannelConfig>,
    pub max_attempts: u32,
    pub backoff_ms:   u64,
    pub timeout_ms:   u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channels:     vec![ChannelConfig::Log { min_urgency: Urgency::Low }],
            max_attempts: 3,
            backoff_ms:   500,
            timeout_ms:   5_000,
        }
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub retention_secs:          u64,
    /// Actioned threats are audit-critical and kept longer.
    pub actioned_retention_secs: u64,
    pub sweep_interval_secs:     u64,
    /// Directory for the JSONL threat journal.
    pub journal_dir:             Option<PathBuf>,
}

impl StoreConfig {
    pub fn retention(&self)          -> chrono::Duration { chrono_secs(self.retention_secs) }
    pub fn actioned_retention(&self) -> chrono::Duration { chrono_secs(self.actioned_retention_secs) }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_secs:          30 * 24 * 3600,
            actioned_retention_secs: 90 * 24 * 3600,
            sweep_interval_secs:     3600,
            journal_dir:             None,
        }
    }
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub report_interval_secs: u64,
    /// Backlog depth above which the fusion → policy → dispatch handoffs
    /// are reported as unhealthy.
    pub backlog_warning:      usize,
    pub metrics_addr:         Option<SocketAddr>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { report_interval_secs: 60, backlog_warning: 1_000, metrics_addr: None }
    }
}

// ── Root ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection:    DetectionConfig,
    pub fusion:       FusionConfig,
    pub response:     ResponseConfig,
    pub notification: NotificationConfig,
    pub store:        StoreConfig,
    pub health:       HealthConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Named deployment preset.
    pub fn profile(name: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        match name {
            "default" => {}
            "development" => {
                for d in config.detection.detectors.values_mut() {
                    d.interval_secs = 15;
                }
                config.response.simulation_mode = true;
            }
            "production" => {
                for d in config.detection.detectors.values_mut() {
                    d.interval_secs = 30;
                }
                config.response.max_severity = 2;
            }
            "testing" => {
                config.response.auto_response = false;
                config.health.report_interval_secs = 60;
            }
            other => return Err(ConfigError::UnknownProfile(other.to_string())),
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detection.enabled().next().is_none() {
            return Err(ConfigError::NoCategories);
        }
        for (category, d) in self.detection.enabled() {
            if d.interval_secs == 0 {
                return Err(ConfigError::Zero(format!("detection.{}.interval_secs", category)));
            }
            if d.scorer_timeout_ms == 0 {
                return Err(ConfigError::Zero(format!("detection.{}.scorer_timeout_ms", category)));
            }
            if !(0.0..=1.0).contains(&d.min_emit_score) {
                return Err(ConfigError::OutOfRange {
                    field: format!("detection.{}.min_emit_score", category),
                    range: "[0, 1]",
                    value: d.min_emit_score.to_string(),
                });
            }
            if d.failure_threshold == 0 {
                return Err(ConfigError::Zero(format!("detection.{}.failure_threshold", category)));
            }
            bounded(&format!("detection.{}.interval_secs", category), d.interval_secs)?;
            bounded(&format!("detection.{}.backoff_ceiling_secs", category), d.backoff_ceiling_secs)?;
        }
        if self.detection.intake_capacity == 0 {
            return Err(ConfigError::Zero("detection.intake_capacity".into()));
        }
        if !(1..=5).contains(&self.fusion.reporting_floor) {
            return Err(ConfigError::OutOfRange {
                field: "fusion.reporting_floor".into(),
                range: "1..=5",
                value: self.fusion.reporting_floor.to_string(),
            });
        }
        if self.fusion.tick_ms == 0 {
            return Err(ConfigError::Zero("fusion.tick_ms".into()));
        }
        if self.response.max_severity > 5 {
            return Err(ConfigError::OutOfRange {
                field: "response.max_severity".into(),
                range: "0..=5",
                value: self.response.max_severity.to_string(),
            });
        }
        if let Some(rule) = self.response.action_table.iter().find(|r| !(1..=5).contains(&r.min_severity)) {
            return Err(ConfigError::OutOfRange {
                field: "response.action_table.min_severity".into(),
                range: "1..=5",
                value: rule.min_severity.to_string(),
            });
        }
        if self.notification.max_attempts == 0 {
            return Err(ConfigError::Zero("notification.max_attempts".into()));
        }
        bounded("fusion.window_secs", self.fusion.window_secs)?;
        bounded("response.cooldown_secs", self.response.cooldown_secs)?;
        bounded("store.retention_secs", self.store.retention_secs)?;
        bounded("store.actioned_retention_secs", self.store.actioned_retention_secs)?;
        bounded("store.sweep_interval_secs", self.store.sweep_interval_secs)?;
        bounded("health.report_interval_secs", self.health.report_interval_secs)?;
        Ok(())
    }
}

fn bounded(field: &str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::OutOfRange {
            field: field.into(),
            range: "0..=315360000 seconds",
            value: secs.to_string(),
        });
    }
    Ok(())
}
