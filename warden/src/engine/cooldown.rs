// warden/src/engine/cooldown.rs
//
// Per-(subject, category) suppression after an enforcement attempt. An entry
// is active while now < expires_at and expires passively.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::events::ThreatCategory;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooldownEntry {
    pub subject_key:    String,
    pub category:       ThreatCategory,
    pub last_action_at: DateTime<Utc>,
    pub expires_at:     DateTime<Utc>,
}

#[derive(Default)]
pub struct CooldownTracker {
    entries: DashMap<(String, ThreatCategory), CooldownEntry>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, subject: &str, category: &ThreatCategory, now: DateTime<Utc>) -> Option<CooldownEntry> {
        self.entries
            .get(&(subject.to_string(), category.clone()))
            .filter(|e| now < e.expires_at)
            .map(|e| e.clone())
    }

    pub fn start(&self, subject: &str, category: &ThreatCategory, now: DateTime<Utc>, period: Duration) -> CooldownEntry {
        let entry = CooldownEntry {
            subject_key:    subject.to_string(),
            category:       category.clone(),
            last_action_at: now,
            expires_at:     now + period,
        };
        self.entries.insert((subject.to_string(), category.clone()), entry.clone());
        entry
    }

    /// Remove every entry for a subject. Returns how many were removed.
    pub fn clear(&self, subject: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(s, _), _| s != subject);
        before - self.entries.len()
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
