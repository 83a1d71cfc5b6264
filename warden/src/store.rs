// warden/src/store.rs
//
// Threat Store: append-mostly ledger of Threats and their ResponseActions.
//
//   insert          fusion, once per emitted Threat
//   record_outcome  policy engine, new → actioned | suppressed (terminal)
//   sweep           retention task, stale threats → expired
//   query / get     read-only, through ThreatQuery
//
// The optional journal mirrors every write as JSONL (threats.jsonl,
// actions.jsonl, manual_actions.jsonl) from a background writer task so the
// store itself never awaits disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::events::{ActionResult, ActionType, ResponseAction, Threat, ThreatCategory, ThreatId, ThreatStatus};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("threat {0} already stored")]
    DuplicateId(ThreatId),
    #[error("threat {0} not found")]
    NotFound(ThreatId),
    #[error("threat {id} cannot move from {from} to {to}")]
    InvalidTransition { id: ThreatId, from: ThreatStatus, to: ThreatStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub threat:  Threat,
    pub actions: Vec<ResponseAction>,
}

/// Operator-initiated block / unblock outside the Threat flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualAction {
    pub action_type: ActionType,
    pub target:      String,
    pub revert:      bool,
    pub result:      ActionResult,
    pub detail:      Option<String>,
    pub at:          DateTime<Utc>,
}

// ── Filters ──────────────────────────────────────────────────────────────────

/// Combinable query filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ThreatFilter {
    pub subject:  Option<String>,
    pub category: Option<ThreatCategory>,
    pub status:   Option<ThreatStatus>,
    pub since:    Option<DateTime<Utc>>,
    pub until:    Option<DateTime<Utc>>,
    pub limit:    Option<usize>,
}

impl ThreatFilter {
    pub fn subject(mut self, s: impl Into<String>) -> Self { self.subject = Some(s.into()); self }
    pub fn category(mut self, c: ThreatCategory) -> Self { self.category = Some(c); self }
    pub fn status(mut self, s: ThreatStatus) -> Self { self.status = Some(s); self }
    pub fn since(mut self, t: DateTime<Utc>) -> Self { self.since = Some(t); self }
    pub fn until(mut self, t: DateTime<Utc>) -> Self { self.until = Some(t); self }
    pub fn limit(mut self, n: usize) -> Self { self.limit = Some(n); self }

    fn matches(&self, t: &Threat) -> bool {
        self.subject.as_ref().map_or(true, |s| *s == t.subject_key)
            && self.category.as_ref().map_or(true, |c| *c == t.category)
            && self.status.map_or(true, |s| s == t.status)
            && self.since.map_or(true, |since| t.created_at >= since)
            && self.until.map_or(true, |until| t.created_at < until)
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    records:    BTreeMap<ThreatId, ThreatRecord>,
    by_subject: HashMap<String, BTreeSet<ThreatId>>,
    manual:     Vec<ManualAction>,
}

#[derive(Default)]
pub struct ThreatStore {
    inner:   RwLock<Inner>,
    journal: Option<mpsc::UnboundedSender<JournalEntry>>,
}

impl ThreatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: &Journal) -> Self {
        Self { inner: RwLock::default(), journal: Some(journal.tx.clone()) }
    }

    pub fn insert(&self, threat: Threat) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            if inner.records.contains_key(&threat.id) {
                return Err(StoreError::DuplicateId(threat.id));
            }
            inner.by_subject.entry(threat.subject_key.clone()).or_default().insert(threat.id);
            inner.records.insert(threat.id, ThreatRecord { threat: threat.clone(), actions: Vec::new() });
        }
        self.journal(JournalEntry::Threat(threat));
        Ok(())
    }

    /// Attach the policy outcome and move the threat out of `new`.
    pub fn record_outcome(&self, action: ResponseAction, status: ThreatStatus) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write();
            let id = action.threat_id;
            let rec = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let from = rec.threat.status;
            let allowed = from == ThreatStatus::New
                && matches!(status, ThreatStatus::Actioned | ThreatStatus::Suppressed);
            if !allowed {
                return Err(StoreError::InvalidTransition { id, from, to: status });
            }
            rec.threat.status = status;
            rec.actions.push(action.clone());
        }
        self.journal(JournalEntry::Action(action));
        Ok(())
    }

    pub fn record_manual(&self, action: ManualAction) {
        self.inner.write().manual.push(action.clone());
        self.journal(JournalEntry::Manual(action));
    }

    /// Expire `new`/`suppressed` threats older than `retention` and
    /// `actioned` ones older than `actioned_retention`. Records are never
    /// removed; expiry only changes status. Returns how many expired.
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration, actioned_retention: Duration) -> usize {
        let mut inner = self.inner.write();
        let mut expired = 0;
        for rec in inner.records.values_mut() {
            let age = now - rec.threat.created_at;
            let limit = match rec.threat.status {
                ThreatStatus::New | ThreatStatus::Suppressed => retention,
                ThreatStatus::Actioned => actioned_retention,
                ThreatStatus::Expired => continue,
            };
            if age > limit {
                rec.threat.status = ThreatStatus::Expired;
                expired += 1;
            }
        }
        expired
    }

    pub fn get(&self, id: ThreatId) -> Option<ThreatRecord> {
        self.inner.read().records.get(&id).cloned()
    }

    /// Matching records, newest first.
    pub fn query(&self, filter: &ThreatFilter) -> Vec<ThreatRecord> {
        let inner = self.inner.read();
        let limit = filter.limit.unwrap_or(usize::MAX);

        let candidates: Box<dyn Iterator<Item = &ThreatRecord> + '_> = match &filter.subject {
            Some(subject) => Box::new(
                inner
                    .by_subject
                    .get(subject)
                    .into_iter()
                    .flat_map(|ids| ids.iter().rev())
                    .filter_map(|id| inner.records.get(id)),
            ),
            None => Box::new(inner.records.values().rev()),
        };

        candidates
            .filter(|rec| filter.matches(&rec.threat))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn manual_actions(&self) -> Vec<ManualAction> {
        self.inner.read().manual.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    fn journal(&self, entry: JournalEntry) {
        if let Some(tx) = &self.journal {
            let _ = tx.send(entry);
        }
    }
}

/// Read-only view handed to operators and external surfaces.
#[derive(Clone)]
pub struct ThreatQuery {
    store: Arc<ThreatStore>,
}

impl ThreatQuery {
    pub fn new(store: Arc<ThreatStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, id: ThreatId) -> Option<ThreatRecord> { self.store.get(id) }

    pub fn query(&self, filter: &ThreatFilter) -> Vec<ThreatRecord> { self.store.query(filter) }

    pub fn actions(&self, id: ThreatId) -> Vec<ResponseAction> {
        self.store.get(id).map(|r| r.actions).unwrap_or_default()
    }

    pub fn manual_actions(&self) -> Vec<ManualAction> { self.store.manual_actions() }

    pub fn len(&self) -> usize { self.store.len() }

    pub fn is_empty(&self) -> bool { self.store.is_empty() }
}

// ── Journal ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum JournalEntry {
    Threat(Threat),
    Action(ResponseAction),
    Manual(ManualAction),
    Close,
}

/// Background JSONL writer. `close` ends the task once everything queued
/// ahead of it is on disk, even while stores still hold senders.
pub struct Journal {
    tx:     mpsc::UnboundedSender<JournalEntry>,
    handle: JoinHandle<()>,
}

impl Journal {
    pub fn spawn(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();

        let handle = tokio::spawn(async move {
            info!(dir = %dir.display(), "threat journal open");
            while let Some(entry) = rx.recv().await {
                let (file, line) = match &entry {
                    JournalEntry::Threat(t) => ("threats.jsonl", serde_json::to_string(t)),
                    JournalEntry::Action(a) => ("actions.jsonl", serde_json::to_string(a)),
                    JournalEntry::Manual(m) => ("manual_actions.jsonl", serde_json::to_string(m)),
                    JournalEntry::Close => break,
                };
                let result = match line {
                    Ok(line) => write_line(&dir.join(file), &line).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    error!(file, error = %e, "journal write failed");
                }
            }
            info!("threat journal closed");
        });
        Ok(Self { tx, handle })
    }

    /// Wait for entries queued so far to be written, then stop the writer.
    /// Later writes from surviving stores are discarded.
    pub async fn close(self) {
        let _ = self.tx.send(JournalEntry::Close);
        let _ = self.handle.await;
    }
}

async fn write_line(path: &std::path::Path, line: &str) -> anyhow::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path).await?;
    f.write_all(line.as_bytes()).await?;
    f.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AnomalyObservation, Category, Features, ObservationKind};

    fn threat(id: u64, subject: &str, category: ThreatCategory, age_days: i64) -> Threat {
        let at = Utc::now() - Duration::days(age_days);
        Threat {
            id:           ThreatId(id),
            subject_key:  subject.into(),
            category,
            severity:     3,
            observations: vec![AnomalyObservation {
                origin:      Category::Network,
                subject_key: subject.into(),
                scorer:      "t".into(),
                kind:        ObservationKind::Anomaly,
                score:       0.5,
                confidence:  1.0,
                features:    Features::new(),
                timestamp:   at,
            }],
            created_at:   at,
            status:       ThreatStatus::New,
        }
    }

    fn action(id: u64, result: ActionResult) -> ResponseAction {
        ResponseAction {
            threat_id:   ThreatId(id),
            action_type: ActionType::BlockConnection,
            target:      "10.0.0.5".into(),
            result,
            detail:      None,
            applied_at:  Utc::now(),
        }
    }

    #[test]
    fn status_moves_once_from_new() {
        let store = ThreatStore::new();
        store.insert(threat(1, "10.0.0.5", ThreatCategory::network(), 0)).unwrap();
        assert_eq!(
            store.insert(threat(1, "x", ThreatCategory::network(), 0)),
            Err(StoreError::DuplicateId(ThreatId(1)))
        );

        store.record_outcome(action(1, ActionResult::Applied), ThreatStatus::Actioned).unwrap();
        let err = store.record_outcome(action(1, ActionResult::Applied), ThreatStatus::Suppressed).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: ThreatStatus::Actioned, .. }));

        let rec = store.get(ThreatId(1)).unwrap();
        assert_eq!(rec.threat.status, ThreatStatus::Actioned);
        assert_eq!(rec.actions.len(), 1);
        assert_eq!(
            store.record_outcome(action(9, ActionResult::Applied), ThreatStatus::Actioned),
            Err(StoreError::NotFound(ThreatId(9)))
        );
    }

    #[test]
    fn filters_combine() {
        let store = ThreatStore::new();
        store.insert(threat(1, "10.0.0.5", ThreatCategory::network(), 3)).unwrap();
        store.insert(threat(2, "10.0.0.5", ThreatCategory::Composite, 1)).unwrap();
        store.insert(threat(3, "sshd:22", ThreatCategory::system(), 0)).unwrap();
        store.record_outcome(action(2, ActionResult::SkippedCooldown), ThreatStatus::Suppressed).unwrap();

        let ids = |f: ThreatFilter| store.query(&f).iter().map(|r| r.threat.id.0).collect::<Vec<_>>();
        assert_eq!(ids(ThreatFilter::default()), vec![3, 2, 1]);
        assert_eq!(ids(ThreatFilter::default().subject("10.0.0.5")), vec![2, 1]);
        assert_eq!(ids(ThreatFilter::default().subject("10.0.0.5").status(ThreatStatus::New)), vec![1]);
        assert_eq!(ids(ThreatFilter::default().category(ThreatCategory::system())), vec![3]);
        assert_eq!(ids(ThreatFilter::default().since(Utc::now() - Duration::days(2))), vec![3, 2]);
        assert_eq!(ids(ThreatFilter::default().until(Utc::now() - Duration::hours(12))), vec![2, 1]);
        assert_eq!(ids(ThreatFilter::default().limit(1)), vec![3]);
        assert!(ids(ThreatFilter::default().subject("nobody")).is_empty());
    }

    #[test]
    fn sweep_uses_longer_retention_for_actioned() {
        let store = ThreatStore::new();
        store.insert(threat(1, "a", ThreatCategory::network(), 40)).unwrap();
        store.insert(threat(2, "b", ThreatCategory::network(), 40)).unwrap();
        store.insert(threat(3, "c", ThreatCategory::network(), 5)).unwrap();
        store.insert(threat(4, "d", ThreatCategory::network(), 120)).unwrap();
        store.record_outcome(action(2, ActionResult::Applied), ThreatStatus::Actioned).unwrap();

        assert_eq!(store.sweep(Utc::now(), Duration::days(30), Duration::days(90)), 2);
        assert_eq!(store.get(ThreatId(1)).unwrap().threat.status, ThreatStatus::Expired);
        assert_eq!(store.get(ThreatId(2)).unwrap().threat.status, ThreatStatus::Actioned);
        assert_eq!(store.get(ThreatId(3)).unwrap().threat.status, ThreatStatus::New);
        assert_eq!(store.get(ThreatId(4)).unwrap().threat.status, ThreatStatus::Expired);
    }

    #[test]
    fn expired_records_stay_queryable() {
        let store = ThreatStore::new();
        store.insert(threat(4, "d", ThreatCategory::network(), 400)).unwrap();
        store.record_outcome(action(4, ActionResult::Applied), ThreatStatus::Actioned).unwrap();

        assert_eq!(store.sweep(Utc::now(), Duration::days(30), Duration::days(90)), 1);
        // Later passes leave the expired record in place.
        assert_eq!(store.sweep(Utc::now(), Duration::days(30), Duration::days(90)), 0);
        assert_eq!(store.sweep(Utc::now() + Duration::days(365), Duration::days(30), Duration::days(90)), 0);

        let rec = store.get(ThreatId(4)).unwrap();
        assert_eq!(rec.threat.status, ThreatStatus::Expired);
        assert_eq!(rec.actions.len(), 1);
        let found = store.query(&ThreatFilter::default().subject("d").status(ThreatStatus::Expired));
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn journal_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::spawn(dir.path()).unwrap();
        let store = ThreatStore::with_journal(&journal);
        store.insert(threat(7, "10.0.0.5", ThreatCategory::network(), 0)).unwrap();
        store.record_outcome(action(7, ActionResult::Applied), ThreatStatus::Actioned).unwrap();
        drop(store);
        journal.close().await;

        let threats = std::fs::read_to_string(dir.path().join("threats.jsonl")).unwrap();
        let parsed: Threat = serde_json::from_str(threats.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.id, ThreatId(7));
        let actions = std::fs::read_to_string(dir.path().join("actions.jsonl")).unwrap();
        assert!(actions.contains("\"result\":\"applied\""));
    }

    #[tokio::test]
    async fn journal_closes_while_store_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::spawn(dir.path()).unwrap();
        let store = Arc::new(ThreatStore::with_journal(&journal));
        let reader = ThreatQuery::new(store.clone());
        store.insert(threat(8, "10.0.0.8", ThreatCategory::network(), 0)).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), journal.close()).await.unwrap();
        assert!(reader.get(ThreatId(8)).is_some());

        // Writes after close are dropped without blocking.
        store.insert(threat(9, "10.0.0.9", ThreatCategory::network(), 0)).unwrap();
        let threats = std::fs::read_to_string(dir.path().join("threats.jsonl")).unwrap();
        assert_eq!(threats.lines().count(), 1);
    }
}
