// warden/src/engine/policy.rs
//
// Response policy: one decision per Threat, short-circuiting in order
//
//   1. safe list                 → skipped-safelist          suppressed
//   2. severity > max_severity   → skipped-severity-ceiling  suppressed
//   3. active cooldown           → skipped-cooldown          suppressed
//   4. action table              → applied | failed          actioned | suppressed
//
// Notify-only outcomes (auto-response off, health alerts, no table match, or
// a subject that is not an enforceable target) are `applied` without calling
// the enforcer and start no cooldown. Every enforcement attempt, successful
// or not, starts a cooldown for (subject, category).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::cooldown::CooldownTracker;
use super::safelist::SafeList;
use crate::config::ResponseConfig;
use crate::events::{ActionResult, ActionType, Notification, ResponseAction, Threat, ThreatCategory, ThreatStatus};
use crate::metrics::PipelineMetrics;
use crate::response::{EnforcementError, Enforcer, Target};
use crate::store::{ManualAction, ThreatStore};

/// The decision before any side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip(ActionResult),
    NotifyOnly(Option<String>),
    Enforce(ActionType),
}

pub struct PolicyEngine {
    config:    ResponseConfig,
    safelist:  Arc<SafeList>,
    cooldowns: Arc<CooldownTracker>,
    enforcer:  Arc<dyn Enforcer>,
    store:     Arc<ThreatStore>,
    metrics:   Arc<PipelineMetrics>,
}

impl PolicyEngine {
    pub fn new(
        config:   ResponseConfig,
        enforcer: Arc<dyn Enforcer>,
        store:    Arc<ThreatStore>,
        metrics:  Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            safelist:  Arc::new(SafeList::from_config(&config)),
            cooldowns: Arc::new(CooldownTracker::new()),
            config,
            enforcer,
            store,
            metrics,
        }
    }

    pub fn safelist(&self) -> Arc<SafeList> {
        self.safelist.clone()
    }

    pub fn cooldowns(&self) -> Arc<CooldownTracker> {
        self.cooldowns.clone()
    }

    /// First matching rule of the action table, notify-only when none match.
    pub fn planned_action(&self, threat: &Threat) -> ActionType {
        self.config
            .action_table
            .iter()
            .find(|r| r.matches(&threat.category, threat.severity))
            .map(|r| r.action)
            .unwrap_or(ActionType::NotifyOnly)
    }

    pub fn decide(&self, threat: &Threat) -> Decision {
        let subject = &threat.subject_key;
        if self.safelist.contains(subject) {
            return Decision::Skip(ActionResult::SkippedSafelist);
        }
        if threat.severity > self.config.max_severity {
            return Decision::Skip(ActionResult::SkippedSeverityCeiling);
        }
        if self.cooldowns.active(subject, &threat.category, Utc::now()).is_some() {
            return Decision::Skip(ActionResult::SkippedCooldown);
        }
        if !self.config.auto_response {
            return Decision::NotifyOnly(Some("auto-response disabled".into()));
        }
        if threat.is_health_alert() {
            return Decision::NotifyOnly(None);
        }
        match self.planned_action(threat) {
            ActionType::NotifyOnly => Decision::NotifyOnly(None),
            action => match Target::for_action(action, subject) {
                Ok(_) => Decision::Enforce(action),
                Err(e) => Decision::NotifyOnly(Some(format!("{} not enforceable: {}", action, e))),
            },
        }
    }

    /// Evaluate one Threat end to end: decide, enforce, record, and build
    /// the notification for it.
    pub async fn process(&self, threat: &Threat) -> (ResponseAction, Notification) {
        let subject = threat.subject_key.clone();
        let (action_type, result, detail, status) = match self.decide(threat) {
            Decision::Skip(result) => {
                let detail = match result {
                    ActionResult::SkippedSeverityCeiling => Some(format!(
                        "severity {} above automated ceiling {}", threat.severity, self.config.max_severity
                    )),
                    _ => None,
                };
                (self.planned_action(threat), result, detail, ThreatStatus::Suppressed)
            }
            Decision::NotifyOnly(detail) => {
                (ActionType::NotifyOnly, ActionResult::Applied, detail, ThreatStatus::Actioned)
            }
            Decision::Enforce(action) => {
                let outcome = self.enforce(action, &subject).await;
                self.cooldowns.start(&subject, &threat.category, Utc::now(), self.config.cooldown());
                match outcome {
                    Ok(detail) => (action, ActionResult::Applied, Some(detail), ThreatStatus::Actioned),
                    Err(e) => (action, ActionResult::Failed, Some(e.to_string()), ThreatStatus::Suppressed),
                }
            }
        };

        let action = ResponseAction {
            threat_id: threat.id,
            action_type,
            target: subject,
            result,
            detail,
            applied_at: Utc::now(),
        };

        if let Err(e) = self.store.record_outcome(action.clone(), status) {
            error!(threat_id = %threat.id, error = %e, "response outcome not stored");
        }
        self.metrics.record_action(result);

        match result {
            ActionResult::Applied => info!(
                threat_id = %threat.id, subject = %action.target, action = %action_type, "response applied"
            ),
            ActionResult::Failed => warn!(
                threat_id = %threat.id, subject = %action.target, action = %action_type,
                detail = action.detail.as_deref().unwrap_or(""), "response failed"
            ),
            skipped => info!(
                threat_id = %threat.id, subject = %action.target, action = %action_type, result = %skipped,
                "response skipped"
            ),
        }

        let mut evaluated = threat.clone();
        evaluated.status = status;
        let notification = Notification::for_outcome(&evaluated, &action);
        (action, notification)
    }

    async fn enforce(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
        let timeout = self.config.enforcement_timeout();
        match tokio::time::timeout(timeout, self.enforcer.apply(action, target)).await {
            Ok(res) => res,
            Err(_) => Err(EnforcementError::Timeout(timeout)),
        }
    }

    // ── Manual operations ────────────────────────────────────────────────────

    /// Operator-requested enforcement. Honors the safe list and cooldowns the
    /// same way automated responses do.
    pub async fn manual_block(&self, action: ActionType, target: &str) -> ManualAction {
        let category = category_for_action(action);
        let now = Utc::now();

        let (result, detail) = if self.safelist.contains(target) {
            (ActionResult::SkippedSafelist, None)
        } else if let Some(entry) = self.cooldowns.active(target, &category, now) {
            (ActionResult::SkippedCooldown, Some(format!("cooldown until {}", entry.expires_at.to_rfc3339())))
        } else {
            let outcome = self.enforce(action, target).await;
            if !matches!(outcome, Err(EnforcementError::InvalidTarget { .. } | EnforcementError::Unsupported(_))) {
                self.cooldowns.start(target, &category, Utc::now(), self.config.cooldown());
            }
            match outcome {
                Ok(detail) => (ActionResult::Applied, Some(detail)),
                Err(e) => (ActionResult::Failed, Some(e.to_string())),
            }
        };

        let record = ManualAction {
            action_type: action,
            target: target.to_string(),
            revert: false,
            result,
            detail,
            at: Utc::now(),
        };
        warn!(action = %action, subject = %target, result = %result, "manual block");
        self.store.record_manual(record.clone());
        self.metrics.record_action(result);
        record
    }

    /// Revert an earlier action and clear every cooldown on the target.
    pub async fn manual_unblock(&self, action: ActionType, target: &str) -> ManualAction {
        let timeout = self.config.enforcement_timeout();
        let outcome = match tokio::time::timeout(timeout, self.enforcer.revert(action, target)).await {
            Ok(res) => res,
            Err(_) => Err(EnforcementError::Timeout(timeout)),
        };
        let cleared = self.cooldowns.clear(target);

        let (result, detail) = match outcome {
            Ok(detail) => (ActionResult::Applied, Some(detail)),
            Err(e) => (ActionResult::Failed, Some(e.to_string())),
        };
        let record = ManualAction {
            action_type: action,
            target: target.to_string(),
            revert: true,
            result,
            detail,
            at: Utc::now(),
        };
        warn!(action = %action, subject = %target, result = %result, cooldowns_cleared = cleared, "manual unblock");
        self.store.record_manual(record.clone());
        record
    }
}

/// Category a manual action is tracked under in the cooldown map.
pub fn category_for_action(action: ActionType) -> ThreatCategory {
    match action {
        ActionType::BlockConnection => ThreatCategory::network(),
        ActionType::TerminateProcess => ThreatCategory::system(),
        ActionType::IsolateHost | ActionType::NotifyOnly => ThreatCategory::Composite,
    }
}

// ── Policy task ──────────────────────────────────────────────────────────────

pub struct PolicyStage {
    pub engine:        Arc<PolicyEngine>,
    pub threats:       mpsc::UnboundedReceiver<Threat>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub metrics:       Arc<PipelineMetrics>,
}

impl PolicyStage {
    /// Single consumer of emitted Threats. Once shutdown is signalled the
    /// stage keeps evaluating until every sender is gone and the channel is
    /// empty, so no emitted Threat is left `new`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("policy engine started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                t = self.threats.recv() => match t {
                    Some(t) => self.handle(t).await,
                    None => break,
                },
            }
        }

        let mut drained = 0usize;
        while let Some(threat) = self.threats.recv().await {
            self.handle(threat).await;
            drained += 1;
        }
        info!(drained, "policy engine stopped");
    }

    async fn handle(&self, threat: Threat) {
        self.metrics.policy_backlog.fetch_sub(1, Ordering::Relaxed);

        let (_, notification) = self.engine.process(&threat).await;
        if self.notifications.send(notification).is_ok() {
            self.metrics.dispatch_backlog.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(threat_id = %threat.id, "dispatcher gone, notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::events::{AnomalyObservation, Category, Features, ObservationKind, ThreatId, Urgency};

    #[derive(Default)]
    struct FakeEnforcer {
        calls: Mutex<Vec<(ActionType, String, bool)>>,
        fail:  bool,
        hang:  bool,
    }

    #[async_trait]
    impl Enforcer for FakeEnforcer {
        fn name(&self) -> &str { "fake" }

        async fn apply(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
            self.calls.lock().push((action, target.to_string(), false));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(EnforcementError::CommandFailed { command: "fake".into(), detail: "boom".into() });
            }
            Ok("done".into())
        }

        async fn revert(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
            self.calls.lock().push((action, target.to_string(), true));
            Ok("reverted".into())
        }
    }

    fn threat(id: u64, subject: &str, category: ThreatCategory, severity: u8) -> Threat {
        let origin = match &category {
            ThreatCategory::Anomaly(c) => c.clone(),
            ThreatCategory::Composite => Category::Network,
        };
        Threat {
            id: ThreatId(id),
            subject_key: subject.into(),
            category,
            severity,
            observations: vec![AnomalyObservation {
                origin,
                subject_key: subject.into(),
                scorer:      "s".into(),
                kind:        ObservationKind::Anomaly,
                score:       0.8,
                confidence:  1.0,
                features:    Features::new(),
                timestamp:   Utc::now(),
            }],
            created_at: Utc::now(),
            status: ThreatStatus::New,
        }
    }

    fn engine_with(config: ResponseConfig, enforcer: Arc<FakeEnforcer>) -> (PolicyEngine, Arc<ThreatStore>) {
        let store = Arc::new(ThreatStore::new());
        let engine = PolicyEngine::new(config, enforcer, store.clone(), PipelineMetrics::new());
        (engine, store)
    }

    async fn run(engine: &PolicyEngine, store: &ThreatStore, t: Threat) -> (ResponseAction, Notification) {
        store.insert(t.clone()).unwrap();
        engine.process(&t).await
    }

    #[tokio::test]
    async fn network_threat_is_blocked_then_cooled_down() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());

        let (a, n) = run(&engine, &store, threat(1, "10.0.0.5", ThreatCategory::network(), 3)).await;
        assert_eq!(a.action_type, ActionType::BlockConnection);
        assert_eq!(a.result, ActionResult::Applied);
        assert_eq!(n.urgency, Urgency::Normal);
        assert_eq!(store.get(ThreatId(1)).unwrap().threat.status, ThreatStatus::Actioned);

        let (a, _) = run(&engine, &store, threat(2, "10.0.0.5", ThreatCategory::network(), 3)).await;
        assert_eq!(a.result, ActionResult::SkippedCooldown);
        assert_eq!(store.get(ThreatId(2)).unwrap().threat.status, ThreatStatus::Suppressed);
        assert_eq!(enforcer.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn safelisted_subject_is_never_enforced() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());

        let (a, _) = run(&engine, &store, threat(1, "127.0.0.1", ThreatCategory::network(), 5)).await;
        assert_eq!(a.result, ActionResult::SkippedSafelist);
        let (a, _) = run(&engine, &store, threat(2, "sshd:812", ThreatCategory::system(), 3)).await;
        assert_eq!(a.result, ActionResult::SkippedSafelist);
        assert!(enforcer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn severity_above_ceiling_needs_a_human() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());

        let (a, n) = run(&engine, &store, threat(1, "10.0.0.5", ThreatCategory::network(), 4)).await;
        assert_eq!(a.result, ActionResult::SkippedSeverityCeiling);
        assert_eq!(a.action_type, ActionType::BlockConnection);
        assert_eq!(n.urgency, Urgency::High);
        assert!(enforcer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_enforcement_still_starts_cooldown() {
        let enforcer = Arc::new(FakeEnforcer { fail: true, ..Default::default() });
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());

        let (a, n) = run(&engine, &store, threat(1, "10.0.0.5", ThreatCategory::network(), 3)).await;
        assert_eq!(a.result, ActionResult::Failed);
        assert_eq!(n.urgency, Urgency::High);
        assert_eq!(store.get(ThreatId(1)).unwrap().threat.status, ThreatStatus::Suppressed);
        assert!(engine.cooldowns().active("10.0.0.5", &ThreatCategory::network(), Utc::now()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn enforcement_timeout_is_a_failure() {
        let enforcer = Arc::new(FakeEnforcer { hang: true, ..Default::default() });
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer);

        let (a, _) = run(&engine, &store, threat(1, "10.0.0.5", ThreatCategory::network(), 3)).await;
        assert_eq!(a.result, ActionResult::Failed);
        assert!(a.detail.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn notify_only_paths_skip_the_enforcer() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let config = ResponseConfig { auto_response: false, ..Default::default() };
        let (engine, store) = engine_with(config, enforcer.clone());
        let (a, _) = run(&engine, &store, threat(1, "10.0.0.5", ThreatCategory::network(), 3)).await;
        assert_eq!((a.action_type, a.result), (ActionType::NotifyOnly, ActionResult::Applied));
        assert_eq!(store.get(ThreatId(1)).unwrap().threat.status, ThreatStatus::Actioned);

        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());
        // Below the network rule's severity.
        let (a, _) = run(&engine, &store, threat(1, "10.0.0.6", ThreatCategory::network(), 2)).await;
        assert_eq!(a.action_type, ActionType::NotifyOnly);
        // Hostname subjects cannot be blocked.
        let (a, _) = run(&engine, &store, threat(2, "web-01", ThreatCategory::network(), 3)).await;
        assert_eq!(a.action_type, ActionType::NotifyOnly);
        assert!(a.detail.unwrap().contains("not enforceable"));

        let mut health = threat(3, "detector/system", ThreatCategory::system(), 3);
        health.observations[0].kind = ObservationKind::HealthAlert;
        let (a, _) = run(&engine, &store, health).await;
        assert_eq!(a.action_type, ActionType::NotifyOnly);

        assert!(enforcer.calls.lock().is_empty());
        assert!(engine.cooldowns().is_empty());
    }

    #[tokio::test]
    async fn manual_block_respects_guards_and_unblock_clears_cooldown() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());

        let m = engine.manual_block(ActionType::BlockConnection, "127.0.0.1").await;
        assert_eq!(m.result, ActionResult::SkippedSafelist);

        let m = engine.manual_block(ActionType::BlockConnection, "10.0.0.5").await;
        assert_eq!(m.result, ActionResult::Applied);
        let m = engine.manual_block(ActionType::BlockConnection, "10.0.0.5").await;
        assert_eq!(m.result, ActionResult::SkippedCooldown);

        let m = engine.manual_unblock(ActionType::BlockConnection, "10.0.0.5").await;
        assert!(m.revert);
        assert_eq!(m.result, ActionResult::Applied);
        assert!(engine.cooldowns().is_empty());
        assert_eq!(store.manual_actions().len(), 4);
        assert_eq!(enforcer.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn stage_emits_one_notification_per_threat() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer);
        let metrics = PipelineMetrics::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        for id in 1..=3 {
            let t = threat(id, &format!("10.0.0.{}", id), ThreatCategory::network(), 3);
            store.insert(t.clone()).unwrap();
            metrics.policy_backlog.fetch_add(1, Ordering::Relaxed);
            tx.send(t).unwrap();
        }

        let stage = PolicyStage { engine: Arc::new(engine), threats: rx, notifications: ntx, metrics: metrics.clone() };
        let handle = tokio::spawn(stage.run(stop_rx));

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(nrx.recv().await.unwrap().threat_id.unwrap());
        }
        assert_eq!(ids, vec![ThreatId(1), ThreatId(2), ThreatId(3)]);

        stop_tx.send(true).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(metrics.policy_backlog.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.dispatch_backlog.load(Ordering::Relaxed), 3);
        assert!(nrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn queued_threats_are_evaluated_after_stop() {
        let enforcer = Arc::new(FakeEnforcer::default());
        let (engine, store) = engine_with(ResponseConfig::default(), enforcer.clone());
        let metrics = PipelineMetrics::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        for id in 1..=3 {
            let t = threat(id, &format!("10.0.1.{}", id), ThreatCategory::network(), 3);
            store.insert(t.clone()).unwrap();
            metrics.policy_backlog.fetch_add(1, Ordering::Relaxed);
            tx.send(t).unwrap();
        }
        // Stop is already pending when the stage first polls.
        stop_tx.send(true).unwrap();
        drop(tx);

        let stage = PolicyStage { engine: Arc::new(engine), threats: rx, notifications: ntx, metrics: metrics.clone() };
        stage.run(stop_rx).await;

        let mut notes = 0;
        while nrx.try_recv().is_ok() {
            notes += 1;
        }
        assert_eq!(notes, 3);
        for id in 1..=3 {
            let record = store.get(ThreatId(id)).unwrap();
            assert_eq!(record.threat.status, ThreatStatus::Actioned);
            assert_eq!(record.actions.len(), 1);
        }
        assert_eq!(enforcer.calls.lock().len(), 3);
        assert_eq!(metrics.policy_backlog.load(Ordering::Relaxed), 0);
    }
}
