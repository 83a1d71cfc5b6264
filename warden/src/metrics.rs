// warden/src/metrics.rs
//
// Pipeline counters, backlog gauges and the health reporting loop.
//
// Metrics exposed (Prometheus text format):
//
//   warden_observations_total            Counter  observations pushed to intake
//   warden_observations_dropped_total    Counter  dropped by the drop-oldest intake
//   warden_scorer_failures_total         Counter  unavailable / mismatch / timeout
//   warden_sampler_failures_total        Counter
//   warden_health_alerts_total           Counter  loops entering degraded state
//   warden_threats_total                 Counter  threats emitted by fusion
//   warden_actions_total{result}         Counter  policy outcomes
//   warden_notifications_total{outcome}  Counter  delivered / failed per channel
//   warden_backlog{stage}                Gauge    fusion→policy, policy→dispatch
//   warden_degraded_loops                Gauge

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::events::ActionResult;

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PipelineMetrics {
    pub observations:           AtomicU64,
    pub observations_dropped:   AtomicU64,
    pub scorer_failures:        AtomicU64,
    pub sampler_failures:       AtomicU64,
    pub health_alerts:          AtomicU64,
    pub threats:                AtomicU64,
    pub threats_below_floor:    AtomicU64,
    pub actions:                [AtomicU64; 5],
    pub notifications_sent:     AtomicU64,
    pub notifications_failed:   AtomicU64,
    pub policy_backlog:         AtomicUsize,
    pub dispatch_backlog:       AtomicUsize,
    pub degraded_loops:         AtomicUsize,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_action(&self, result: ActionResult) {
        self.actions[result.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn action_count(&self, result: ActionResult) -> u64 {
        self.actions[result.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            observations:         self.observations.load(Ordering::Relaxed),
            observations_dropped: self.observations_dropped.load(Ordering::Relaxed),
            scorer_failures:      self.scorer_failures.load(Ordering::Relaxed),
            sampler_failures:     self.sampler_failures.load(Ordering::Relaxed),
            health_alerts:        self.health_alerts.load(Ordering::Relaxed),
            threats:              self.threats.load(Ordering::Relaxed),
            threats_below_floor:  self.threats_below_floor.load(Ordering::Relaxed),
            actions: ActionResult::ALL
                .iter()
                .map(|r| (r.to_string(), self.action_count(*r)))
                .collect(),
            notifications_sent:   self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            policy_backlog:       self.policy_backlog.load(Ordering::Relaxed),
            dispatch_backlog:     self.dispatch_backlog.load(Ordering::Relaxed),
            degraded_loops:       self.degraded_loops.load(Ordering::Relaxed),
        }
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        macro_rules! counter {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }
        macro_rules! gauge {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }

        counter!("warden_observations_total", "Observations pushed to intake", s.observations);
        counter!("warden_observations_dropped_total", "Observations dropped by intake overload", s.observations_dropped);
        counter!("warden_scorer_failures_total", "Scorer invocations that failed or timed out", s.scorer_failures);
        counter!("warden_sampler_failures_total", "Sampler invocations that failed", s.sampler_failures);
        counter!("warden_health_alerts_total", "Detection loops entering degraded state", s.health_alerts);
        counter!("warden_threats_total", "Threats emitted by fusion", s.threats);

        out.push_str("# HELP warden_actions_total Policy outcomes by result\n");
        out.push_str("# TYPE warden_actions_total counter\n");
        for (result, count) in &s.actions {
            out.push_str(&format!("warden_actions_total{{result=\"{}\"}} {}\n", result, count));
        }

        out.push_str("# HELP warden_notifications_total Channel deliveries by outcome\n");
        out.push_str("# TYPE warden_notifications_total counter\n");
        out.push_str(&format!("warden_notifications_total{{outcome=\"delivered\"}} {}\n", s.notifications_sent));
        out.push_str(&format!("warden_notifications_total{{outcome=\"failed\"}} {}\n", s.notifications_failed));

        out.push_str("# HELP warden_backlog Pending messages between pipeline stages\n");
        out.push_str("# TYPE warden_backlog gauge\n");
        out.push_str(&format!("warden_backlog{{stage=\"policy\"}} {}\n", s.policy_backlog));
        out.push_str(&format!("warden_backlog{{stage=\"dispatch\"}} {}\n", s.dispatch_backlog));

        gauge!("warden_degraded_loops", "Detection loops currently degraded", s.degraded_loops);
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub observations:         u64,
    pub observations_dropped: u64,
    pub scorer_failures:      u64,
    pub sampler_failures:     u64,
    pub health_alerts:        u64,
    pub threats:              u64,
    pub threats_below_floor:  u64,
    pub actions:              Vec<(String, u64)>,
    pub notifications_sent:   u64,
    pub notifications_failed: u64,
    pub policy_backlog:       usize,
    pub dispatch_backlog:     usize,
    pub degraded_loops:       usize,
}

// ── Health sink ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub uptime_secs:          u64,
    pub observations_per_sec: f64,
    pub threats_per_sec:      f64,
    /// True when a stage backlog exceeds the warning depth or grew since the
    /// previous report while above half of it.
    pub backlog_warning:      bool,
    pub snapshot:             MetricsSnapshot,
}

/// Receives periodic counters. Implementations must not block.
pub trait HealthSink: Send + Sync {
    fn report(&self, report: &HealthReport);
}

/// Default sink: one structured log line per report.
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn report(&self, r: &HealthReport) {
        let s = &r.snapshot;
        if r.backlog_warning || s.degraded_loops > 0 {
            warn!(
                uptime = r.uptime_secs, policy_backlog = s.policy_backlog,
                dispatch_backlog = s.dispatch_backlog, degraded = s.degraded_loops,
                "pipeline health degraded"
            );
        }
        info!(
            uptime = r.uptime_secs,
            obs_per_sec = format!("{:.2}", r.observations_per_sec),
            threats_per_sec = format!("{:.3}", r.threats_per_sec),
            threats = s.threats, dropped = s.observations_dropped,
            "stats"
        );
    }
}

pub async fn health_loop(
    metrics:         Arc<PipelineMetrics>,
    sink:            Arc<dyn HealthSink>,
    interval:        Duration,
    backlog_warning: usize,
    mut shutdown:    watch::Receiver<bool>,
) {
    let start = Instant::now();
    let mut last = metrics.snapshot();
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        let now = metrics.snapshot();
        let elapsed = last_at.elapsed().as_secs_f64().max(1e-3);
        let report = build_report(&last, now.clone(), elapsed, start.elapsed().as_secs(), backlog_warning);
        sink.report(&report);
        last = now;
        last_at = Instant::now();
    }
}

fn build_report(
    prev:            &MetricsSnapshot,
    now:             MetricsSnapshot,
    elapsed_secs:    f64,
    uptime_secs:     u64,
    backlog_warning: usize,
) -> HealthReport {
    let depth = now.policy_backlog.max(now.dispatch_backlog);
    let prev_depth = prev.policy_backlog.max(prev.dispatch_backlog);
    let growing = depth > prev_depth && depth * 2 > backlog_warning;
    HealthReport {
        uptime_secs,
        observations_per_sec: now.observations.saturating_sub(prev.observations) as f64 / elapsed_secs,
        threats_per_sec:      now.threats.saturating_sub(prev.threats) as f64 / elapsed_secs,
        backlog_warning:      depth > backlog_warning || growing,
        snapshot:             now,
    }
}

// ── HTTP /metrics endpoint ───────────────────────────────────────────────────

pub struct MetricsServer {
    metrics: Arc<PipelineMetrics>,
    addr:    SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<PipelineMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("/metrics endpoint listening on {}", self.addr);

        loop {
            let (mut stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => return Ok(()),
            };
            let body = self.metrics.prometheus_text();
            tokio::spawn(async move {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(), body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_text_lists_action_results() {
        let m = PipelineMetrics::new();
        m.record_action(ActionResult::Applied);
        m.record_action(ActionResult::SkippedCooldown);
        m.record_action(ActionResult::SkippedCooldown);
        let text = m.prometheus_text();
        assert!(text.contains("warden_actions_total{result=\"applied\"} 1"));
        assert!(text.contains("warden_actions_total{result=\"skipped-cooldown\"} 2"));
        assert!(text.contains("# TYPE warden_degraded_loops gauge"));
    }

    #[test]
    fn report_flags_growing_backlog() {
        let prev = MetricsSnapshot { policy_backlog: 400, ..Default::default() };
        let now = MetricsSnapshot { policy_backlog: 700, threats: 10, ..Default::default() };
        let r = build_report(&prev, now, 2.0, 60, 1_000);
        assert!(r.backlog_warning);
        assert_eq!(r.threats_per_sec, 5.0);

        let calm = MetricsSnapshot { policy_backlog: 3, ..Default::default() };
        let r = build_report(&MetricsSnapshot::default(), calm, 1.0, 1, 1_000);
        assert!(!r.backlog_warning);
    }
}
