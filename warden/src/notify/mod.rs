// warden/src/notify/mod.rs
//
// Notification fan-out. One worker task per channel, each with its own queue,
// so a slow or failing channel never holds up the others.
//
//   policy ──mpsc──► fan-out ──┬─► worker(log)
//                              ├─► worker(email)
//                              └─► worker(webhook) ...
//
// Every attempt is bounded by a timeout and retried with exponential backoff
// up to max_attempts. A notification that exhausts its attempts is logged and
// counted, never escalated. On close the workers drain their queues.

pub mod email;
pub mod webhook;

pub use email::{EmailChannel, SmtpSettings};
pub use webhook::{ChatWebhookChannel, WebhookChannel};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, NotificationConfig};
use crate::events::{Notification, Urgency};
use crate::metrics::PipelineMetrics;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("http: {0}")]
    Http(String),
    #[error("endpoint answered {0}")]
    Status(u16),
    #[error("smtp: {0}")]
    Smtp(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel misconfigured: {0}")]
    Config(String),
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Notifications below this urgency are not sent to the channel.
    fn min_urgency(&self) -> Urgency {
        Urgency::Low
    }

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff:      Duration,
    pub timeout:      Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff:      Duration::from_millis(config.backoff_ms),
            timeout:      Duration::from_millis(config.timeout_ms),
        }
    }

    /// Delay after the given failed attempt (1-based): backoff × 2^(n-1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }
}

// ── Log channel ──────────────────────────────────────────────────────────────

pub struct LogChannel {
    min_urgency: Urgency,
}

impl LogChannel {
    pub fn new(min_urgency: Urgency) -> Self {
        Self { min_urgency }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str { "log" }

    fn min_urgency(&self) -> Urgency { self.min_urgency }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let threat_id = n.threat_id.map(|id| id.to_string()).unwrap_or_default();
        if n.urgency >= Urgency::High {
            warn!(threat_id = %threat_id, subject = %n.subject_key, urgency = %n.urgency, "ALERT {}", n.title);
        } else {
            info!(threat_id = %threat_id, subject = %n.subject_key, urgency = %n.urgency, "ALERT {}", n.title);
        }
        Ok(())
    }
}

/// Instantiate the configured channels.
pub fn build_channels(config: &NotificationConfig) -> Result<Vec<Arc<dyn NotificationChannel>>, DeliveryError> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut out: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    for ch in &config.channels {
        let channel: Arc<dyn NotificationChannel> = match ch {
            ChannelConfig::Log { min_urgency } => Arc::new(LogChannel::new(*min_urgency)),
            ChannelConfig::Email {
                smtp_host, smtp_port, starttls, username, password, sender, recipients, min_urgency,
            } => {
                let credentials = match (username, password) {
                    (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                    (None, None) => None,
                    _ => return Err(DeliveryError::Config("smtp username and password go together".into())),
                };
                let settings = SmtpSettings {
                    host: smtp_host.clone(),
                    port: *smtp_port,
                    starttls: *starttls,
                    credentials,
                    timeout,
                };
                Arc::new(EmailChannel::new(settings, sender, recipients)?.with_min_urgency(*min_urgency))
            }
            ChannelConfig::Chat { webhook_url, min_urgency } => Arc::new(
                ChatWebhookChannel::new(webhook_url.clone(), timeout)?.with_min_urgency(*min_urgency),
            ),
            ChannelConfig::Webhook { url, headers, secret, include_hostname, min_urgency } => Arc::new(
                WebhookChannel::new(url.clone(), timeout)?
                    .with_headers(headers.clone())
                    .with_secret(secret.clone())
                    .with_hostname(*include_hostname)
                    .with_min_urgency(*min_urgency),
            ),
        };
        out.push(channel);
    }
    Ok(out)
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

struct Worker {
    name:        String,
    min_urgency: Urgency,
    tx:          mpsc::UnboundedSender<Arc<Notification>>,
    handle:      JoinHandle<()>,
}

pub struct Dispatcher {
    workers: Vec<Worker>,
    metrics: Arc<PipelineMetrics>,
}

impl Dispatcher {
    /// Spawn one worker per channel.
    pub fn spawn(channels: Vec<Arc<dyn NotificationChannel>>, retry: RetryPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        let workers = channels
            .into_iter()
            .map(|channel| {
                let (tx, rx) = mpsc::unbounded_channel();
                let name = channel.name().to_string();
                let min_urgency = channel.min_urgency();
                let handle = tokio::spawn(worker(channel, rx, retry, metrics.clone()));
                Worker { name, min_urgency, tx, handle }
            })
            .collect();
        Self { workers, metrics }
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Queue one notification on every channel whose urgency floor it meets.
    pub fn dispatch(&self, notification: Notification) {
        let n = Arc::new(notification);
        for w in &self.workers {
            if n.urgency < w.min_urgency {
                debug!(channel = %w.name, urgency = %n.urgency, "below channel urgency floor");
                continue;
            }
            if w.tx.send(n.clone()).is_err() {
                warn!(channel = %w.name, "channel worker gone");
            }
        }
    }

    /// Fan-out task. Runs until every sender of `rx` is dropped, then drains
    /// the channel workers.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Notification>) {
        info!(channels = ?self.channel_names(), "dispatcher started");
        while let Some(n) = rx.recv().await {
            self.metrics.dispatch_backlog.fetch_sub(1, Ordering::Relaxed);
            self.dispatch(n);
        }
        self.close().await;
    }

    /// Stop accepting notifications and wait for queued ones to be delivered.
    pub async fn close(self) {
        let handles: Vec<JoinHandle<()>> = self.workers.into_iter().map(|w| w.handle).collect();
        for h in handles {
            let _ = h.await;
        }
        info!("dispatcher drained");
    }
}

async fn worker(
    channel: Arc<dyn NotificationChannel>,
    mut rx:  mpsc::UnboundedReceiver<Arc<Notification>>,
    retry:   RetryPolicy,
    metrics: Arc<PipelineMetrics>,
) {
    while let Some(n) = rx.recv().await {
        if deliver(channel.as_ref(), &n, retry).await {
            metrics.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Attempt delivery with timeout and backoff. Returns whether it succeeded.
pub async fn deliver(channel: &dyn NotificationChannel, n: &Notification, retry: RetryPolicy) -> bool {
    let threat_id = n.threat_id.map(|id| id.to_string()).unwrap_or_default();
    for attempt in 1..=retry.max_attempts {
        let outcome = match tokio::time::timeout(retry.timeout, channel.send(n)).await {
            Ok(res) => res,
            Err(_) => Err(DeliveryError::Timeout(retry.timeout)),
        };
        match outcome {
            Ok(()) => {
                debug!(channel = channel.name(), threat_id = %threat_id, attempt, "notification delivered");
                return true;
            }
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(channel = channel.name(), threat_id = %threat_id, attempt, error = %e, retry_in = ?delay, "delivery failed");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(channel = channel.name(), threat_id = %threat_id, attempts = attempt, error = %e, "notification dropped");
            }
        }
    }
    false
}
