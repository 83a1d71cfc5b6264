// warden/src/notify/webhook.rs
//
// HTTP channels.
//
//   ChatWebhookChannel  Slack-compatible incoming webhook (header + code block)
//   WebhookChannel      generic JSON POST, optional HMAC-SHA256 signature
//
// Signature header: X-Warden-Signature: sha256=<hex(HMAC-SHA256(body, secret))>

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use sysinfo::System;

use super::{DeliveryError, NotificationChannel};
use crate::events::{Notification, Urgency};

type HmacSha256 = Hmac<sha2::Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Warden-Signature";

fn client(timeout: Duration) -> Result<reqwest::Client, DeliveryError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DeliveryError::Config(e.to_string()))
}

async fn post(req: reqwest::RequestBuilder) -> Result<(), DeliveryError> {
    let resp = req.send().await.map_err(|e| DeliveryError::Http(e.to_string()))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(DeliveryError::Status(resp.status().as_u16()))
    }
}

// ── Chat ─────────────────────────────────────────────────────────────────────

pub struct ChatWebhookChannel {
    url:         String,
    client:      reqwest::Client,
    min_urgency: Urgency,
}

impl ChatWebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self { url: url.into(), client: client(timeout)?, min_urgency: Urgency::Low })
    }

    pub fn with_min_urgency(mut self, u: Urgency) -> Self { self.min_urgency = u; self }
}

pub fn chat_payload(n: &Notification) -> Value {
    json!({
        "text": n.title,
        "blocks": [
            { "type": "header",  "text": { "type": "plain_text", "text": n.title } },
            { "type": "section", "text": { "type": "mrkdwn", "text": format!("```{}```", n.body) } },
        ],
    })
}

#[async_trait]
impl NotificationChannel for ChatWebhookChannel {
    fn name(&self) -> &str { "chat" }

    fn min_urgency(&self) -> Urgency { self.min_urgency }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        post(self.client.post(&self.url).json(&chat_payload(n))).await
    }
}

// ── Generic webhook ──────────────────────────────────────────────────────────

pub struct WebhookChannel {
    url:         String,
    headers:     BTreeMap<String, String>,
    secret:      Option<String>,
    hostname:    Option<String>,
    client:      reqwest::Client,
    min_urgency: Urgency,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        Ok(Self {
            url:         url.into(),
            headers:     BTreeMap::new(),
            secret:      None,
            hostname:    None,
            client:      client(timeout)?,
            min_urgency: Urgency::Low,
        })
    }

    pub fn with_headers(mut self, h: BTreeMap<String, String>) -> Self { self.headers = h; self }

    pub fn with_secret(mut self, s: Option<String>) -> Self { self.secret = s; self }

    pub fn with_min_urgency(mut self, u: Urgency) -> Self { self.min_urgency = u; self }

    pub fn with_hostname(mut self, include: bool) -> Self {
        self.hostname = if include { System::host_name() } else { None };
        self
    }
}

pub fn webhook_payload(n: &Notification, hostname: Option<&str>) -> Value {
    let mut payload = json!({
        "event_type":   "security_alert",
        "timestamp":    Utc::now().to_rfc3339(),
        "notification": n,
    });
    if let Some(host) = hostname {
        payload["hostname"] = Value::from(host);
    }
    payload
}

/// `sha256=<hex>` over the exact request body.
pub fn sign(body: &[u8], secret: &str) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Config(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str { "webhook" }

    fn min_urgency(&self) -> Urgency { self.min_urgency }

    async fn send(&self, n: &Notification) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(&webhook_payload(n, self.hostname.as_deref()))
            .map_err(|e| DeliveryError::Config(e.to_string()))?;

        let mut req = self.client.post(&self.url).header(CONTENT_TYPE, "application/json");
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(ref secret) = self.secret {
            req = req.header(SIGNATURE_HEADER, sign(&body, secret)?);
        }
        post(req.body(body)).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::events::ThreatId;

    fn notification() -> Notification {
        Notification {
            threat_id:   Some(ThreatId(7)),
            title:       "[HIGH] network-anomaly on 10.0.0.5 (severity 4/5)".into(),
            body:        "Threat:   T000007\n".into(),
            urgency:     Urgency::High,
            severity:    4,
            subject_key: "10.0.0.5".into(),
            category:    "network-anomaly".into(),
            result:      None,
            created_at:  Utc::now(),
        }
    }

    /// Accept one HTTP request, answer with `status`, return the raw request.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            if k.eq_ignore_ascii_case("content-length") { v.trim().parse::<usize>().ok() } else { None }
                        })
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let reply = format!("HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
            sock.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[test]
    fn signature_matches_known_vector() {
        // RFC 4231 test case 2.
        let sig = sign(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(sig, "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn payload_shapes() {
        let p = webhook_payload(&notification(), Some("sensor-01"));
        assert_eq!(p["event_type"], "security_alert");
        assert_eq!(p["hostname"], "sensor-01");
        assert_eq!(p["notification"]["threat_id"], 7);
        assert!(webhook_payload(&notification(), None).get("hostname").is_none());

        let c = chat_payload(&notification());
        assert_eq!(c["blocks"][0]["type"], "header");
    }

    #[tokio::test]
    async fn posts_signed_json() {
        let (url, server) = one_shot_server(200).await;
        let mut headers = BTreeMap::new();
        headers.insert("X-Team".to_string(), "secops".to_string());
        let ch = WebhookChannel::new(url, Duration::from_secs(5))
            .unwrap()
            .with_headers(headers)
            .with_secret(Some("s3cret".into()));

        ch.send(&notification()).await.unwrap();
        let raw = server.await.unwrap();

        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let lower = head.to_ascii_lowercase();
        assert!(lower.starts_with("post /hook"));
        assert!(lower.contains("x-team: secops"));
        let expected = sign(body.as_bytes(), "s3cret").unwrap();
        assert!(lower.contains(&format!("x-warden-signature: {}", expected)));
        let json: Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["notification"]["subject_key"], "10.0.0.5");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (url, server) = one_shot_server(500).await;
        let ch = ChatWebhookChannel::new(url, Duration::from_secs(5)).unwrap();
        assert!(matches!(ch.send(&notification()).await, Err(DeliveryError::Status(500))));
        server.await.unwrap();
    }
}
