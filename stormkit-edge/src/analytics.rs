//! Analytics sampling and batched artifact shipment.
//!
//! Qualifying HTML responses produce an [`AnalyticsRecord`]; every tenant
//! response produces a [`HostingRecord`] envelope (bandwidth, logs, the
//! optional analytics record). Envelopes go through a bounded in-memory
//! queue and a timer-triggered flusher that serializes them onto a
//! shared-KV list. Neither path ever delays or fails a response.

use crate::bots::is_bot;
use crate::hosts::Host;
use std::sync::Arc;
use std::time::Duration;
use stormkit_core::{AnalyticsRecord, HostingRecord};
use stormkit_storage::Kv;
use time::OffsetDateTime;
use tokio::sync::mpsc;

/// Default KV list drained by the worker tier.
pub const DEFAULT_QUEUE_NAME: &str = "hosting-records";

const QUEUE_CAPACITY: usize = 1024;
const FLUSH_BATCH: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Build the analytics record for a response, or `None` when the request
/// does not qualify: unknown domain outside dev mode, XHR requests,
/// bot or non-UTF-8 user agents.
pub fn build_record(
    host: &Host,
    status_code: u16,
    request_path: &str,
    visitor_ip: &str,
    referrer: Option<&str>,
    user_agent: Option<&str>,
    requested_with: Option<&str>,
    dev_mode: bool,
) -> Option<AnalyticsRecord> {
    let config = &host.config;

    if config.domain_id == 0 && !dev_mode {
        return None;
    }

    if requested_with.is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest")) {
        return None;
    }

    // A missing user agent means the header was absent or not valid UTF-8.
    let user_agent = user_agent?;
    if is_bot(user_agent) {
        return None;
    }

    let referrer = referrer.map(normalize_referrer).filter(|r| !r.is_empty());

    Some(AnalyticsRecord {
        app_id: config.app_id,
        env_id: config.env_id,
        domain_id: config.domain_id,
        visitor_ip: visitor_ip.to_string(),
        request_ts: OffsetDateTime::now_utc().unix_timestamp(),
        request_path: request_path.to_string(),
        status_code,
        referrer,
        user_agent: Some(user_agent.to_string()),
    })
}

/// Reduce a referrer URL to its origin: `https://news.example.org/a/b` →
/// `https://news.example.org`.
pub fn normalize_referrer(referrer: &str) -> String {
    let trimmed = referrer.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return trimmed.split('/').next().unwrap_or_default().to_string();
    };

    let origin = rest.split('/').next().unwrap_or_default();
    if origin.is_empty() {
        return String::new();
    }
    format!("{scheme}://{origin}")
}

/// Bounded queue in front of the KV list. Enqueueing never blocks; when
/// the queue is full the record is dropped with a log line.
pub struct Batcher {
    tx: mpsc::Sender<HostingRecord>,
}

impl Batcher {
    pub fn start(kv: Kv, queue_name: String) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(flusher(kv, queue_name, rx));
        Arc::new(Self { tx })
    }

    /// Fire-and-forget enqueue.
    pub fn enqueue(&self, record: HostingRecord) {
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!("hosting record dropped: {e}");
        }
    }
}

async fn flusher(kv: Kv, queue_name: String, mut rx: mpsc::Receiver<HostingRecord>) {
    let mut pending: Vec<HostingRecord> = Vec::with_capacity(FLUSH_BATCH);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= FLUSH_BATCH {
                            flush(&kv, &queue_name, &mut pending).await;
                        }
                    }
                    None => {
                        flush(&kv, &queue_name, &mut pending).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&kv, &queue_name, &mut pending).await;
            }
        }
    }
}

async fn flush(kv: &Kv, queue_name: &str, pending: &mut Vec<HostingRecord>) {
    for record in pending.drain(..) {
        let payload = match serde_json::to_string(&record) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("cannot serialize hosting record: {e}");
                continue;
            }
        };

        // KV failures degrade to dropped records, never to request errors.
        if let Err(e) = kv.lpush(queue_name, &payload).await {
            tracing::warn!("cannot enqueue hosting record: {e}");
        }
    }
}
