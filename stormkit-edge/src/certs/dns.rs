//! DNS provider client for DNS-01 challenges.
//!
//! The platform DNS service answers `AppendRecords`/`DeleteRecords` with
//! UPSERT/DELETE change batches. TXT values are quoted and records carry a
//! 60 second TTL. Only used for the managed wildcard domain.

use serde::Serialize;
use thiserror::Error;

const RECORD_TTL_SECS: u32 = 60;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("dns provider returned status {0}")]
    UpstreamStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn txt(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            record_type: "TXT".to_string(),
            value: value.to_string(),
            ttl: RECORD_TTL_SECS,
        }
    }
}

#[derive(Serialize)]
struct Change<'a> {
    action: &'static str,
    zone: &'a str,
    record: DnsRecord,
}

#[derive(Serialize)]
struct ChangeBatch<'a> {
    #[serde(rename = "zoneId")]
    zone_id: &'a str,
    changes: Vec<Change<'a>>,
}

/// Client for the platform DNS API.
#[derive(Clone)]
pub struct DnsProvider {
    base: String,
    zone_id: String,
    client: reqwest::Client,
}

impl DnsProvider {
    pub fn new(base: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            zone_id: zone_id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn append_records(
        &self,
        zone: &str,
        records: Vec<DnsRecord>,
    ) -> Result<(), DnsError> {
        self.change("UPSERT", zone, records).await
    }

    pub async fn delete_records(
        &self,
        zone: &str,
        records: Vec<DnsRecord>,
    ) -> Result<(), DnsError> {
        self.change("DELETE", zone, records).await
    }

    async fn change(
        &self,
        action: &'static str,
        zone: &str,
        records: Vec<DnsRecord>,
    ) -> Result<(), DnsError> {
        let changes = records
            .into_iter()
            .map(|mut record| {
                if record.record_type == "TXT" {
                    record.value = quote(&record.value);
                }
                record.name = absolute_name(&record.name, zone);
                Change {
                    action,
                    zone,
                    record,
                }
            })
            .collect();

        let batch = ChangeBatch {
            zone_id: &self.zone_id,
            changes,
        };

        tracing::debug!(zone, action, "sending dns change batch");

        let response = self
            .client
            .post(format!("{}/records", self.base))
            .json(&batch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DnsError::UpstreamStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\\\""))
}

/// `name` relative to `zone` becomes fully qualified.
fn absolute_name(name: &str, zone: &str) -> String {
    let zone = zone.trim_end_matches('.');
    if name.ends_with(zone) || name.ends_with(&format!("{zone}.")) {
        name.trim_end_matches('.').to_string()
    } else {
        format!("{}.{zone}", name.trim_end_matches('.'))
    }
}
