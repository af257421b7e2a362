//! Queue envelopes shipped from the edge to the worker tier.
//!
//! Records are immutable once enqueued; the batcher serializes them onto a
//! shared-KV list and a background worker drains the list elsewhere.

use crate::config::DeploymentId;
use serde::{Deserialize, Serialize};

/// A single page-view record, produced at most once per qualifying request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    pub app_id: u64,
    pub env_id: u64,
    pub domain_id: u64,
    pub visitor_ip: String,
    /// Unix seconds at request time.
    pub request_ts: i64,
    pub request_path: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// One captured log line from a function invocation or a managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Unix seconds.
    pub timestamp: i64,
    pub message: String,
}

/// Batching envelope for everything a request produced: logs, the optional
/// analytics record and bandwidth accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostingRecord {
    pub app_id: u64,
    pub env_id: u64,
    pub deployment_id: DeploymentId,
    pub host_name: String,
    #[serde(default)]
    pub billing_user_id: u64,
    #[serde(default)]
    pub function_invoked: bool,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<AnalyticsRecord>,
    /// Body bytes plus approximate header bytes.
    #[serde(default)]
    pub total_bandwidth: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosting_record_serializes_without_empty_analytics() {
        let record = HostingRecord {
            app_id: 1,
            env_id: 2,
            deployment_id: DeploymentId(3),
            host_name: "www.example.org".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("analytics"));
        assert!(json.contains("\"deploymentId\":3"));
    }

    #[test]
    fn test_analytics_record_round_trip() {
        let record = AnalyticsRecord {
            app_id: 1,
            env_id: 2,
            domain_id: 9,
            visitor_ip: "203.0.113.7".to_string(),
            request_ts: 1_700_000_000,
            request_path: "/pricing".to_string(),
            status_code: 200,
            referrer: Some("https://news.ycombinator.com".to_string()),
            user_agent: None,
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: AnalyticsRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
