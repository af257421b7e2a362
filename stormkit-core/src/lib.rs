//! Shared domain types for the Stormkit hosting edge and deployment runner.
//!
//! The edge resolves an incoming `Host` header to an [`AppConfig`] snapshot
//! and serves the deployment it describes; the runner produces the artifact
//! manifests that end up inside that snapshot. Everything both sides need to
//! agree on lives here.

mod config;
mod httpdate;
mod manifest;
mod records;

pub use config::{
    AppConfig, AuthWall, DeploymentId, RedirectRule, Snippet, SnippetAnchor, StaticFileMeta,
};
pub use httpdate::{format_http_date, parse_http_date};
pub use manifest::{ApiFile, CdnFile, HeaderRule, apply_header_rules};
pub use records::{AnalyticsRecord, HostingRecord, LogLine};
