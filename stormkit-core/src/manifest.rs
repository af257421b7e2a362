//! Artifact manifest entries produced by the runner and consumed by the
//! edge to decide routing and conditional responses.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A client file uploaded to the CDN bucket, with its per-file headers
/// (always at least the content `etag`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdnFile {
    pub name: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// An API handler file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFile {
    pub file_name: String,
}

/// A headers-file rule: headers applied to every manifest path matched by
/// `path`. A trailing `*` makes the rule a prefix match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Merge matching header rules into `base` for the given file name.
/// Rule headers win over base headers; later rules win over earlier ones.
pub fn apply_header_rules(
    file_name: &str,
    base: HashMap<String, String>,
    rules: &[HeaderRule],
) -> HashMap<String, String> {
    let mut merged = base;

    for rule in rules {
        let matches = if let Some(prefix) = rule.path.strip_suffix('*') {
            file_name.starts_with(prefix)
        } else {
            rule.path == file_name
        };

        if matches {
            for (k, v) in &rule.headers {
                merged.insert(k.clone(), v.clone());
            }
        }
    }

    merged
}
