//! Headers file ingestion.
//!
//! Netlify-style `_headers` syntax: an unindented line opens a path rule
//! (trailing `*` makes it a prefix match), indented `Name: value` lines
//! attach headers to it. The resulting rules are applied to manifest
//! entries at build time.

use std::collections::HashMap;
use std::path::Path;
use stormkit_core::HeaderRule;

/// Parse the configured headers file. A missing file yields no rules.
pub fn parse_headers_file(path: &Path) -> std::io::Result<Vec<HeaderRule>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let raw = std::fs::read_to_string(path)?;
    Ok(parse_headers(&raw))
}

pub fn parse_headers(document: &str) -> Vec<HeaderRule> {
    let mut rules: Vec<HeaderRule> = Vec::new();

    for line in document.lines() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if !indented {
            rules.push(HeaderRule {
                path: line.trim().to_string(),
                headers: HashMap::new(),
            });
            continue;
        }

        let Some(rule) = rules.last_mut() else {
            continue;
        };
        if let Some((name, value)) = line.trim().split_once(':') {
            rule.headers
                .insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    rules.retain(|rule| !rule.headers.is_empty());
    rules
}
