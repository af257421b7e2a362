//! Redirect/rewrite/proxy rule engine.
//!
//! Rules are evaluated in order against the request URL; the first match
//! wins. `*` wildcards capture into numbered back-references (`$1, $2, …`)
//! that are substituted textually into `to`. A trailing `*` captures the
//! whole remainder; any other `*` captures a single path segment.

use regex::Regex;
use stormkit_core::{AppConfig, RedirectRule};

/// What a matched rule tells the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RedirectAction {
    /// Replace the request path and continue the pipeline.
    Rewrite { path: String },
    /// Short-circuit with an HTTP redirect.
    Redirect { location: String, status: u16 },
    /// Proxy to an absolute target. `fixed_status` pins the response status
    /// to 200 regardless of the upstream.
    Proxy { target: String, fixed_status: bool },
    /// A rule matched but carries no target: respond 404.
    NotFound,
}

/// Evaluate the deployment's rules for a request.
///
/// `path` is the URL path, `query` the raw query string without `?`.
pub fn evaluate(
    config: &AppConfig,
    scheme: &str,
    host: &str,
    path: &str,
    query: &str,
) -> Option<RedirectAction> {
    for rule in &config.redirects {
        if let Some(action) = evaluate_rule(config, rule, scheme, host, path, query) {
            return Some(action);
        }
    }
    None
}

fn evaluate_rule(
    config: &AppConfig,
    rule: &RedirectRule,
    scheme: &str,
    host: &str,
    path: &str,
    query: &str,
) -> Option<RedirectAction> {
    if rule.from.is_empty() {
        return None;
    }

    let domain_level = !rule.from.starts_with('/');
    let subject = if domain_level {
        format!("{host}{path}")
    } else {
        path.to_string()
    };

    // An invalid pattern skips the rule silently.
    let pattern = compile_pattern(&rule.from).ok()?;
    let captures = pattern.captures(&subject)?;

    if rule.to.is_empty() {
        return Some(RedirectAction::NotFound);
    }

    let target = substitute(&rule.to, &captures);
    let absolute = target.starts_with("http://") || target.starts_with("https://");

    // 3xx always redirects; a matched domain-level rule redirects too.
    if (300..400).contains(&rule.status) || (domain_level && !absolute && rule.status == 0) {
        let status = if (300..400).contains(&rule.status) {
            rule.status
        } else {
            301
        };
        let location = if absolute {
            with_query(&target, query)
        } else {
            with_query(&format!("{scheme}://{host}{target}"), query)
        };
        return Some(RedirectAction::Redirect { location, status });
    }

    if absolute {
        let fixed_status = rule.status == 200;
        if rule.status == 0 || fixed_status {
            return Some(RedirectAction::Proxy {
                target: with_query(&target, query),
                fixed_status,
            });
        }
        // Any other status with an absolute target behaves as a redirect.
        return Some(RedirectAction::Redirect {
            location: with_query(&target, query),
            status: rule.status,
        });
    }

    // Same-host rewrite. With assets=true the target must exist in the
    // static manifest, otherwise the rule does not apply.
    if rule.assets && config.resolve_static(&target).is_none() {
        return None;
    }

    Some(RedirectAction::Rewrite { path: target })
}

/// Compile a `from` pattern to an anchored regex. `*` at the end matches
/// the remainder; elsewhere it matches one path segment.
fn compile_pattern(from: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(from.len() + 8);
    pattern.push('^');

    let chars: Vec<char> = from.chars().collect();
    for (index, ch) in chars.iter().enumerate() {
        match ch {
            '*' => {
                if index == chars.len() - 1 {
                    pattern.push_str("(.*)");
                } else {
                    pattern.push_str("([^/]*)");
                }
            }
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }

    pattern.push('$');
    Regex::new(&pattern)
}

/// Substitute `$1…$n` back-references. Longer indices are replaced first so
/// `$12` is not clobbered by `$1`.
fn substitute(to: &str, captures: &regex::Captures<'_>) -> String {
    let mut result = to.to_string();
    for index in (1..captures.len()).rev() {
        let value = captures.get(index).map(|m| m.as_str()).unwrap_or_default();
        result = result.replace(&format!("${index}"), value);
    }
    result
}

/// Append the original query string unless the target already carries one.
fn with_query(target: &str, query: &str) -> String {
    if query.is_empty() || target.contains('?') {
        target.to_string()
    } else {
        format!("{target}?{query}")
    }
}
