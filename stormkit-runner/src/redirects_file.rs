//! Redirects ingestion.
//!
//! `redirects.json` takes precedence; a Netlify-style `_redirects` file is
//! accepted as a fallback. Both the working directory and the repository
//! root are checked, working directory first.

use std::path::Path;
use stormkit_core::RedirectRule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RedirectsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid redirects.json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Find and parse the deployment's redirect rules. Returns an empty list
/// when no file exists.
pub fn parse_redirects(
    work_dir: &Path,
    repo_dir: &Path,
    redirects_file: &str,
) -> Result<Vec<RedirectRule>, RedirectsError> {
    let candidates: Vec<std::path::PathBuf> = if !redirects_file.is_empty() {
        vec![work_dir.join(redirects_file)]
    } else {
        vec![
            work_dir.join("redirects.json"),
            repo_dir.join("redirects.json"),
            work_dir.join("_redirects"),
            repo_dir.join("_redirects"),
        ]
    };

    for path in candidates {
        if !path.is_file() {
            continue;
        }

        let raw = std::fs::read_to_string(&path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            return Ok(serde_json::from_str(&raw)?);
        }
        return Ok(parse_netlify_redirects(&raw));
    }

    Ok(Vec::new())
}

/// Netlify `_redirects` syntax: one `FROM TO [STATUS]` per line.
///
/// `:splat` becomes `$1`; a wildcard source redirecting hard to a `.html`
/// target is demoted to a soft rewrite; non-3xx statuses are dropped and a
/// missing status defaults to 301.
pub fn parse_netlify_redirects(document: &str) -> Vec<RedirectRule> {
    let mut rules = Vec::new();

    for line in document.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 || fields[0].starts_with('#') {
            continue;
        }

        let mut rule = RedirectRule {
            from: fields[0].to_string(),
            to: fields[1].replacen(":splat", "$1", 1),
            status: 0,
            assets: false,
        };

        if let Some(raw_status) = fields.get(2) {
            rule.status = raw_status.replace('!', "").parse().unwrap_or(0);
        }

        if rule.from.contains('*') && rule.to.ends_with(".html") {
            // SPA-style fallbacks must rewrite, not redirect.
            rule.assets = false;
            rule.status = 0;
        } else if rule.status > 0 && !(300..400).contains(&rule.status) {
            rule.status = 0;
        } else if rule.status == 0 {
            rule.status = 301;
        }

        rules.push(rule);
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_netlify_basic_redirect_defaults_to_301() {
        let rules = parse_netlify_redirects("/old /new\n");
        assert_eq!(
            rules,
            vec![RedirectRule {
                from: "/old".to_string(),
                to: "/new".to_string(),
                status: 301,
                assets: false,
            }]
        );
    }

    #[test]
    fn test_netlify_splat_becomes_back_reference() {
        let rules = parse_netlify_redirects("/news/* /blog/:splat 302\n");
        assert_eq!(rules[0].to, "/blog/$1");
        assert_eq!(rules[0].status, 302);
    }

    #[test]
    fn test_netlify_spa_fallback_is_demoted_to_rewrite() {
        let rules = parse_netlify_redirects("/* /index.html 200\n");
        assert_eq!(rules[0].status, 0);
        assert!(!rules[0].assets);
    }

    #[test]
    fn test_netlify_non_3xx_status_dropped() {
        let rules = parse_netlify_redirects("/old /new 200\n");
        assert_eq!(rules[0].status, 0);
    }

    #[test]
    fn test_netlify_forced_flag_is_stripped() {
        let rules = parse_netlify_redirects("/old /new 301!\n");
        assert_eq!(rules[0].status, 301);
    }

    #[test]
    fn test_netlify_invalid_lines_skipped() {
        let rules = parse_netlify_redirects("just-one-field\n\n# comment /a /b\n/x /y\n");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].from, "/x");
    }

    #[test]
    fn test_json_takes_precedence_over_netlify() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("redirects.json"),
            r#"[{"from": "/a", "to": "/b", "status": 302}]"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("_redirects"), "/c /d\n").unwrap();

        let rules = parse_redirects(temp.path(), temp.path(), "").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].from, "/a");
        assert_eq!(rules[0].status, 302);
    }

    #[test]
    fn test_work_dir_wins_over_repo_root() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("packages/site");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join("_redirects"), "/work /w\n").unwrap();
        std::fs::write(temp.path().join("_redirects"), "/repo /r\n").unwrap();

        let rules = parse_redirects(&work, temp.path(), "").unwrap();
        assert_eq!(rules[0].from, "/work");
    }

    #[test]
    fn test_explicit_redirects_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("custom.json"),
            r#"[{"from": "/only", "to": "/this"}]"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("_redirects"), "/ignored /x\n").unwrap();

        let rules = parse_redirects(temp.path(), temp.path(), "custom.json").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].from, "/only");
    }

    #[test]
    fn test_missing_files_yield_empty() {
        let temp = TempDir::new().unwrap();
        assert!(parse_redirects(temp.path(), temp.path(), "").unwrap().is_empty());
    }
}
