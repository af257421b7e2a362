//! Bot detection for analytics sampling.
//!
//! Detection order: empty user agents are bots; agents that look like a
//! normal browser are not; otherwise regex patterns and the curated
//! substring list decide.

use regex::Regex;
use std::sync::OnceLock;

// Extracted from the analytics database; compared lowercase.
const BOT_LIST: &[&str] = &[
    "amazon-kendra",
    "apache-httpclient/",
    "ask jeeves",
    "atlassian",
    "baidu",
    "bing",
    "changedetection",
    "coccoc",
    "curious george",
    "daum",
    "daumoa",
    "dcrawl",
    "expanse",
    "facebook",
    "facebookexternalhit",
    "feeddemon",
    "feedfetcher-google",
    "github",
    "gitlab",
    "goodlinks",
    "google",
    "google-site-verification",
    "go-http-client",
    "grammarly",
    "httrack",
    "ia_archiver",
    "infoseek",
    "java/",
    "keycdn-tools",
    "lenns.io",
    "libwww-perl",
    "linkvalidator",
    "lychee",
    "lycos",
    "manictime",
    "microsoft",
    "mozlila",
    "msray-plus",
    "naver",
    "netcraftsurveyagent",
    "networkingextension",
    "nutch",
    "pandalytics",
    "pulsetic.com",
    "python-urllib",
    "python-",
    "python/",
    "quic-go-http",
    "qwantify",
    "scrapy",
    "search.marginalia.nu",
    "seolizer",
    "slack-imgproxy",
    "slack",
    "sogou",
    "teleport pro",
    "teleportpro",
    "teoma",
    "tines",
    "twitter",
    "upptime.js.org",
    "wesee",
    "whatsapp",
    "xpanse",
    "xml-sitemaps",
    "y!j-asr",
    "y!j-bsc",
    "yahoo",
    "yandex",
    "yeti",
    "zyborg",
];

fn bot_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)(bot|crawler|spider|scraper|fetch|monitor|check|test)\b").unwrap(),
            Regex::new(r"(?i)\b(curl|wget|http|client|java|python|go-http|ruby|php)\b").unwrap(),
            Regex::new(r"(?i)\b(headless|phantom|selenium|playwright)\b").unwrap(),
            Regex::new(r"(?i)\b(uptime|monitor|ping|health|status)\b").unwrap(),
        ]
    })
}

/// Heuristic pre-filter: short agents and agents missing every common
/// browser token are suspicious. The token comparison is case-sensitive
/// against the raw header, so capitalized `Mozilla`/`WebKit`/`Gecko`
/// browser agents stay suspicious and still run the full pattern and
/// list checks below.
fn has_suspicious_patterns(user_agent: &str) -> bool {
    if user_agent.len() < 10 {
        return true;
    }

    !user_agent.contains("mozilla")
        && !user_agent.contains("webkit")
        && !user_agent.contains("gecko")
}

pub fn is_bot(user_agent: &str) -> bool {
    if user_agent.is_empty() {
        return true;
    }

    if !has_suspicious_patterns(user_agent) {
        return false;
    }

    if bot_patterns().iter().any(|p| p.is_match(user_agent)) {
        return true;
    }

    let lowered = user_agent.to_lowercase();
    BOT_LIST.iter().any(|bot| lowered.contains(bot))
}
