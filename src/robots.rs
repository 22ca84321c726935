//! robots.txt policy engine gating page unfurls.
//!
//! Rule sets are cached per origin (scheme + host) with a TTL behind a
//! read/write lock: lookups vastly outnumber fills, so readers never block
//! each other. Anything that prevents obtaining rules (network failure,
//! unexpected status) fails OPEN: a site that cannot publish its policy is
//! treated as unrestricted, and a 404 explicitly means no restrictions.
//!
//! The parser covers the prefix subset of the robots.txt grammar:
//! `User-agent`, `Allow`, `Disallow`, and `Crawl-delay`, case-insensitive,
//! grouped by the most recent `User-agent` line. No wildcard patterns and no
//! sitemap handling.

use crate::transport::Transport;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use url::Url;

/// How long a fetched rule set stays fresh.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// robots.txt files larger than this are truncated; prefix rules near the
/// front are what matter.
const MAX_ROBOTS_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Default)]
struct RuleSet {
    allow: Vec<String>,
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

struct CacheEntry {
    rules: RuleSet,
    fetched_at: Instant,
}

/// Per-host crawl-permission oracle.
pub struct RobotsPolicy {
    transport: Arc<Transport>,
    agent: String,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl RobotsPolicy {
    /// `agent` is the name matched against `User-agent` groups, normally the
    /// product token of the transport's user-agent string.
    pub fn new(transport: Arc<Transport>, agent: impl Into<String>) -> Self {
        Self::with_ttl(transport, agent, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(transport: Arc<Transport>, agent: impl Into<String>, ttl: Duration) -> Self {
        Self {
            transport,
            agent: agent.into(),
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// May `url` be fetched? Unparseable URLs and unreachable policies are
    /// allowed (fail open).
    pub async fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let rules = self.rules_for(&parsed).await;
        evaluate(&rules, &request_path(&parsed))
    }

    /// Crawl-delay published for `url`'s host, if any.
    pub async fn crawl_delay(&self, url: &str) -> Option<Duration> {
        let parsed = Url::parse(url).ok()?;
        self.rules_for(&parsed).await.crawl_delay
    }

    /// Cached rules for the URL's origin, fetching and caching on miss.
    /// Always yields a rule set; fetch problems yield the empty (allow-all)
    /// set, cached so a down host is not hammered.
    async fn rules_for(&self, url: &Url) -> RuleSet {
        let key = origin(url);

        {
            let cache = self.cache.read().expect("robots cache lock poisoned");
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return entry.rules.clone();
                }
            }
        }

        let rules = self.fetch_rules(url).await;

        let mut cache = self.cache.write().expect("robots cache lock poisoned");
        cache.insert(
            key,
            CacheEntry {
                rules: rules.clone(),
                fetched_at: Instant::now(),
            },
        );
        rules
    }

    async fn fetch_rules(&self, url: &Url) -> RuleSet {
        let robots_url = format!("{}/robots.txt", origin(url));

        let response = match self.transport.get(&robots_url, HeaderMap::new()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt fetch failed, allowing");
                return RuleSet::default();
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return RuleSet::default(),
            status => {
                tracing::debug!(url = %robots_url, status = %status, "unexpected robots.txt status, allowing");
                return RuleSet::default();
            }
        }

        match self.transport.read_capped(response, MAX_ROBOTS_BYTES).await {
            Ok(body) => parse(&String::from_utf8_lossy(&body), &self.agent),
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt body read failed, allowing");
                RuleSet::default()
            }
        }
    }
}

fn origin(url: &Url) -> String {
    let mut out = format!("{}://", url.scheme());
    out.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out
}

/// Path (plus query, if any) matched against rule prefixes.
fn request_path(url: &Url) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    path
}

/// Parses the rules applying to `agent`.
///
/// Each `User-agent` line starts a new group and subsequent directives attach
/// to it. A group applies if its token exactly matches `agent`, is a prefix
/// of it, or is `*` (the latter only while no specific group has been seen).
/// The first specific group discards any `*` rules collected before it;
/// multiple applying groups of the same kind merge.
fn parse(text: &str, agent: &str) -> RuleSet {
    let agent_lc = agent.to_ascii_lowercase();
    let mut rules = RuleSet::default();
    let mut has_specific = false;
    // Directives before any User-agent line attach to nothing.
    let mut current_applies = false;

    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                let token = value.to_ascii_lowercase();
                if token != "*" && (agent_lc == token || agent_lc.starts_with(&token)) {
                    if !has_specific {
                        rules = RuleSet::default();
                        has_specific = true;
                    }
                    current_applies = true;
                } else {
                    current_applies = token == "*" && !has_specific;
                }
            }
            "disallow" if current_applies => {
                // An empty Disallow means "allow everything".
                if !value.is_empty() {
                    rules.disallow.push(value.to_string());
                }
            }
            "allow" if current_applies => {
                if !value.is_empty() {
                    rules.allow.push(value.to_string());
                }
            }
            "crawl-delay" if current_applies => {
                if let Ok(secs) = value.parse::<f64>() {
                    if secs.is_finite() && secs >= 0.0 {
                        rules.crawl_delay = Some(Duration::from_secs_f64(secs));
                    }
                }
            }
            _ => {}
        }
    }

    rules
}

/// Longest-prefix evaluation: disallowed when a disallow prefix matches,
/// unless an allow prefix of equal or greater length also matches.
///
/// The equal-length case goes to allow, matching the tie-break the Robots
/// Exclusion Protocol draft and Google's parser apply to rules of identical
/// specificity.
fn evaluate(rules: &RuleSet, path: &str) -> bool {
    let disallowed = rules
        .disallow
        .iter()
        .filter(|prefix| path.starts_with(prefix.as_str()))
        .map(|prefix| prefix.len())
        .max();

    let Some(disallow_len) = disallowed else {
        return true;
    };

    rules
        .allow
        .iter()
        .filter(|prefix| path.starts_with(prefix.as_str()))
        .map(|prefix| prefix.len())
        .any(|allow_len| allow_len >= disallow_len)
}
