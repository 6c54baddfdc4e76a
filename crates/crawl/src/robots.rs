//! robots.txt compliance.
//!
//! Hand-parsed rather than pulled in as a dependency: the crawler only needs
//! user-agent group selection, longest-prefix Allow/Disallow, and
//! Crawl-delay. Fetch failures fail open.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use url::Url;

const ROBOTS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Allow(String),
    Disallow(String),
}

#[derive(Debug, Default, Clone)]
pub struct RobotsRules {
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

impl RobotsRules {
    /// Parse robots.txt, keeping the group that best matches `user_agent`
    /// (exact token match beats `*`).
    pub fn parse(text: &str, user_agent: &str) -> Self {
        let ua_token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_lowercase();

        let mut best: Option<(bool, RobotsRules)> = None; // (is_specific, rules)
        let mut current_agents: Vec<String> = Vec::new();
        let mut current = RobotsRules::default();
        let mut in_group = false;

        let mut flush = |agents: &[String], rules: RobotsRules, best: &mut Option<(bool, RobotsRules)>| {
            let specific = agents.iter().any(|a| ua_token.contains(a.as_str()) && a != "*");
            let wildcard = agents.iter().any(|a| a == "*");
            if specific {
                *best = Some((true, rules));
            } else if wildcard && !matches!(best, Some((true, _))) {
                *best = Some((false, rules));
            }
        };

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_lowercase();
            let value = value.trim().to_string();

            match field.as_str() {
                "user-agent" => {
                    if in_group {
                        flush(&current_agents, std::mem::take(&mut current), &mut best);
                        current_agents.clear();
                        in_group = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "allow" => {
                    in_group = true;
                    if !value.is_empty() {
                        current.rules.push(Rule::Allow(value));
                    }
                }
                "disallow" => {
                    in_group = true;
                    if !value.is_empty() {
                        current.rules.push(Rule::Disallow(value));
                    }
                }
                "crawl-delay" => {
                    in_group = true;
                    current.crawl_delay = value.parse().ok();
                }
                _ => {}
            }
        }
        flush(&current_agents, current, &mut best);

        best.map(|(_, rules)| rules).unwrap_or_default()
    }

    /// Longest matching prefix wins; ties go to Allow. No rules = allowed.
    pub fn can_fetch(&self, path: &str) -> bool {
        let mut winner: Option<(usize, bool)> = None;
        for rule in &self.rules {
            let (prefix, allowed) = match rule {
                Rule::Allow(p) => (p, true),
                Rule::Disallow(p) => (p, false),
            };
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                match winner {
                    Some((best_len, best_allowed)) => {
                        if len > best_len || (len == best_len && allowed && !best_allowed) {
                            winner = Some((len, allowed));
                        }
                    }
                    None => winner = Some((len, allowed)),
                }
            }
        }
        winner.map(|(_, allowed)| allowed).unwrap_or(true)
    }

    pub fn crawl_delay(&self) -> Option<f64> {
        self.crawl_delay
    }
}

struct CachedRobots {
    fetched_at: Instant,
    rules: Option<RobotsRules>,
}

pub struct RobotsChecker {
    http: reqwest::Client,
    user_agent: String,
    cache: DashMap<String, Mutex<CachedRobots>>,
}

impl RobotsChecker {
    pub fn new(user_agent: impl Into<String>) -> Self {
        let user_agent = user_agent.into();
        let http = reqwest::Client::builder()
            .user_agent(user_agent.clone())
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { http, user_agent, cache: DashMap::new() }
    }

    /// True if robots.txt permits fetching `url`. Missing or unfetchable
    /// robots.txt allows everything.
    pub async fn can_fetch(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let Some(host) = parsed.host_str() else {
            return true;
        };
        let origin = format!("{}://{}", parsed.scheme(), host);

        if let Some(cached) = self.cache.get(&origin) {
            let guard = cached.lock().unwrap();
            if guard.fetched_at.elapsed() < ROBOTS_CACHE_TTL {
                return guard
                    .rules
                    .as_ref()
                    .map(|r| r.can_fetch(parsed.path()))
                    .unwrap_or(true);
            }
        }

        let rules = self.fetch_rules(&origin).await;
        let allowed = rules
            .as_ref()
            .map(|r| r.can_fetch(parsed.path()))
            .unwrap_or(true);
        self.cache.insert(
            origin,
            Mutex::new(CachedRobots { fetched_at: Instant::now(), rules }),
        );
        if !allowed {
            debug!(url, "robots.txt disallows");
        }
        allowed
    }

    pub async fn crawl_delay(&self, url: &str) -> Option<f64> {
        let parsed = Url::parse(url).ok()?;
        let origin = format!("{}://{}", parsed.scheme(), parsed.host_str()?);
        if let Some(cached) = self.cache.get(&origin) {
            let guard = cached.lock().unwrap();
            if guard.fetched_at.elapsed() < ROBOTS_CACHE_TTL {
                return guard.rules.as_ref().and_then(|r| r.crawl_delay());
            }
        }
        let rules = self.fetch_rules(&origin).await;
        let delay = rules.as_ref().and_then(|r| r.crawl_delay());
        self.cache.insert(
            origin,
            Mutex::new(CachedRobots { fetched_at: Instant::now(), rules }),
        );
        delay
    }

    async fn fetch_rules(&self, origin: &str) -> Option<RobotsRules> {
        let robots_url = format!("{origin}/robots.txt");
        let response = self.http.get(&robots_url).send().await.ok()?;
        if response.status().as_u16() != 200 {
            return None;
        }
        let text = response.text().await.ok()?;
        Some(RobotsRules::parse(&text, &self.user_agent))
    }
}
