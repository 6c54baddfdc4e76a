//! URL scoring for crawl prioritization.
//!
//! Scores are dimension-aligned with the evaluation framework: TRUST,
//! EVIDENCE, EFFECTIVENESS, and FIT each contribute up to 25 points,
//! donation pages add up to 15, canonical short paths get a bonus, and
//! low-signal pages (blog, news, events) are penalized. After fetching, page
//! bodies can add a content boost that also reclassifies the page.

use std::collections::BTreeMap;

use regex::Regex;
use url::Url;

use goodmeasure_core::types::{Dimension, PageType};

const TRUST_KEYWORDS: &[&str] = &[
    "990", "form-990", "form990", "annual-report", "annual-reports", "annualreport",
    "financials", "financial-statements", "financial-report", "audit", "audited", "auditor",
    "transparency", "accountability", "disclosure", "open-data",
    "governance", "board", "board-of-directors", "trustees", "leadership", "executive-team",
    "officers", "candid", "guidestar", "platinum-seal", "gold-seal",
];

const EVIDENCE_KEYWORDS: &[&str] = &[
    "impact", "outcomes", "results", "achievements", "success-stories", "our-impact",
    "evaluation", "evaluations", "research", "studies", "metrics", "measurement",
    "monitoring", "theory-of-change", "logic-model", "methodology", "approach",
    "how-we-work", "impact-report", "impact-reports", "annual-review", "progress-report",
];

const EFFECTIVENESS_KEYWORDS: &[&str] = &[
    "program", "programs", "programme", "programmes", "what-we-do", "our-work",
    "our-programs", "services", "initiatives", "projects", "education", "health",
    "healthcare", "welfare", "relief", "humanitarian", "development", "emergency",
    "efficiency", "overhead", "where-money-goes", "how-we-spend",
];

const FIT_KEYWORDS: &[&str] = &[
    "about", "about-us", "mission", "our-mission", "vision", "values", "who-we-are",
    "our-story", "history", "who-we-serve", "beneficiaries", "communities",
    "populations", "recipients", "zakat", "zakaat", "sadaqah", "sadaqa", "islamic",
    "shariah", "sharia", "fiqh", "halal", "muslim", "ummah",
];

const DONATION_KEYWORDS: &[&str] = &[
    "donate", "donation", "donations", "give", "giving", "ways-to-give", "how-to-give",
    "ways-to-help", "support-us", "contribute", "stocks", "securities", "matching",
    "planned-giving", "legacy",
];

const PENALTY_KEYWORDS: &[&str] = &[
    "blog", "blogs", "news", "newsroom", "event", "events", "press", "press-release",
    "media", "stories", "update", "updates", "newsletter", "subscribe", "careers",
    "jobs", "employment", "login", "signin", "cart", "checkout",
];

const CANONICAL_PAGES: &[&str] = &[
    "/donate/", "/donate", "/zakat/", "/zakat", "/about/", "/about", "/about-us/",
    "/about-us", "/impact/", "/impact", "/our-work/", "/our-work", "/programs/",
    "/programs", "/financials/", "/financials", "/ways-to-give/", "/ways-to-give",
    "/annual-report/", "/annual-report", "/transparency/", "/transparency",
];

/// Body keywords indicating high-value content regardless of URL shape.
/// Primarily zakat-eligibility markers; a hit reclassifies the page to FIT.
const CONTENT_BOOST_KEYWORDS: &[&str] = &[
    "zakat eligible", "zakat-eligible", "accepts zakat", "accept zakat", "give zakat",
    "give your zakat", "donate zakat", "pay zakat", "zakat donation", "zakat fund",
    "your zakat", "zakaat eligible", "zakah eligible", "tax deductible and zakat",
    "zakat and sadaqah", "fidya", "kaffarah", "sadaqat al-fitr", "zakat al-fitr",
    "zakat ul-fitr",
];

const CONTENT_BOOST_POINTS: i32 = 50;
const HOMEPAGE_BASELINE: i32 = 70;

#[derive(Debug, Clone)]
pub struct PageScore {
    pub url: String,
    pub raw_score: u32,
    pub page_type: PageType,
    pub primary_dimension: Dimension,
    pub matched_keywords: Vec<String>,
    pub breakdown: BTreeMap<String, i32>,
}

impl PageScore {
    pub fn is_high_priority(&self) -> bool {
        self.raw_score >= 50
    }
}

#[derive(Debug, Default)]
pub struct PageClassifier;

impl PageClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Score a URL against the dimension keyword sets. `context` is the
    /// combined anchor text / page title / h1 when known.
    pub fn score_url(&self, url: &str, context: Option<&str>) -> PageScore {
        let path = url_path(url);

        if path.is_empty() || path == "/" {
            let mut breakdown = BTreeMap::new();
            breakdown.insert("homepage_baseline".into(), HOMEPAGE_BASELINE);
            return PageScore {
                url: url.to_string(),
                raw_score: HOMEPAGE_BASELINE as u32,
                page_type: PageType::Homepage,
                primary_dimension: Dimension::None,
                matched_keywords: vec!["homepage".into()],
                breakdown,
            };
        }

        let context = context.unwrap_or("").to_lowercase();
        let all_text = format!("{path} {context}");

        let mut breakdown: BTreeMap<String, i32> = BTreeMap::new();
        let mut matched_keywords: Vec<String> = Vec::new();
        let mut dimension_scores: Vec<(Dimension, i32)> = Vec::new();

        for (dimension, keywords) in [
            (Dimension::Trust, TRUST_KEYWORDS),
            (Dimension::Evidence, EVIDENCE_KEYWORDS),
            (Dimension::Effectiveness, EFFECTIVENESS_KEYWORDS),
            (Dimension::Fit, FIT_KEYWORDS),
        ] {
            let matches = match_keywords(&path, &all_text, keywords);
            if matches.is_empty() {
                dimension_scores.push((dimension, 0));
                continue;
            }
            // 20 points for a path match, 15 for context-only, +5 when more
            // than one keyword hits, capped at 25.
            let mut points = if matches.iter().any(|kw| path.contains(kw.as_str())) { 20 } else { 15 };
            if matches.len() > 1 {
                points = (points + 5).min(25);
            }
            breakdown.insert(dimension.as_str().to_string(), points);
            matched_keywords.extend(matches);
            dimension_scores.push((dimension, points));
        }

        let donation_matches = match_keywords(&path, &all_text, DONATION_KEYWORDS);
        if !donation_matches.is_empty() {
            breakdown.insert("donation".into(), 15);
            matched_keywords.extend(donation_matches);
        }

        let mut total: i32 = breakdown.values().sum();

        if PENALTY_KEYWORDS.iter().any(|kw| path.contains(kw)) {
            total -= 15;
            breakdown.insert("penalty".into(), -15);
        }

        if CANONICAL_PAGES.contains(&path.as_str()) {
            total += 30;
            breakdown.insert("canonical_bonus".into(), 30);
        }

        // Long single-segment paths are almost always article permalinks.
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() == 1 && segments[0].len() > 50 {
            total -= 20;
            breakdown.insert("long_url_penalty".into(), -20);
        }

        let total = total.clamp(0, 100);

        let primary_dimension = dimension_scores
            .iter()
            .filter(|(_, pts)| *pts > 0)
            .max_by_key(|(_, pts)| *pts)
            .map(|(dim, _)| *dim)
            .unwrap_or(Dimension::None);

        let page_type = classify_from_path(&path, primary_dimension);

        matched_keywords.sort();
        matched_keywords.dedup();

        PageScore {
            url: url.to_string(),
            raw_score: total as u32,
            page_type,
            primary_dimension,
            matched_keywords,
            breakdown,
        }
    }

    /// Points and matched keywords for body content; zero when nothing hits.
    pub fn check_content_boost(&self, content: &str) -> (i32, Vec<String>) {
        let lower = content.to_lowercase();
        let matched: Vec<String> = CONTENT_BOOST_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(*kw))
            .map(|kw| kw.to_string())
            .collect();
        if matched.is_empty() {
            (0, matched)
        } else {
            (CONTENT_BOOST_POINTS, matched)
        }
    }

    /// Re-score after fetching a body. Zakat hits move the page to FIT.
    pub fn apply_content_boost(&self, score: &PageScore, content: &str) -> PageScore {
        let (boost, matched) = self.check_content_boost(content);
        if boost == 0 {
            return score.clone();
        }
        let mut boosted = score.clone();
        boosted.breakdown.insert("content_boost".into(), boost);
        boosted.raw_score = (score.raw_score as i32 + boost).min(100) as u32;
        if matched.iter().any(|kw| kw.contains("zakat") || kw.contains("zakah") || kw.contains("zakaat")) {
            boosted.primary_dimension = Dimension::Fit;
            boosted.page_type = PageType::Fit;
        }
        boosted.matched_keywords.extend(matched);
        boosted.matched_keywords.sort();
        boosted.matched_keywords.dedup();
        boosted
    }

    /// Select up to `max_pages` with dimension diversity: the homepage, at
    /// least two pages per dimension, one or two donation pages, then fill
    /// by score.
    pub fn select_top_pages(&self, mut scores: Vec<PageScore>, max_pages: usize) -> Vec<PageScore> {
        scores.sort_by(|a, b| {
            b.raw_score
                .cmp(&a.raw_score)
                .then_with(|| url_depth(&a.url).cmp(&url_depth(&b.url)))
                .then_with(|| a.url.cmp(&b.url))
        });

        let mut selected: Vec<PageScore> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        let mut add = |ps: &PageScore, selected: &mut Vec<PageScore>, seen: &mut std::collections::HashSet<String>| {
            if seen.insert(ps.url.clone()) {
                selected.push(ps.clone());
            }
        };

        if let Some(home) = scores.iter().find(|ps| ps.page_type == PageType::Homepage) {
            add(home, &mut selected, &mut seen);
        }

        for dimension in [Dimension::Trust, Dimension::Evidence, Dimension::Effectiveness, Dimension::Fit] {
            for ps in scores
                .iter()
                .filter(|ps| ps.primary_dimension == dimension && ps.page_type != PageType::Homepage)
                .take(2)
            {
                if selected.len() >= max_pages {
                    return selected;
                }
                add(ps, &mut selected, &mut seen);
            }
        }

        for ps in scores.iter().filter(|ps| ps.page_type == PageType::Donate).take(2) {
            if selected.len() >= max_pages {
                return selected;
            }
            add(ps, &mut selected, &mut seen);
        }

        for ps in &scores {
            if selected.len() >= max_pages {
                break;
            }
            add(ps, &mut selected, &mut seen);
        }
        selected
    }
}

/// Page type used to pick the LLM extraction prompt.
pub fn llm_page_type(url: &str) -> PageType {
    let path = url_path(url);
    if path.is_empty() || path == "/" {
        return PageType::Homepage;
    }
    if path.contains("zakat") || path.contains("zakaat") {
        return PageType::Zakat;
    }
    if DONATION_KEYWORDS.iter().any(|kw| path.contains(kw)) {
        return PageType::Donate;
    }
    if path.contains("contact") {
        return PageType::Contact;
    }
    if path.contains("impact") || path.contains("outcome") || path.contains("results") {
        return PageType::Impact;
    }
    if path.contains("program") || path.contains("what-we-do") || path.contains("our-work") {
        return PageType::Programs;
    }
    if path.contains("about") || path.contains("mission") || path.contains("who-we-are") {
        return PageType::About;
    }
    PageType::Other
}

fn classify_from_path(path: &str, primary_dimension: Dimension) -> PageType {
    if DONATION_KEYWORDS.iter().any(|kw| path.contains(kw)) {
        return PageType::Donate;
    }
    match primary_dimension {
        Dimension::Trust => PageType::Trust,
        Dimension::Evidence => PageType::Evidence,
        Dimension::Effectiveness => PageType::Effectiveness,
        Dimension::Fit => PageType::Fit,
        Dimension::None => PageType::Other,
    }
}

/// Keywords match the URL path by substring (path segments are already
/// slash-bounded) and the combined text by word boundary, so `art` does not
/// match `cart`.
fn match_keywords(path: &str, all_text: &str, keywords: &[&str]) -> Vec<String> {
    let mut matches = Vec::new();
    for kw in keywords {
        if path.contains(kw) {
            matches.push(kw.to_string());
        } else if let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw))) {
            if re.is_match(all_text) {
                matches.push(kw.to_string());
            }
        }
    }
    matches
}

fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => url.to_lowercase(),
    }
}

fn url_depth(url: &str) -> usize {
    url_path(url).split('/').filter(|s| !s.is_empty()).count()
}
