//! Core domain model for jobscout: canonical postings, source descriptors and the normalizer.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobscout-core";

/// Fallback pool used whenever a source is configured without user agents.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    Junior,
    Mid,
    Senior,
    #[default]
    Unspecified,
}

impl ExperienceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
            Self::Unspecified => "unspecified",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "junior" => Some(Self::Junior),
            "mid" => Some(Self::Mid),
            "senior" => Some(Self::Senior),
            "unspecified" => Some(Self::Unspecified),
            _ => None,
        }
    }
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source prefers to be fetched. The orchestrator may downgrade `Browser` to `Http`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Http,
    Browser,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Browser => f.write_str("browser"),
        }
    }
}

/// CSS selectors for a card-based HTML job board. Every selector except `card`
/// is evaluated relative to a matched card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorMap {
    pub card: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub salary: Option<String>,
    /// Read from the `href` attribute.
    #[serde(default)]
    pub link: Option<String>,
}

impl SelectorMap {
    pub fn indeed() -> Self {
        Self {
            card: "div.job_seen_beacon".to_string(),
            title: Some("h2.jobTitle".to_string()),
            company: Some("span.companyName".to_string()),
            location: Some("div.companyLocation".to_string()),
            description: Some("div.job-snippet".to_string()),
            salary: Some("div.salary-snippet".to_string()),
            link: Some("a[href]".to_string()),
        }
    }
}

/// Closed set of parser shapes a source can declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserKind {
    Indeed,
    Github,
    Generic { selectors: SelectorMap },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Politeness {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub user_agents: Vec<String>,
}

fn default_min_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    4_000
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            user_agents: Vec::new(),
        }
    }
}

impl Politeness {
    /// No delay, built-in user agents. Handy for fixtures and tests.
    pub fn immediate() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            user_agents: Vec::new(),
        }
    }

    /// The configured pool, or the built-in one when the configured pool is empty.
    pub fn user_agent_pool(&self) -> Vec<String> {
        let configured = self
            .user_agents
            .iter()
            .map(|ua| ua.trim())
            .filter(|ua| !ua.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if configured.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect()
        } else {
            configured
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url_template: String,
    pub parser: ParserKind,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub default_location: Option<String>,
    #[serde(default)]
    pub politeness: Politeness,
}

fn default_enabled() -> bool {
    true
}

fn default_pages() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SourceConfigError(pub String);

impl SourceConfig {
    pub fn new(source_id: impl Into<String>, url_template: impl Into<String>, parser: ParserKind) -> Self {
        let source_id = source_id.into();
        Self {
            display_name: source_id.clone(),
            source_id,
            enabled: true,
            url_template: url_template.into(),
            parser,
            strategy: StrategyKind::Http,
            pages: default_pages(),
            page_size: default_page_size(),
            default_location: None,
            politeness: Politeness::default(),
        }
    }

    pub fn validate(&self) -> Result<(), SourceConfigError> {
        if self.source_id.trim().is_empty() {
            return Err(SourceConfigError("source_id must not be empty".to_string()));
        }
        if self.url_template.trim().is_empty() {
            return Err(SourceConfigError(format!(
                "source {} has an empty url_template",
                self.source_id
            )));
        }
        if self.politeness.min_delay_ms > self.politeness.max_delay_ms {
            return Err(SourceConfigError(format!(
                "source {} has min_delay_ms={} > max_delay_ms={}",
                self.source_id, self.politeness.min_delay_ms, self.politeness.max_delay_ms
            )));
        }
        if let ParserKind::Generic { selectors } = &self.parser {
            if selectors.card.trim().is_empty() {
                return Err(SourceConfigError(format!(
                    "source {} declares a generic parser without a card selector",
                    self.source_id
                )));
            }
        }
        Ok(())
    }

    /// Expand `{keywords}`, `{location}`, `{page}` and `{offset}` for one page of results.
    pub fn render_url(&self, query: &SearchQuery) -> String {
        let location = query
            .location
            .as_deref()
            .or(self.default_location.as_deref())
            .unwrap_or_default();
        let offset = u64::from(query.page) * u64::from(self.page_size);
        self.url_template
            .replace("{keywords}", &encode_component(&query.keywords))
            .replace("{location}", &encode_component(location))
            .replace("{page}", &query.page.to_string())
            .replace("{offset}", &offset.to_string())
    }
}

fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.trim().as_bytes()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: String,
    pub location: Option<String>,
    pub page: u32,
}

impl SearchQuery {
    pub fn new(keywords: impl Into<String>) -> Self {
        Self {
            keywords: keywords.into(),
            location: None,
            page: 0,
        }
    }

    pub fn with_page(&self, page: u32) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }
}

/// Parser output before normalization. Missing values are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawJobCandidate {
    pub source_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub salary: String,
    pub url: String,
}

impl RawJobCandidate {
    /// A candidate with neither title nor company carries nothing worth keeping.
    pub fn is_anonymous(&self) -> bool {
        self.title.trim().is_empty() && self.company.trim().is_empty()
    }
}

/// Canonical persisted job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub description: String,
    pub skills: BTreeSet<String>,
    pub experience_level: ExperienceLevel,
    pub salary: Option<String>,
    pub source: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable fingerprint of `(title, company, source, url)`.
pub fn identity_hash(title: &str, company: &str, source: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_key_fragment(title).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_key_fragment(company).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_key_fragment(source).as_bytes());
    hasher.update([0x1f]);
    hasher.update(url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub const DEFAULT_SKILLS: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "c++",
    "c#",
    "go",
    "rust",
    "react",
    "vue",
    "angular",
    "node.js",
    "django",
    "flask",
    "fastapi",
    "sql",
    "mysql",
    "postgresql",
    "mongodb",
    "docker",
    "kubernetes",
    "aws",
    "gcp",
    "git",
    "ci/cd",
    "devops",
    "linux",
    "machine learning",
    "tensorflow",
    "pandas",
    "numpy",
    "scikit-learn",
    "rest api",
    "graphql",
    "html",
    "css",
];

const SENIOR_KEYWORDS: &[&str] = &["senior", "sr.", "sr", "lead", "principal"];
const JUNIOR_KEYWORDS: &[&str] = &["junior", "jr.", "jr", "entry", "graduate"];
const MID_KEYWORDS: &[&str] = &["mid", "mid-level", "intermediate"];

/// Fixed, lowercase keyword vocabulary used for skill extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillVocabulary {
    terms: Vec<String>,
}

impl Default for SkillVocabulary {
    fn default() -> Self {
        Self::from_terms(DEFAULT_SKILLS.iter().copied())
    }
}

impl SkillVocabulary {
    pub fn from_terms<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|t| normalize_key_fragment(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { terms }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn extract(&self, text: &str) -> BTreeSet<String> {
        let haystack = text.to_lowercase();
        self.terms
            .iter()
            .filter(|term| contains_keyword(&haystack, term))
            .cloned()
            .collect()
    }
}

/// Substring match whose alphanumeric edges are not glued to other alphanumerics.
/// A term ending in a letter may carry a version suffix (`python3`, `java8`).
/// `haystack` must already be lowercase.
fn contains_keyword(haystack: &str, keyword: &str) -> bool {
    let Some(last) = keyword.chars().last() else {
        return false;
    };
    let check_start = keyword.chars().next().is_some_and(|c| c.is_alphanumeric());
    let check_end = last.is_alphanumeric();
    haystack.match_indices(keyword).any(|(start, matched)| {
        let end = start + matched.len();
        let before_ok = !check_start
            || haystack[..start]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric());
        let rest = if last.is_alphabetic() {
            haystack[end..].trim_start_matches(|c: char| c.is_ascii_digit())
        } else {
            &haystack[end..]
        };
        let after_ok = !check_end || rest.chars().next().map_or(true, |c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

fn level_in(text: &str) -> Option<ExperienceLevel> {
    let lower = text.to_lowercase();
    let tiers = [
        (SENIOR_KEYWORDS, ExperienceLevel::Senior),
        (JUNIOR_KEYWORDS, ExperienceLevel::Junior),
        (MID_KEYWORDS, ExperienceLevel::Mid),
    ];
    tiers
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| contains_keyword(&lower, k)))
        .map(|(_, level)| *level)
}

/// Title wins over description; within a text, senior > junior > mid.
pub fn infer_experience_level(title: &str, description: &str) -> ExperienceLevel {
    level_in(title)
        .or_else(|| level_in(description))
        .unwrap_or(ExperienceLevel::Unspecified)
}

fn collapse(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: &str) -> Option<String> {
    let collapsed = collapse(value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    vocabulary: SkillVocabulary,
}

impl Normalizer {
    pub fn new(vocabulary: SkillVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &SkillVocabulary {
        &self.vocabulary
    }

    pub fn normalize(&self, candidate: RawJobCandidate, scraped_at: DateTime<Utc>) -> JobPosting {
        let title = collapse(&candidate.title);
        let company = collapse(&candidate.company);
        let description = collapse(&candidate.description);
        let url = candidate.url.trim().to_string();
        let skills = self.vocabulary.extract(&format!("{title} {description}"));
        let experience_level = infer_experience_level(&title, &description);
        let id = identity_hash(&title, &company, &candidate.source_id, &url);

        JobPosting {
            id,
            title,
            company,
            location: non_empty(&candidate.location),
            description,
            skills,
            experience_level,
            salary: non_empty(&candidate.salary),
            source: candidate.source_id,
            url,
            scraped_at,
        }
    }
}
