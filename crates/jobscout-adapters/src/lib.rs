//! Source parsers: raw listing pages into ordered `RawJobCandidate`s.

use jobscout_core::{ParserKind, RawJobCandidate, SelectorMap, SourceConfig};
use jobscout_fetch::RawContent;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "jobscout-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed content from {source_id}: {reason}")]
    MalformedContent { source_id: String, reason: String },
    #[error("invalid selector `{selector}` for {source_id}: {reason}")]
    InvalidSelector {
        source_id: String,
        selector: String,
        reason: String,
    },
}

/// Candidates in page order plus the count of cards dropped for having neither title nor company.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedPage {
    pub candidates: Vec<RawJobCandidate>,
    pub dropped: usize,
}

impl ParsedPage {
    fn push(&mut self, candidate: RawJobCandidate) {
        if candidate.is_anonymous() {
            self.dropped += 1;
        } else {
            self.candidates.push(candidate);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceParser {
    Html(SelectorMap),
    GithubJson,
}

impl SourceParser {
    pub fn for_kind(kind: &ParserKind) -> Self {
        match kind {
            ParserKind::Indeed => Self::Html(SelectorMap::indeed()),
            ParserKind::Github => Self::GithubJson,
            ParserKind::Generic { selectors } => Self::Html(selectors.clone()),
        }
    }

    pub fn for_source(source: &SourceConfig) -> Self {
        Self::for_kind(&source.parser)
    }

    pub fn parse(&self, raw: &RawContent) -> Result<ParsedPage, ParseError> {
        let page = match self {
            Self::Html(selectors) => parse_html_cards(raw, selectors)?,
            Self::GithubJson => parse_github_json(raw)?,
        };
        debug!(
            source_id = %raw.source_id,
            candidates = page.candidates.len(),
            dropped = page.dropped,
            "parsed page"
        );
        Ok(page)
    }
}

pub fn parse(source: &SourceConfig, raw: &RawContent) -> Result<ParsedPage, ParseError> {
    SourceParser::for_source(source).parse(raw)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compile(source_id: &str, selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::InvalidSelector {
        source_id: source_id.to_string(),
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn compile_opt(source_id: &str, selector: Option<&String>) -> Result<Option<Selector>, ParseError> {
    selector
        .filter(|s| !s.trim().is_empty())
        .map(|s| compile(source_id, s))
        .transpose()
}

struct CompiledSelectors {
    card: Selector,
    title: Option<Selector>,
    company: Option<Selector>,
    location: Option<Selector>,
    description: Option<Selector>,
    salary: Option<Selector>,
    link: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(source_id: &str, map: &SelectorMap) -> Result<Self, ParseError> {
        Ok(Self {
            card: compile(source_id, &map.card)?,
            title: compile_opt(source_id, map.title.as_ref())?,
            company: compile_opt(source_id, map.company.as_ref())?,
            location: compile_opt(source_id, map.location.as_ref())?,
            description: compile_opt(source_id, map.description.as_ref())?,
            salary: compile_opt(source_id, map.salary.as_ref())?,
            link: compile_opt(source_id, map.link.as_ref())?,
        })
    }
}

fn select_first_text(card: ElementRef<'_>, selector: Option<&Selector>) -> String {
    selector
        .and_then(|sel| card.select(sel).next())
        .map(|n| collapse_whitespace(&n.text().collect::<Vec<_>>().join(" ")))
        .unwrap_or_default()
}

fn select_first_href(card: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let sel = selector?;
    card.select(sel)
        .next()
        .and_then(|n| n.value().attr("href"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(joined) => joined.to_string(),
        None => href.to_string(),
    }
}

fn parse_html_cards(raw: &RawContent, map: &SelectorMap) -> Result<ParsedPage, ParseError> {
    let selectors = CompiledSelectors::compile(&raw.source_id, map)?;
    let document = Html::parse_document(&raw.body);
    let base = Url::parse(&raw.url).ok();

    let mut page = ParsedPage::default();
    for card in document.select(&selectors.card) {
        let url = select_first_href(card, selectors.link.as_ref())
            .map(|href| resolve_link(base.as_ref(), &href))
            .unwrap_or_default();
        page.push(RawJobCandidate {
            source_id: raw.source_id.clone(),
            title: select_first_text(card, selectors.title.as_ref()),
            company: select_first_text(card, selectors.company.as_ref()),
            location: select_first_text(card, selectors.location.as_ref()),
            description: select_first_text(card, selectors.description.as_ref()),
            salary: select_first_text(card, selectors.salary.as_ref()),
            url,
        });
    }
    Ok(page)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Job APIs often ship HTML descriptions; keep the text only.
fn strip_markup(text: &str) -> String {
    if !text.contains('<') {
        return collapse_whitespace(text);
    }
    let fragment = Html::parse_fragment(text);
    collapse_whitespace(&fragment.root_element().text().collect::<String>())
}

fn parse_github_json(raw: &RawContent) -> Result<ParsedPage, ParseError> {
    let malformed = |reason: String| ParseError::MalformedContent {
        source_id: raw.source_id.clone(),
        reason,
    };
    let value: JsonValue =
        serde_json::from_str(&raw.body).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let items = value
        .as_array()
        .or_else(|| value.get("jobs").and_then(JsonValue::as_array))
        .ok_or_else(|| malformed("expected a JSON array of positions".to_string()))?;

    let mut page = ParsedPage::default();
    for item in items {
        if !item.is_object() {
            page.dropped += 1;
            continue;
        }
        let text = |key: &str| json_str(item, &[key]).map(collapse_whitespace).unwrap_or_default();
        page.push(RawJobCandidate {
            source_id: raw.source_id.clone(),
            title: text("title"),
            company: text("company"),
            location: text("location"),
            description: json_str(item, &["description"]).map(strip_markup).unwrap_or_default(),
            salary: text("salary"),
            url: json_str(item, &["url"])
                .or_else(|| json_str(item, &["html_url"]))
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        });
    }
    Ok(page)
}
