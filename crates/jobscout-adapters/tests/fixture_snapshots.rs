use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use jobscout_adapters::{parse, ParsedPage};
use jobscout_core::{ParserKind, SelectorMap, SourceConfig, StrategyKind};
use jobscout_fetch::RawContent;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(source_id: &str, file: &str) -> Result<String> {
    let path = workspace_root().join("fixtures").join(source_id).join(file);
    fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
}

fn expected_snapshot(source_id: &str) -> Result<ParsedPage> {
    let text = fixture(source_id, "snapshot.json")?;
    serde_json::from_str(&text).with_context(|| format!("parsing {source_id} snapshot"))
}

fn raw(source_id: &str, url: &str, body: String) -> RawContent {
    RawContent {
        source_id: source_id.to_string(),
        url: url.to_string(),
        body,
        fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap(),
        strategy: StrategyKind::Http,
    }
}

fn linkedin_source() -> SourceConfig {
    SourceConfig::new(
        "linkedin",
        "https://www.linkedin.com/jobs/search/?keywords={keywords}&start={offset}",
        ParserKind::Generic {
            selectors: SelectorMap {
                card: "div.base-card".into(),
                title: Some("h3".into()),
                company: Some("h4".into()),
                location: Some("span.job-search-card__location".into()),
                description: Some("h3".into()),
                salary: Some("span.job-search-card__salary-info".into()),
                link: Some("a.base-card__full-link".into()),
            },
        },
    )
}

#[test]
fn indeed_listing_matches_snapshot() -> Result<()> {
    let source = SourceConfig::new(
        "indeed",
        "https://www.indeed.com/jobs?q={keywords}&l={location}&start={offset}",
        ParserKind::Indeed,
    );
    let page = parse(
        &source,
        &raw(
            "indeed",
            "https://www.indeed.com/jobs?q=python+developer&l=Remote&start=0",
            fixture("indeed", "search.html")?,
        ),
    )?;
    assert_eq!(page, expected_snapshot("indeed")?);
    Ok(())
}

#[test]
fn github_positions_match_snapshot() -> Result<()> {
    let source = SourceConfig::new(
        "github",
        "https://jobs.github.com/positions.json?description={keywords}&page={page}",
        ParserKind::Github,
    );
    let page = parse(
        &source,
        &raw(
            "github",
            "https://jobs.github.com/positions.json?description=python&page=0",
            fixture("github", "positions.json")?,
        ),
    )?;
    assert_eq!(page, expected_snapshot("github")?);
    Ok(())
}

#[test]
fn linkedin_generic_template_matches_snapshot() -> Result<()> {
    let page = parse(
        &linkedin_source(),
        &raw(
            "linkedin",
            "https://www.linkedin.com/jobs/search/?keywords=python&start=0",
            fixture("linkedin", "search.html")?,
        ),
    )?;
    assert_eq!(page, expected_snapshot("linkedin")?);
    Ok(())
}

#[test]
fn html_parser_on_unrelated_markup_yields_nothing() -> Result<()> {
    let page = parse(
        &linkedin_source(),
        &raw(
            "linkedin",
            "https://www.linkedin.com/authwall",
            "<html><body><form>Sign in to continue</form></body></html>".to_string(),
        ),
    )?;
    assert!(page.candidates.is_empty());
    assert_eq!(page.dropped, 0);
    Ok(())
}
