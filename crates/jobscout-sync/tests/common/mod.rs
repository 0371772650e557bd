#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use jobscout_core::{ParserKind, Politeness, SearchQuery, SourceConfig, StrategyKind};
use jobscout_fetch::{BrowserLauncher, FetchError, FetchStrategy, RawContent};

pub fn source(id: &str) -> SourceConfig {
    let mut source = SourceConfig::new(
        id,
        format!("https://{id}.example/positions.json?q={{keywords}}&page={{page}}"),
        ParserKind::Github,
    );
    source.politeness = Politeness::immediate();
    source
}

pub fn paged_source(id: &str, pages: u32) -> SourceConfig {
    let mut source = source(id);
    source.pages = pages;
    source
}

/// A GitHub-style JSON page; each entry is `(title, company)` and gets a url derived from the title.
pub fn positions(entries: &[(&str, &str)]) -> String {
    let items = entries
        .iter()
        .map(|(title, company)| {
            format!(
                r#"{{"title":"{title}","company":"{company}","location":"Remote","description":"{title} working with Python and Docker","url":"https://jobs.example/{}"}}"#,
                title.to_lowercase().replace(' ', "-")
            )
        })
        .collect::<Vec<_>>();
    format!("[{}]", items.join(","))
}

pub fn timeout(source_id: &str) -> FetchError {
    FetchError::Timeout {
        url: format!("https://{source_id}.example"),
    }
}

/// Replays canned bodies per `(source_id, page)`. Unscripted pages time out.
pub struct ScriptedFetcher {
    kind: StrategyKind,
    script: Mutex<HashMap<(String, u32), Result<String, FetchError>>>,
    calls: Mutex<Vec<(String, u32)>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn http() -> Self {
        Self::new(StrategyKind::Http)
    }

    pub fn page(self, source_id: &str, page: u32, body: String) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert((source_id.to_string(), page), Ok(body));
        self
    }

    pub fn fail(self, source_id: &str, page: u32, err: FetchError) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert((source_id.to_string(), page), Err(err));
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered request urls, in call order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchStrategy for ScriptedFetcher {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn fetch(&self, source: &SourceConfig, query: &SearchQuery) -> Result<RawContent, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((source.source_id.clone(), query.page));
        self.urls.lock().unwrap().push(source.render_url(query));
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get(&(source.source_id.clone(), query.page))
            .cloned()
            .unwrap_or_else(|| Err(timeout(&source.source_id)));
        scripted.map(|body| RawContent {
            source_id: source.source_id.clone(),
            url: source.render_url(query),
            body,
            fetched_at: Utc::now(),
            strategy: self.kind,
        })
    }
}

/// Hands out a prepared browser strategy, or fails like a missing driver.
pub struct StubLauncher {
    browser: Option<Arc<dyn FetchStrategy>>,
    pub launches: AtomicUsize,
}

impl StubLauncher {
    pub fn working(browser: Arc<dyn FetchStrategy>) -> Self {
        Self {
            browser: Some(browser),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn broken() -> Self {
        Self {
            browser: None,
            launches: AtomicUsize::new(0),
        }
    }
}

impl BrowserLauncher for StubLauncher {
    fn launch(&self) -> Result<Arc<dyn FetchStrategy>, FetchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.browser
            .clone()
            .ok_or_else(|| FetchError::DriverInitError("chrome binary not found".to_string()))
    }
}
