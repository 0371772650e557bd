//! Fetch strategies: one retrieval attempt per call, over plain HTTP or a headless browser.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use headless_chrome::{Browser, LaunchOptions};
use jobscout_core::{Politeness, SearchQuery, SourceConfig, StrategyKind};
use reqwest::header::{ACCEPT, REFERER, USER_AGENT};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobscout-fetch";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.9,*/*;q=0.8";
const SEARCH_REFERER: &str = "https://www.google.com/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpError { status: u16, url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("browser driver unavailable: {0}")]
    DriverInitError(String),
    #[error("browser render failed for {url}: {message}")]
    Render { url: String, message: String },
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn fetch(&self, source: &SourceConfig, query: &SearchQuery) -> Result<RawContent, FetchError>;
}

/// Starts a browser-backed strategy. Blocking; callers run it off the async executor.
pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Arc<dyn FetchStrategy>, FetchError>;
}

/// Round-robin cursor over a source's user-agent pool.
#[derive(Debug, Default)]
pub struct UserAgentRotation {
    cursor: AtomicUsize,
}

impl UserAgentRotation {
    pub fn next_for(&self, politeness: &Politeness) -> String {
        let pool = politeness.user_agent_pool();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool[idx].clone()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetchStrategy {
    client: reqwest::Client,
    agents: UserAgentRotation,
}

impl HttpFetchStrategy {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            agents: UserAgentRotation::default(),
        })
    }
}

#[async_trait]
impl FetchStrategy for HttpFetchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Http
    }

    async fn fetch(&self, source: &SourceConfig, query: &SearchQuery) -> Result<RawContent, FetchError> {
        let url = source.render_url(query);
        let user_agent = self.agents.next_for(&source.politeness);
        let span = info_span!("http_fetch", source_id = %source.source_id, page = query.page, url = %url);

        async {
            let resp = self
                .client
                .get(&url)
                .header(USER_AGENT, user_agent)
                .header(ACCEPT, ACCEPT_HTML)
                .header(REFERER, SEARCH_REFERER)
                .send()
                .await
                .map_err(|e| classify_reqwest_error(&url, &e))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpError {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|e| classify_reqwest_error(&final_url, &e))?;
            debug!(bytes = body.len(), "fetched page");

            Ok(RawContent {
                source_id: source.source_id.clone(),
                url: final_url,
                body,
                fetched_at: Utc::now(),
                strategy: StrategyKind::Http,
            })
        }
        .instrument(span)
        .await
    }
}

/// Launches headless Chrome. With no explicit path the binary is auto-resolved.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub timeout: Duration,
}

impl Default for ChromeLauncher {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Arc<dyn FetchStrategy>, FetchError> {
        let options = LaunchOptions::default_builder()
            .headless(self.headless)
            .sandbox(false)
            .window_size(Some((1920, 1080)))
            .path(self.chrome_path.clone())
            .build()
            .map_err(|e| FetchError::DriverInitError(e.to_string()))?;
        let browser = Browser::new(options).map_err(|e| FetchError::DriverInitError(e.to_string()))?;
        Ok(Arc::new(BrowserFetchStrategy {
            browser: Arc::new(browser),
            timeout: self.timeout,
            agents: UserAgentRotation::default(),
        }))
    }
}

pub struct BrowserFetchStrategy {
    browser: Arc<Browser>,
    timeout: Duration,
    agents: UserAgentRotation,
}

fn render_error(url: &str, message: String) -> FetchError {
    if message.to_ascii_lowercase().contains("timeout") || message.to_ascii_lowercase().contains("timed out") {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Render {
            url: url.to_string(),
            message,
        }
    }
}

#[async_trait]
impl FetchStrategy for BrowserFetchStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Browser
    }

    async fn fetch(&self, source: &SourceConfig, query: &SearchQuery) -> Result<RawContent, FetchError> {
        let url = source.render_url(query);
        let user_agent = self.agents.next_for(&source.politeness);
        let browser = Arc::clone(&self.browser);
        let timeout = self.timeout;
        let nav_url = url.clone();
        let span = info_span!("browser_fetch", source_id = %source.source_id, page = query.page, url = %url);

        let rendered = tokio::task::spawn_blocking(move || -> Result<String, String> {
            let tab = browser.new_tab().map_err(|e| e.to_string())?;
            tab.set_default_timeout(timeout);
            let rendered = (|| {
                tab.set_user_agent(&user_agent, None, None)?;
                tab.navigate_to(&nav_url)?;
                tab.wait_until_navigated()?;
                tab.get_content()
            })()
            .map_err(|e| e.to_string());
            // Tabs left open pile up in the shared browser.
            if let Err(err) = tab.close(true) {
                debug!(url = %nav_url, error = %err, "closing tab failed");
            }
            rendered
        })
        .instrument(span)
        .await
        .map_err(|e| render_error(&url, e.to_string()))?;

        let body = rendered.map_err(|message| render_error(&url, message))?;
        Ok(RawContent {
            source_id: source.source_id.clone(),
            url,
            body,
            fetched_at: Utc::now(),
            strategy: StrategyKind::Browser,
        })
    }
}
