use browser::{
    BrowserDriver, BrowserError, InterceptionAdapter, PageCookie, PageDriver, PageFunction,
};
use chrono::{DateTime, Utc};
use proxy::ProxyAuth;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 PageCrawler";

pub const START_LABEL: &str = "START";
pub const FOLLOWED_LABEL: &str = "FOLLOWED";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Browser failure: {0}")]
    Browser(#[from] BrowserError),
}

/// One unit of crawl work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub label: String,
    pub depth: u32,
}

impl CrawlRequest {
    pub fn seed(url: impl Into<String>, label: Option<String>, depth: Option<u32>) -> Self {
        Self {
            url: url.into(),
            label: label
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| START_LABEL.to_string()),
            depth: depth.unwrap_or(0),
        }
    }

    /// A link discovered on `parent`'s page, one hop deeper.
    pub fn follow(parent: &CrawlRequest, url: impl Into<String>) -> Self {
        let label = if parent.label.is_empty() {
            FOLLOWED_LABEL.to_string()
        } else {
            parent.label.clone()
        };

        Self {
            url: url.into(),
            label,
            depth: parent.depth + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub trace: Option<String>,
}

impl From<&BrowserError> for ErrorInfo {
    fn from(error: &BrowserError) -> Self {
        Self {
            message: error.to_string(),
            trace: Some(format!("{:?}", error)),
        }
    }
}

/// The record produced for every processed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub loaded_url: String,
    pub requested_at: DateTime<Utc>,
    pub label: String,
    pub extraction_result: serde_json::Value,
    pub response_status: Option<u16>,
    pub proxy: Option<String>,
    pub cookies: Vec<PageCookie>,
    pub depth: u32,
    pub error_info: Option<ErrorInfo>,
}

impl PageResult {
    fn pending(request: &CrawlRequest, proxy: Option<String>) -> Self {
        Self {
            loaded_url: request.url.clone(),
            requested_at: Utc::now(),
            label: request.label.clone(),
            extraction_result: serde_json::Value::Null,
            response_status: None,
            proxy,
            cookies: Vec::new(),
            depth: request.depth,
            error_info: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_info.is_some()
    }
}

/// Result of a best-effort step: either it worked, or it failed in a way the
/// page can live with and a fallback value stands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Completed(T),
    Recovered { fallback: T, reason: String },
}

impl<T> StepOutcome<T> {
    pub fn into_value(self) -> T {
        match self {
            StepOutcome::Completed(value) => value,
            StepOutcome::Recovered { fallback, .. } => fallback,
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, StepOutcome::Recovered { .. })
    }
}

/// Runs a step whose failure is tolerated unless it takes the browser down.
pub fn best_effort<T: Default>(
    step: &str,
    url: &str,
    result: Result<T, BrowserError>,
) -> Result<StepOutcome<T>, BrowserError> {
    match result {
        Ok(value) => Ok(StepOutcome::Completed(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!("Failed to {} on {}: {}", step, url, e);
            Ok(StepOutcome::Recovered {
                fallback: T::default(),
                reason: e.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agent: String,
    pub navigation_timeout: Duration,
    pub settle_delay: Duration,
    pub link_selector: Option<String>,
    pub max_depth: u32,
    /// Proxy the browser was launched with, copied into every result.
    pub proxy: Option<String>,
    pub proxy_auth: Option<ProxyAuth>,
    pub page_function: PageFunction,
    pub interception: Option<InterceptionAdapter>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout: Duration::from_millis(30_000),
            settle_delay: Duration::from_millis(3_000),
            link_selector: None,
            max_depth: 1,
            proxy: None,
            proxy_auth: None,
            page_function: PageFunction::builtin(),
            interception: None,
        }
    }
}

/// Output of one page session: the record plus the raw hrefs found on it.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub result: PageResult,
    pub discovered: Vec<String>,
}

/// Runs a blocking driver call. On a multi-threaded runtime the worker hands
/// its other tasks off first; a current-thread runtime has nowhere to hand
/// them, so the call runs inline.
fn blocking<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

/// Closes the page on every exit path.
struct PageGuard<P: PageDriver> {
    page: P,
    url: String,
}

impl<P: PageDriver> Drop for PageGuard<P> {
    fn drop(&mut self) {
        if let Err(e) = self.page.close() {
            warn!("Failed to close page for {}: {}", self.url, e);
        }
    }
}

pub struct PageSessionRunner {
    config: SessionConfig,
}

impl PageSessionRunner {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    fn follows_links(&self, request: &CrawlRequest) -> Option<&str> {
        self.config
            .link_selector
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .filter(|_| request.depth < self.config.max_depth)
    }

    /// Processes one request on a fresh page. Per-page failures end up in the
    /// result's `error_info`; only failures that take the browser down are
    /// returned as errors.
    pub async fn run<B: BrowserDriver>(
        &self,
        browser: &B,
        request: &CrawlRequest,
    ) -> Result<PageOutcome, SessionError> {
        let guard = PageGuard {
            page: blocking(|| browser.new_page())?,
            url: request.url.clone(),
        };

        let mut result = PageResult::pending(request, self.config.proxy.clone());

        let discovered = match self.visit(&guard.page, request, &mut result).await {
            Ok(links) => links,
            Err(e) if e.is_fatal() => {
                error!("Browser failure while crawling {}: {}", request.url, e);
                return Err(e.into());
            }
            Err(e) => {
                error!("Error crawling {}: {}", request.url, e);
                result.error_info = Some(ErrorInfo::from(&e));
                Vec::new()
            }
        };

        drop(guard);
        Ok(PageOutcome { result, discovered })
    }

    async fn visit<P: PageDriver>(
        &self,
        page: &P,
        request: &CrawlRequest,
        result: &mut PageResult,
    ) -> Result<Vec<String>, BrowserError> {
        let url = request.url.as_str();

        best_effort("set user agent", url, page.set_user_agent(&self.config.user_agent))?;

        if let Some(auth) = &self.config.proxy_auth {
            best_effort(
                "apply proxy credentials",
                url,
                page.authenticate(&auth.username, &auth.password),
            )?;
        }

        if let Some(adapter) = &self.config.interception {
            best_effort(
                "enable request interception",
                url,
                page.enable_interception(adapter.clone()),
            )?;
        }

        info!("Navigating to {}", url);
        let navigation = blocking(|| page.navigate(url, self.config.navigation_timeout))?;
        result.loaded_url = navigation.url;
        result.response_status = navigation.status;

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let context = serde_json::json!({
            "url": result.loaded_url,
            "label": request.label,
            "depth": request.depth,
        });
        result.extraction_result =
            blocking(|| page.evaluate(&self.config.page_function, &context))?;

        let links = match self.follows_links(request) {
            Some(selector) => {
                best_effort("extract links", url, blocking(|| page.collect_hrefs(selector)))?
                    .into_value()
            }
            None => Vec::new(),
        };
        debug!("Found {} links on {}", links.len(), url);

        result.cookies = best_effort("read cookies", url, blocking(|| page.cookies()))?.into_value();

        Ok(links)
    }
}
