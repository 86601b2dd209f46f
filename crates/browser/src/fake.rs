//! Scripted in-memory browser for exercising crawl logic without Chrome.
//!
//! Pages are keyed by the URL they are navigated to. Links are answered by
//! running the CSS selector over the page's HTML fixture, so selectors behave
//! as they would in a real document.

use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::intercept::{InterceptDecision, InterceptedRequest, InterceptionAdapter};
use crate::{BrowserDriver, BrowserError, Navigation, PageCookie, PageDriver, PageFunction};

/// How a scripted navigation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationFailure {
    Unreachable(String),
    Timeout,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct FakePage {
    pub final_url: Option<String>,
    pub status: Option<u16>,
    pub html: String,
    pub extraction: Option<serde_json::Value>,
    pub extraction_error: Option<String>,
    pub navigation_error: Option<NavigationFailure>,
    pub link_error: Option<String>,
    pub cookie_error: Option<String>,
    pub cookies: Vec<PageCookie>,
}

impl FakePage {
    pub fn html(html: impl Into<String>) -> Self {
        Self {
            final_url: None,
            status: Some(200),
            html: html.into(),
            extraction: None,
            extraction_error: None,
            navigation_error: None,
            link_error: None,
            cookie_error: None,
            cookies: Vec::new(),
        }
    }

    /// A page whose body is nothing but anchors to `links`.
    pub fn linking_to(links: &[&str]) -> Self {
        let anchors: String = links
            .iter()
            .map(|l| format!("<a href=\"{}\">{}</a>", l, l))
            .collect();
        Self::html(format!(
            "<html><head><title>Links</title></head><body>{}</body></html>",
            anchors
        ))
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn redirect_to(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }

    pub fn with_extraction(mut self, value: serde_json::Value) -> Self {
        self.extraction = Some(value);
        self
    }

    pub fn failing_extraction(mut self, message: &str) -> Self {
        self.extraction_error = Some(message.to_string());
        self
    }

    pub fn failing_navigation(mut self, failure: NavigationFailure) -> Self {
        self.navigation_error = Some(failure);
        self
    }

    pub fn failing_links(mut self, message: &str) -> Self {
        self.link_error = Some(message.to_string());
        self
    }

    pub fn failing_cookies(mut self, message: &str) -> Self {
        self.cookie_error = Some(message.to_string());
        self
    }

    pub fn with_cookie(mut self, cookie: PageCookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    fn title(&self) -> String {
        let document = Html::parse_document(&self.html);
        Selector::parse("title")
            .ok()
            .and_then(|s| document.select(&s).next().map(|t| t.text().collect()))
            .unwrap_or_default()
    }
}

/// Everything the fake observed, in call order.
#[derive(Debug, Clone, Default)]
pub struct FakeLog {
    pub pages_opened: usize,
    pub pages_closed: usize,
    pub browser_closed: usize,
    pub navigations: Vec<String>,
    pub user_agents: Vec<String>,
    pub credentials: Vec<(String, String)>,
    pub interception_enabled: usize,
    pub decisions: Vec<(String, InterceptDecision)>,
    pub evaluations: Vec<serde_json::Value>,
    pub link_queries: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Arc<HashMap<String, FakePage>>,
    log: Arc<Mutex<FakeLog>>,
    open_limit: Option<usize>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, page: FakePage) -> Self {
        Arc::make_mut(&mut self.pages).insert(url.to_string(), page);
        self
    }

    /// Fails every `new_page` call after `limit` pages were opened.
    pub fn failing_after(mut self, limit: usize) -> Self {
        self.open_limit = Some(limit);
        self
    }

    pub fn log(&self) -> FakeLog {
        lock(&self.log).clone()
    }
}

fn lock(log: &Mutex<FakeLog>) -> MutexGuard<'_, FakeLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BrowserDriver for FakeBrowser {
    type Page = FakeTab;

    fn new_page(&self) -> Result<FakeTab, BrowserError> {
        let mut log = lock(&self.log);
        if let Some(limit) = self.open_limit {
            if log.pages_opened >= limit {
                return Err(BrowserError::PageOpenFailed("fake browser crashed".to_string()));
            }
        }
        log.pages_opened += 1;

        Ok(FakeTab {
            pages: Arc::clone(&self.pages),
            log: Arc::clone(&self.log),
            current: Mutex::new(None),
            adapter: Mutex::new(None),
        })
    }

    fn close(&self) -> Result<(), BrowserError> {
        lock(&self.log).browser_closed += 1;
        Ok(())
    }
}

pub struct FakeTab {
    pages: Arc<HashMap<String, FakePage>>,
    log: Arc<Mutex<FakeLog>>,
    current: Mutex<Option<(String, FakePage)>>,
    adapter: Mutex<Option<InterceptionAdapter>>,
}

impl FakeTab {
    fn current(&self) -> Result<(String, FakePage), BrowserError> {
        self.current
            .lock()
            .map_err(|_| BrowserError::EvaluationError("page state poisoned".to_string()))?
            .clone()
            .ok_or_else(|| BrowserError::EvaluationError("no document loaded".to_string()))
    }
}

impl PageDriver for FakeTab {
    fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError> {
        lock(&self.log).user_agents.push(user_agent.to_string());
        Ok(())
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<(), BrowserError> {
        lock(&self.log)
            .credentials
            .push((username.to_string(), password.to_string()));
        Ok(())
    }

    fn enable_interception(&self, adapter: InterceptionAdapter) -> Result<(), BrowserError> {
        lock(&self.log).interception_enabled += 1;
        if let Ok(mut slot) = self.adapter.lock() {
            *slot = Some(adapter);
        }
        Ok(())
    }

    fn navigate(&self, url: &str, _timeout: Duration) -> Result<Navigation, BrowserError> {
        lock(&self.log).navigations.push(url.to_string());

        let adapter = self.adapter.lock().ok().and_then(|a| a.clone());
        let decision = adapter.map(|adapter| {
            let decision = adapter.decide(&InterceptedRequest::new(url, "document"));
            lock(&self.log)
                .decisions
                .push((url.to_string(), decision.clone()));
            decision
        });

        let page = match decision {
            Some(InterceptDecision::Abort) => {
                return Err(BrowserError::NavigationError(format!(
                    "net::ERR_FAILED at {}",
                    url
                )))
            }
            Some(InterceptDecision::RespondWith(response)) => {
                FakePage::html(response.body).with_status(response.status)
            }
            _ => self.pages.get(url).cloned().ok_or_else(|| {
                BrowserError::NavigationError(format!("net::ERR_NAME_NOT_RESOLVED at {}", url))
            })?,
        };

        if let Some(failure) = &page.navigation_error {
            return Err(match failure {
                NavigationFailure::Unreachable(reason) => {
                    BrowserError::NavigationError(format!("{} at {}", reason, url))
                }
                NavigationFailure::Timeout => {
                    BrowserError::Timeout(format!("navigation to {} timed out", url))
                }
                NavigationFailure::Disconnected => {
                    BrowserError::Disconnected("browser process exited".to_string())
                }
            });
        }

        let final_url = page.final_url.clone().unwrap_or_else(|| url.to_string());
        let navigation = Navigation {
            url: final_url.clone(),
            status: page.status,
        };

        if let Ok(mut current) = self.current.lock() {
            *current = Some((final_url, page));
        }
        Ok(navigation)
    }

    fn evaluate(
        &self,
        _function: &PageFunction,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, BrowserError> {
        lock(&self.log).evaluations.push(context.clone());
        let (_, page) = self.current()?;

        if let Some(message) = &page.extraction_error {
            return Err(BrowserError::EvaluationError(message.clone()));
        }

        Ok(page.extraction.clone().unwrap_or_else(|| {
            serde_json::json!({
                "url": context.get("url").cloned().unwrap_or_default(),
                "label": context.get("label").cloned().unwrap_or_default(),
                "title": page.title(),
            })
        }))
    }

    fn collect_hrefs(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        lock(&self.log).link_queries.push(selector.to_string());
        let (base, page) = self.current()?;

        if let Some(message) = &page.link_error {
            return Err(BrowserError::EvaluationError(message.clone()));
        }

        let selector = Selector::parse(selector)
            .map_err(|e| BrowserError::EvaluationError(format!("{:?}", e)))?;
        let base = url::Url::parse(&base).ok();
        let document = Html::parse_document(&page.html);

        Ok(document
            .select(&selector)
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| match &base {
                Some(base) => base.join(href).ok().map(|u| u.to_string()),
                None => Some(href.to_string()),
            })
            .collect())
    }

    fn cookies(&self) -> Result<Vec<PageCookie>, BrowserError> {
        let (_, page) = self.current()?;
        match &page.cookie_error {
            Some(message) => Err(BrowserError::EvaluationError(message.clone())),
            None => Ok(page.cookies.clone()),
        }
    }

    fn close(&self) -> Result<(), BrowserError> {
        lock(&self.log).pages_closed += 1;
        Ok(())
    }
}
