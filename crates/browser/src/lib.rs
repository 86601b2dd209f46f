use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub mod chrome;
pub mod intercept;
pub mod page_function;

#[cfg(feature = "test-support")]
pub mod fake;

pub use chrome::{ChromeBrowser, ChromePage};
pub use intercept::{
    InterceptDecision, InterceptPolicy, InterceptResponse, InterceptedRequest,
    InterceptionAdapter, RulePolicy, StubRule,
};
pub use page_function::PageFunction;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("Failed to open page: {0}")]
    PageOpenFailed(String),
    #[error("Browser connection lost: {0}")]
    Disconnected(String),
    #[error("Navigation error: {0}")]
    NavigationError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Evaluation error: {0}")]
    EvaluationError(String),
    #[error("Invalid page function: {0}")]
    InvalidScript(String),
    #[error("Invalid interception rules: {0}")]
    InvalidRules(String),
    #[error("Browser error: {0}")]
    BrowserError(#[from] anyhow::Error),
}

impl BrowserError {
    /// Errors that leave the browser unusable for the rest of the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrowserError::LaunchFailed(_)
                | BrowserError::PageOpenFailed(_)
                | BrowserError::Disconnected(_)
        )
    }
}

/// Where a navigation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub url: String,
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub expires: Option<i64>,
}

pub fn create_cookie(name: &str, value: &str, domain: Option<&str>) -> PageCookie {
    PageCookie {
        name: name.to_string(),
        value: value.to_string(),
        domain: domain.map(|d| d.to_string()),
        path: Some("/".to_string()),
        secure: false,
        http_only: false,
        expires: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub idle_timeout_secs: u64,
    pub args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1920, 1080),
            idle_timeout_secs: 300,
            args: Vec::new(),
        }
    }
}

/// A running browser instance pages are opened from.
pub trait BrowserDriver {
    type Page: PageDriver;

    fn new_page(&self) -> Result<Self::Page, BrowserError>;

    fn close(&self) -> Result<(), BrowserError>;
}

/// One page (tab) of a [`BrowserDriver`].
pub trait PageDriver {
    fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError>;

    /// Answers HTTP auth challenges (proxy auth included) with these credentials.
    fn authenticate(&self, username: &str, password: &str) -> Result<(), BrowserError>;

    fn enable_interception(&self, adapter: InterceptionAdapter) -> Result<(), BrowserError>;

    fn navigate(&self, url: &str, timeout: Duration) -> Result<Navigation, BrowserError>;

    fn evaluate(
        &self,
        function: &PageFunction,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, BrowserError>;

    /// Resolved `href` values of every element matching `selector`.
    fn collect_hrefs(&self, selector: &str) -> Result<Vec<String>, BrowserError>;

    fn cookies(&self) -> Result<Vec<PageCookie>, BrowserError>;

    fn close(&self) -> Result<(), BrowserError>;
}

/// Owns a browser for the length of a run and closes it exactly once, either
/// through [`BrowserSession::close`] or when dropped on an error path.
pub struct BrowserSession<B: BrowserDriver> {
    browser: B,
    closed: bool,
}

impl<B: BrowserDriver> BrowserSession<B> {
    pub fn new(browser: B) -> Self {
        Self {
            browser,
            closed: false,
        }
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn close(mut self) -> Result<(), BrowserError> {
        self.closed = true;
        self.browser.close()
    }
}

impl<B: BrowserDriver> Drop for BrowserSession<B> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!("Closing browser from guard");
        if let Err(e) = self.browser.close() {
            warn!("Failed to close browser: {}", e);
        }
    }
}
