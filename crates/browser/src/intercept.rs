//! Request interception: the policy seam callers plug into and the adapter
//! the drivers consult for every paused request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::BrowserError;

/// Normalized view of a request issued by a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedRequest {
    pub url: String,
    pub method: String,
    /// Lowercase resource type (`document`, `image`, `stylesheet`, ...).
    pub resource_type: String,
    pub headers: BTreeMap<String, String>,
}

impl InterceptedRequest {
    pub fn new(url: &str, resource_type: &str) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            resource_type: resource_type.to_string(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub body: String,
}

fn default_status() -> u16 {
    200
}

impl InterceptResponse {
    /// Headers as sent to the browser, with `Content-Type` added from
    /// `content_type` unless already present.
    pub fn header_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(content_type) = &self.content_type {
            let present = entries
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
            if !present {
                entries.push(("Content-Type".to_string(), content_type.clone()));
            }
        }

        entries
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InterceptDecision {
    #[default]
    Continue,
    Abort,
    RespondWith(InterceptResponse),
}

/// Decides the fate of every request a page issues.
pub trait InterceptPolicy: Send + Sync {
    fn decide(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptDecision>;
}

impl<F> InterceptPolicy for F
where
    F: Fn(&InterceptedRequest) -> anyhow::Result<InterceptDecision> + Send + Sync,
{
    fn decide(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptDecision> {
        self(request)
    }
}

/// Wraps a policy so that a failing or panicking policy lets the request
/// through instead of stalling the page.
#[derive(Clone)]
pub struct InterceptionAdapter {
    policy: Arc<dyn InterceptPolicy>,
}

impl InterceptionAdapter {
    pub fn new(policy: Arc<dyn InterceptPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_policy<P: InterceptPolicy + 'static>(policy: P) -> Self {
        Self::new(Arc::new(policy))
    }

    pub fn decide(&self, request: &InterceptedRequest) -> InterceptDecision {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.policy.decide(request)));

        match outcome {
            Ok(Ok(decision)) => {
                debug!("Intercept {} {} -> {:?}", request.method, request.url, decision);
                decision
            }
            Ok(Err(e)) => {
                warn!("Intercept error, continuing request {}: {:#}", request.url, e);
                InterceptDecision::Continue
            }
            Err(_) => {
                warn!("Intercept policy panicked, continuing request {}", request.url);
                InterceptDecision::Continue
            }
        }
    }
}

impl std::fmt::Debug for InterceptionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionAdapter").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubRule {
    pub url_contains: String,
    pub response: InterceptResponse,
}

/// Declarative policy: block by resource type, URL suffix or domain, and
/// answer matching URLs with canned responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePolicy {
    #[serde(default)]
    pub block_resource_types: Vec<String>,
    #[serde(default)]
    pub block_url_suffixes: Vec<String>,
    #[serde(default)]
    pub block_domains: Vec<String>,
    #[serde(default)]
    pub stubs: Vec<StubRule>,
}

impl RulePolicy {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BrowserError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| BrowserError::InvalidRules(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| BrowserError::InvalidRules(format!("{}: {}", path.display(), e)))
    }

    fn is_blocked(&self, request: &InterceptedRequest) -> bool {
        if self
            .block_resource_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&request.resource_type))
        {
            return true;
        }

        let path = url::Url::parse(&request.url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| request.url.to_ascii_lowercase());
        if self
            .block_url_suffixes
            .iter()
            .any(|s| path.ends_with(&s.to_ascii_lowercase()))
        {
            return true;
        }

        self.block_domains.iter().any(|d| request.url.contains(d.as_str()))
    }
}

impl InterceptPolicy for RulePolicy {
    fn decide(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptDecision> {
        if let Some(stub) = self
            .stubs
            .iter()
            .find(|s| request.url.contains(s.url_contains.as_str()))
        {
            return Ok(InterceptDecision::RespondWith(stub.response.clone()));
        }

        if self.is_blocked(request) {
            return Ok(InterceptDecision::Abort);
        }

        Ok(InterceptDecision::Continue)
    }
}
