use base64::Engine;
use headless_chrome::browser::tab::RequestPausedDecision;
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::protocol::cdp::Fetch::{
    FailRequest, FulfillRequest, HeaderEntry, RequestId, RequestPattern, RequestStage,
};
use headless_chrome::protocol::cdp::Network::ErrorReason;
use headless_chrome::{Browser as HeadlessBrowser, LaunchOptions, Tab};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::intercept::{InterceptDecision, InterceptedRequest, InterceptionAdapter};
use crate::page_function::{decode_envelope, PageFunction};
use crate::{BrowserDriver, BrowserError, LaunchConfig, Navigation, PageCookie, PageDriver};

const RESPONSE_STATUS_SCRIPT: &str = "(() => { \
    const entry = performance.getEntriesByType('navigation')[0]; \
    return entry && entry.responseStatus ? entry.responseStatus : null; })()";

/// Headless Chrome launched once per run.
pub struct ChromeBrowser {
    browser: Mutex<Option<HeadlessBrowser>>,
}

impl ChromeBrowser {
    pub fn launch(config: &LaunchConfig) -> Result<Self, BrowserError> {
        let args: Vec<&OsStr> = config.args.iter().map(OsStr::new).collect();

        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some(config.window_size))
            .idle_browser_timeout(Duration::from_secs(config.idle_timeout_secs))
            .args(args)
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let browser = HeadlessBrowser::new(launch_options)
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        info!(
            "Browser launched successfully (headless: {}, args: {:?})",
            config.headless, config.args
        );
        Ok(Self {
            browser: Mutex::new(Some(browser)),
        })
    }
}

impl BrowserDriver for ChromeBrowser {
    type Page = ChromePage;

    fn new_page(&self) -> Result<ChromePage, BrowserError> {
        let guard = self
            .browser
            .lock()
            .map_err(|_| BrowserError::Disconnected("browser lock poisoned".to_string()))?;

        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::Disconnected("browser already closed".to_string()))?;

        let tab = browser
            .new_tab()
            .map_err(|e| classify(e, BrowserError::PageOpenFailed))?;

        Ok(ChromePage {
            tab,
            handles_auth: AtomicBool::new(false),
        })
    }

    fn close(&self) -> Result<(), BrowserError> {
        let mut guard = self
            .browser
            .lock()
            .map_err(|_| BrowserError::Disconnected("browser lock poisoned".to_string()))?;

        // Dropping the handle terminates the chrome process.
        if guard.take().is_some() {
            info!("Browser closed");
        }
        Ok(())
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    handles_auth: AtomicBool,
}

impl ChromePage {
    fn auth_flag(&self) -> Option<bool> {
        self.handles_auth.load(Ordering::SeqCst).then_some(true)
    }

    fn response_status(&self) -> Option<u16> {
        let remote = self.tab.evaluate(RESPONSE_STATUS_SCRIPT, false).ok()?;
        remote
            .value
            .and_then(|v| v.as_u64())
            .and_then(|status| u16::try_from(status).ok())
    }
}

impl PageDriver for ChromePage {
    fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError> {
        self.tab
            .set_user_agent(user_agent, None, None)
            .map_err(|e| classify(e, BrowserError::NavigationError))?;
        Ok(())
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<(), BrowserError> {
        self.tab
            .authenticate(Some(username.to_string()), Some(password.to_string()))
            .map_err(|e| classify(e, BrowserError::NavigationError))?;
        self.tab
            .enable_fetch(None, Some(true))
            .map_err(|e| classify(e, BrowserError::NavigationError))?;
        self.handles_auth.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn enable_interception(&self, adapter: InterceptionAdapter) -> Result<(), BrowserError> {
        let patterns = [RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_Type: None,
            request_stage: Some(RequestStage::Request),
        }];

        self.tab
            .enable_fetch(Some(&patterns[..]), self.auth_flag())
            .map_err(|e| classify(e, BrowserError::NavigationError))?;

        let interceptor = move |_transport: Arc<Transport>,
                                _session_id: SessionId,
                                event: RequestPausedEvent|
              -> RequestPausedDecision {
            let request = to_intercepted_request(&event);
            to_paused_decision(event.params.request_id.clone(), adapter.decide(&request))
        };

        self.tab
            .enable_request_interception(Arc::new(interceptor))
            .map_err(|e| classify(e, BrowserError::NavigationError))?;

        debug!("Request interception enabled");
        Ok(())
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<Navigation, BrowserError> {
        info!("Navigating to: {}", url);

        self.tab.set_default_timeout(timeout);
        self.tab
            .navigate_to(url)
            .map_err(|e| classify(e, BrowserError::NavigationError))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| classify(e, BrowserError::NavigationError))?;

        let navigation = Navigation {
            url: self.tab.get_url(),
            status: self.response_status(),
        };

        debug!("Navigation complete: {:?}", navigation);
        Ok(navigation)
    }

    fn evaluate(
        &self,
        function: &PageFunction,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, BrowserError> {
        let remote = self
            .tab
            .evaluate(&function.invocation(context), true)
            .map_err(|e| classify(e, BrowserError::EvaluationError))?;

        decode_envelope(&remote.value.unwrap_or(serde_json::Value::Null))
    }

    fn collect_hrefs(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let selector_json = serde_json::to_string(selector)
            .map_err(|e| BrowserError::EvaluationError(e.to_string()))?;

        let script = format!(
            "(() => {{ try {{ return JSON.stringify({{ ok: Array.from(document.querySelectorAll({})) \
             .map((el) => el.href) \
             .filter((href) => typeof href === 'string' && href.length > 0) }}); }} \
             catch (e) {{ return JSON.stringify({{ error: String(e) }}); }} }})()",
            selector_json
        );

        let remote = self
            .tab
            .evaluate(&script, false)
            .map_err(|e| classify(e, BrowserError::EvaluationError))?;

        let hrefs = decode_envelope(&remote.value.unwrap_or(serde_json::Value::Null))?;
        serde_json::from_value(hrefs).map_err(|e| BrowserError::EvaluationError(e.to_string()))
    }

    fn cookies(&self) -> Result<Vec<PageCookie>, BrowserError> {
        let cookies = self
            .tab
            .get_cookies()
            .map_err(|e| classify(e, BrowserError::EvaluationError))?;

        Ok(cookies
            .into_iter()
            .map(|c| PageCookie {
                expires: (!c.session && c.expires > 0.0).then(|| c.expires as i64),
                name: c.name,
                value: c.value,
                domain: Some(c.domain),
                path: Some(c.path),
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect())
    }

    fn close(&self) -> Result<(), BrowserError> {
        self.tab
            .close(false)
            .map_err(|e| classify(e, BrowserError::PageOpenFailed))?;
        Ok(())
    }
}

/// Maps a driver error onto our taxonomy; lost connections and timeouts are
/// recognised by message since the driver reports them as opaque errors.
fn classify(error: anyhow::Error, fallback: fn(String) -> BrowserError) -> BrowserError {
    let message = format!("{:#}", error);
    let lower = message.to_ascii_lowercase();

    if lower.contains("connection is closed") || lower.contains("connection closed") {
        BrowserError::Disconnected(message)
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        BrowserError::Timeout(message)
    } else {
        fallback(message)
    }
}

fn to_intercepted_request(event: &RequestPausedEvent) -> InterceptedRequest {
    let params = &event.params;

    let resource_type = serde_json::to_value(&params.resource_Type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();

    let headers = match serde_json::to_value(&params.request.headers) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| {
                let value = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                (name, value)
            })
            .collect(),
        _ => BTreeMap::new(),
    };

    InterceptedRequest {
        url: params.request.url.clone(),
        method: params.request.method.clone(),
        resource_type,
        headers,
    }
}

fn to_paused_decision(request_id: RequestId, decision: InterceptDecision) -> RequestPausedDecision {
    match decision {
        InterceptDecision::Continue => RequestPausedDecision::Continue(None),
        InterceptDecision::Abort => RequestPausedDecision::Fail(FailRequest {
            request_id,
            error_reason: ErrorReason::Aborted,
        }),
        InterceptDecision::RespondWith(response) => {
            let headers = response
                .header_entries()
                .into_iter()
                .map(|(name, value)| HeaderEntry { name, value })
                .collect();

            RequestPausedDecision::Fulfill(FulfillRequest {
                request_id,
                response_code: u32::from(response.status),
                response_headers: Some(headers),
                binary_response_headers: None,
                body: Some(base64::engine::general_purpose::STANDARD.encode(response.body.as_bytes())),
                response_phrase: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::InterceptResponse;

    #[test]
    fn test_classify_connection_loss_and_timeouts() {
        let closed = classify(anyhow::anyhow!("Unable to make method calls because underlying connection is closed"), BrowserError::NavigationError);
        assert!(matches!(closed, BrowserError::Disconnected(_)));
        assert!(closed.is_fatal());

        let waited = classify(anyhow::anyhow!("The event waited for never came"), BrowserError::NavigationError);
        assert!(matches!(waited, BrowserError::Timeout(_)));
        assert!(!waited.is_fatal());

        let timed_out = classify(anyhow::anyhow!("Navigation Timed Out"), BrowserError::EvaluationError);
        assert!(matches!(timed_out, BrowserError::Timeout(_)));
    }

    #[test]
    fn test_classify_fallback_keeps_message() {
        let other = classify(anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"), BrowserError::NavigationError);
        assert!(matches!(&other, BrowserError::NavigationError(m) if m == "net::ERR_NAME_NOT_RESOLVED"));
        assert!(!other.is_fatal());

        let tab = classify(anyhow::anyhow!("target crashed"), BrowserError::PageOpenFailed);
        assert!(matches!(tab, BrowserError::PageOpenFailed(_)));
        assert!(tab.is_fatal());
    }

    #[test]
    fn test_continue_decision() {
        match to_paused_decision("req-1".to_string(), InterceptDecision::Continue) {
            RequestPausedDecision::Continue(overrides) => assert!(overrides.is_none()),
            _ => panic!("continue must resume the request unchanged"),
        }
    }

    #[test]
    fn test_abort_decision() {
        match to_paused_decision("req-2".to_string(), InterceptDecision::Abort) {
            RequestPausedDecision::Fail(fail) => {
                assert_eq!(fail.request_id, "req-2");
                assert!(matches!(fail.error_reason, ErrorReason::Aborted));
            }
            _ => panic!("abort must fail the request"),
        }
    }

    #[test]
    fn test_respond_with_decision() {
        let response = InterceptResponse {
            status: 404,
            headers: BTreeMap::from([("X-Stub".to_string(), "1".to_string())]),
            content_type: Some("text/plain".to_string()),
            body: "gone".to_string(),
        };

        match to_paused_decision("req-3".to_string(), InterceptDecision::RespondWith(response)) {
            RequestPausedDecision::Fulfill(fulfill) => {
                assert_eq!(fulfill.request_id, "req-3");
                assert_eq!(fulfill.response_code, 404);

                let headers = fulfill.response_headers.unwrap_or_default();
                let pairs: Vec<(&str, &str)> = headers
                    .iter()
                    .map(|h| (h.name.as_str(), h.value.as_str()))
                    .collect();
                assert!(pairs.contains(&("X-Stub", "1")));
                assert!(pairs.contains(&("Content-Type", "text/plain")));

                let body = base64::engine::general_purpose::STANDARD
                    .decode(fulfill.body.unwrap_or_default())
                    .unwrap();
                assert_eq!(body, b"gone");
            }
            _ => panic!("respond-with must fulfill the request"),
        }
    }
}
