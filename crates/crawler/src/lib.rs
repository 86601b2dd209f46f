use browser::{BrowserDriver, BrowserError};
use indexmap::IndexSet;
use session::{PageSessionRunner, SessionConfig, SessionError};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use session::{CrawlRequest, PageResult};

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Crawl requires a non-empty list of requests")]
    EmptyInput,
    #[error("Crawler already ran")]
    AlreadyRan,
    #[error("Browser failure: {0}")]
    Browser(#[from] BrowserError),
}

impl From<SessionError> for CrawlerError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Browser(e) => CrawlerError::Browser(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_depth: u32,
    /// Caps how many raw candidates of one page are considered.
    pub max_links_per_page: Option<usize>,
    pub session: SessionConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: 1,
            max_links_per_page: None,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Idle,
    Running,
    Draining,
    Done,
}

/// Pending requests plus the set of URLs ever accepted into them.
#[derive(Debug, Default)]
pub struct Frontier {
    queue: VecDeque<CrawlRequest>,
    visited: IndexSet<String>,
    processed: HashSet<String>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `request` at the tail unless its URL is empty or was accepted
    /// before. Acceptance marks the URL visited.
    pub fn accept(&mut self, request: CrawlRequest) -> bool {
        if request.url.is_empty() || !self.visited.insert(request.url.clone()) {
            return false;
        }
        self.queue.push_back(request);
        true
    }

    /// Turns the hrefs found on `parent`'s page into follow-up requests.
    /// Returns how many were enqueued.
    pub fn follow_links(
        &mut self,
        parent: &CrawlRequest,
        candidates: Vec<String>,
        max_depth: u32,
        max_links_per_page: Option<usize>,
    ) -> usize {
        if parent.depth >= max_depth {
            return 0;
        }

        let limit = max_links_per_page.unwrap_or(usize::MAX);
        candidates
            .into_iter()
            .take(limit)
            .filter(|url| self.accept(CrawlRequest::follow(parent, url.as_str())))
            .count()
    }

    pub fn pop(&mut self) -> Option<CrawlRequest> {
        self.queue.pop_front()
    }

    /// Records that `url` is being processed; false if it already was.
    pub fn mark_processed(&mut self, url: &str) -> bool {
        self.processed.insert(url.to_string())
    }

    pub fn is_visited(&self, url: &str) -> bool {
        self.visited.contains(url)
    }

    pub fn visited(&self) -> impl Iterator<Item = &str> {
        self.visited.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

type ProgressHook = Box<dyn Fn(&PageResult) + Send + Sync>;

/// Breadth-first crawl over one browser, one page at a time.
pub struct Crawler {
    config: CrawlConfig,
    runner: PageSessionRunner,
    frontier: Frontier,
    state: CrawlState,
    results: Vec<PageResult>,
    progress: Option<ProgressHook>,
}

impl Crawler {
    pub fn new(config: CrawlConfig) -> Self {
        let session = SessionConfig {
            max_depth: config.max_depth,
            ..config.session.clone()
        };

        Self {
            config,
            runner: PageSessionRunner::new(session),
            frontier: Frontier::new(),
            state: CrawlState::Idle,
            results: Vec::new(),
            progress: None,
        }
    }

    /// Called with every result as soon as its page is done.
    pub fn with_progress<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PageResult) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    fn seed(&mut self, seeds: Vec<CrawlRequest>) -> usize {
        let mut accepted = 0;
        for request in seeds {
            if request.depth > self.config.max_depth {
                warn!(
                    "Skipping seed {} at depth {} beyond max depth {}",
                    request.url, request.depth, self.config.max_depth
                );
                continue;
            }
            if self.frontier.accept(request) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Crawls from `seeds` until the frontier is empty and returns one result
    /// per processed request, in processing order.
    pub async fn run<B: BrowserDriver>(
        &mut self,
        browser: &B,
        seeds: Vec<CrawlRequest>,
    ) -> Result<Vec<PageResult>, CrawlerError> {
        if self.state != CrawlState::Idle {
            return Err(CrawlerError::AlreadyRan);
        }
        if seeds.is_empty() {
            return Err(CrawlerError::EmptyInput);
        }

        let seeded = self.seed(seeds);
        info!("Starting crawl with {} seed requests", seeded);
        self.state = CrawlState::Running;

        while let Some(request) = self.frontier.pop() {
            if !self.frontier.mark_processed(&request.url) {
                debug!("Already processed {}, skipping", request.url);
                continue;
            }

            let outcome = match self.runner.run(browser, &request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.state = CrawlState::Done;
                    return Err(e.into());
                }
            };

            if let Some(hook) = &self.progress {
                hook(&outcome.result);
            }
            self.results.push(outcome.result);

            let enqueued = self.frontier.follow_links(
                &request,
                outcome.discovered,
                self.config.max_depth,
                self.config.max_links_per_page,
            );
            debug!(
                "Enqueued {} links from {} ({} pending)",
                enqueued,
                request.url,
                self.frontier.len()
            );
        }

        self.state = CrawlState::Draining;
        let results = std::mem::take(&mut self.results);
        info!(
            "Crawl finished: {} pages processed, {} URLs seen",
            results.len(),
            self.frontier.visited().count()
        );
        self.state = CrawlState::Done;

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser::fake::{FakeBrowser, FakePage, NavigationFailure};
    use browser::{InterceptDecision, InterceptedRequest, InterceptionAdapter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max_depth: u32, selector: Option<&str>) -> CrawlConfig {
        CrawlConfig {
            max_depth,
            max_links_per_page: None,
            session: SessionConfig {
                settle_delay: Duration::ZERO,
                link_selector: selector.map(str::to_string),
                ..SessionConfig::default()
            },
        }
    }

    fn seed(url: &str) -> CrawlRequest {
        CrawlRequest::seed(url, None, None)
    }

    fn urls(results: &[PageResult]) -> Vec<&str> {
        results.iter().map(|r| r.loaded_url.as_str()).collect()
    }

    #[tokio::test]
    async fn test_single_page_without_links() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::linking_to(&["https://b.test/"]));
        let mut crawler = Crawler::new(config(0, None));

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].depth, 0);
        assert_eq!(results[0].label, "START");
        assert_eq!(crawler.state(), CrawlState::Done);
    }

    #[tokio::test]
    async fn test_self_link_is_deduplicated() {
        let browser = FakeBrowser::new()
            .with_page(
                "https://a.test/",
                FakePage::linking_to(&["https://b.test/", "https://a.test/"]),
            )
            .with_page("https://b.test/", FakePage::html("<title>B</title>"));
        let mut crawler = Crawler::new(config(1, Some("a")));

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(urls(&results), vec!["https://a.test/", "https://b.test/"]);
        assert_eq!(results[0].depth, 0);
        assert_eq!(results[1].depth, 1);
        assert_eq!(results[1].label, "START");
    }

    #[tokio::test]
    async fn test_shared_link_processed_once() {
        let browser = FakeBrowser::new()
            .with_page(
                "https://root.test/",
                FakePage::linking_to(&["https://a.test/", "https://b.test/"]),
            )
            .with_page("https://a.test/", FakePage::linking_to(&["https://c.test/"]))
            .with_page("https://b.test/", FakePage::linking_to(&["https://c.test/"]))
            .with_page("https://c.test/", FakePage::html(""));
        let mut crawler = Crawler::new(config(2, Some("a")));

        let results = crawler.run(&browser, vec![seed("https://root.test/")]).await.unwrap();

        let c_results = results
            .iter()
            .filter(|r| r.loaded_url == "https://c.test/")
            .count();
        assert_eq!(c_results, 1);
        assert_eq!(results.len(), 4);
        assert_eq!(browser.log().navigations.len(), results.len());
    }

    #[tokio::test]
    async fn test_depth_gate_and_bfs_order() {
        let browser = FakeBrowser::new()
            .with_page(
                "https://a.test/",
                FakePage::linking_to(&["https://b.test/", "https://c.test/"]),
            )
            .with_page("https://b.test/", FakePage::linking_to(&["https://d.test/"]))
            .with_page("https://c.test/", FakePage::linking_to(&["https://e.test/"]))
            .with_page("https://d.test/", FakePage::linking_to(&["https://f.test/"]))
            .with_page("https://e.test/", FakePage::html(""));
        let mut crawler = Crawler::new(config(2, Some("a")));

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(
            urls(&results),
            vec![
                "https://a.test/",
                "https://b.test/",
                "https://c.test/",
                "https://d.test/",
                "https://e.test/",
            ]
        );
        assert!(results.iter().all(|r| r.depth <= 2));
        // Depth-2 pages are never asked for links.
        assert_eq!(browser.log().link_queries.len(), 3);
        assert!(!crawler.frontier().is_visited("https://f.test/"));
    }

    #[tokio::test]
    async fn test_selector_with_zero_depth_discovers_nothing() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::linking_to(&["https://b.test/"]));
        let mut crawler = Crawler::new(config(0, Some("a")));

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(browser.log().link_queries.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input_fails_fast() {
        let browser = FakeBrowser::new();
        let mut crawler = Crawler::new(config(1, None));

        let err = crawler.run(&browser, Vec::new()).await.unwrap_err();

        assert!(matches!(err, CrawlerError::EmptyInput));
        assert_eq!(browser.log().pages_opened, 0);
        assert_eq!(crawler.state(), CrawlState::Idle);
    }

    #[tokio::test]
    async fn test_seeds_are_deduplicated_and_depth_checked() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::html(""))
            .with_page("https://b.test/", FakePage::html(""));
        let mut crawler = Crawler::new(config(1, None));

        let seeds = vec![
            seed("https://a.test/"),
            seed("https://a.test/"),
            CrawlRequest::seed("", None, None),
            CrawlRequest::seed("https://b.test/", Some("DEEP".to_string()), Some(5)),
        ];
        let results = crawler.run(&browser, seeds).await.unwrap();

        assert_eq!(urls(&results), vec!["https://a.test/"]);
    }

    #[tokio::test]
    async fn test_page_errors_do_not_abort() {
        let browser = FakeBrowser::new()
            .with_page(
                "https://a.test/",
                FakePage::linking_to(&["https://broken.test/", "https://c.test/"]),
            )
            .with_page(
                "https://broken.test/",
                FakePage::html("").failing_navigation(NavigationFailure::Unreachable(
                    "net::ERR_CONNECTION_REFUSED".to_string(),
                )),
            )
            .with_page("https://c.test/", FakePage::html(""));
        let mut crawler = Crawler::new(config(1, Some("a")));

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[1].is_error());
        assert!(results[1].extraction_result.is_null());
        assert!(!results[2].is_error());
    }

    #[tokio::test]
    async fn test_failing_policy_lets_pages_load() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::linking_to(&["https://b.test/"]))
            .with_page("https://b.test/", FakePage::html(""));
        let mut cfg = config(1, Some("a"));
        cfg.session.interception = Some(InterceptionAdapter::from_policy(
            |_: &InterceptedRequest| -> anyhow::Result<InterceptDecision> {
                anyhow::bail!("policy always fails")
            },
        ));
        let mut crawler = Crawler::new(cfg);

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.is_error()));
        let log = browser.log();
        assert_eq!(log.decisions.len(), 2);
        assert!(log
            .decisions
            .iter()
            .all(|(_, d)| *d == InterceptDecision::Continue));
    }

    #[tokio::test]
    async fn test_browser_failure_aborts_run() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::linking_to(&["https://b.test/"]))
            .with_page("https://b.test/", FakePage::html(""))
            .failing_after(1);
        let mut crawler = Crawler::new(config(1, Some("a")));

        let err = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap_err();

        assert!(matches!(err, CrawlerError::Browser(BrowserError::PageOpenFailed(_))));
        assert_eq!(crawler.state(), CrawlState::Done);
    }

    #[tokio::test]
    async fn test_progress_hook_and_single_run() {
        let browser = FakeBrowser::new()
            .with_page("https://a.test/", FakePage::linking_to(&["https://b.test/"]))
            .with_page("https://b.test/", FakePage::html(""));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut crawler = Crawler::new(config(1, Some("a"))).with_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let results = crawler.run(&browser, vec![seed("https://a.test/")]).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), results.len());
        assert_eq!(crawler.frontier().processed_count(), results.len());

        let again = crawler.run(&browser, vec![seed("https://a.test/")]).await;
        assert!(matches!(again, Err(CrawlerError::AlreadyRan)));
    }

    #[test]
    fn test_follow_links_caps_and_filters() {
        let mut frontier = Frontier::new();
        frontier.accept(CrawlRequest {
            url: "https://a.com/".to_string(),
            label: String::new(),
            depth: 0,
        });
        let parent = frontier.pop().unwrap();

        let candidates = vec![
            "https://a.com/".to_string(),
            "https://b.com/".to_string(),
            "https://c.com/".to_string(),
            "https://d.com/".to_string(),
        ];
        let enqueued = frontier.follow_links(&parent, candidates, 1, Some(3));

        assert_eq!(enqueued, 2);
        let first = frontier.pop().unwrap();
        assert_eq!(first.url, "https://b.com/");
        assert_eq!(first.depth, 1);
        assert_eq!(first.label, "FOLLOWED");
        assert_eq!(frontier.pop().unwrap().url, "https://c.com/");
        assert!(frontier.is_empty());
    }

    #[test]
    fn test_follow_links_at_max_depth() {
        let mut frontier = Frontier::new();
        let parent = CrawlRequest::seed("https://x.com/", None, Some(1));

        let enqueued = frontier.follow_links(&parent, vec!["https://a.com/".to_string()], 1, Some(10));

        assert_eq!(enqueued, 0);
        assert!(frontier.is_empty());
        assert!(!frontier.is_visited("https://a.com/"));
    }

    #[test]
    fn test_accept_rejects_empty_and_duplicates() {
        let mut frontier = Frontier::new();
        let parent = CrawlRequest::seed("https://x.com/", None, None);

        let enqueued = frontier.follow_links(
            &parent,
            vec![
                String::new(),
                "https://a.com/".to_string(),
                "https://a.com/".to_string(),
            ],
            3,
            None,
        );

        assert_eq!(enqueued, 1);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier.visited().collect::<Vec<_>>(), vec!["https://a.com/"]);
    }
}
