use browser::{
    BrowserDriver, BrowserError, BrowserSession, InterceptionAdapter, LaunchConfig, PageFunction,
};
use chrono::Utc;
use crawler::{CrawlConfig, Crawler, CrawlerError};
use exporter::{DatasetFormat, ExportError, Exporter};
use notifier::{NotificationConfig, Notifier, RunSummary};
use proxy::{build_driver_args, ProxySettings};
use serde::{Deserialize, Serialize};
use session::{CrawlRequest, PageResult, SessionConfig, DEFAULT_USER_AGENT};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Input file not found at {0}")]
    InputNotFound(PathBuf),
    #[error("Failed to read input file {path}: {source}")]
    InputRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse JSON at {path}: {source}")]
    InputParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Inputs JSON must be an array. File: {0}")]
    InputNotArray(PathBuf),
    #[error("Crawl requires a non-empty list of requests")]
    EmptyInput,
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Crawler(#[from] CrawlerError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

/// One seed as written in the input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub depth: Option<u32>,
}

impl From<InputRecord> for CrawlRequest {
    fn from(record: InputRecord) -> Self {
        CrawlRequest::seed(record.url, record.label, record.depth)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Used as-is when non-empty; otherwise seeds come from `input_path`.
    pub inputs: Vec<InputRecord>,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub format: String,
    pub proxy_config: PathBuf,
    pub max_depth: u32,
    pub max_links_per_page: Option<usize>,
    pub wait_for: Duration,
    pub navigation_timeout: Duration,
    pub link_selector: Option<String>,
    pub page_function: PageFunction,
    pub interception: Option<InterceptionAdapter>,
    pub user_agent: String,
    pub headless: bool,
    pub notification: NotificationConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            input_path: PathBuf::from("data/inputs.json"),
            output_path: PathBuf::from("data/results.json"),
            format: DatasetFormat::default().to_string(),
            proxy_config: PathBuf::from("config/proxy_settings.json"),
            max_depth: 1,
            max_links_per_page: None,
            wait_for: Duration::from_millis(3000),
            navigation_timeout: Duration::from_millis(30_000),
            link_selector: None,
            page_function: PageFunction::builtin(),
            interception: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headless: true,
            notification: NotificationConfig::default(),
        }
    }
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub results: Vec<PageResult>,
}

fn read_input_file(path: &Path) -> Result<Vec<InputRecord>, RunError> {
    if !path.exists() {
        return Err(RunError::InputNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| RunError::InputRead {
        path: path.to_path_buf(),
        source,
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|source| RunError::InputParse {
            path: path.to_path_buf(),
            source,
        })?;

    if !value.is_array() {
        return Err(RunError::InputNotArray(path.to_path_buf()));
    }

    serde_json::from_value(value).map_err(|source| RunError::InputParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the seed list: in-memory inputs win, the input file is the fallback.
pub fn load_inputs(options: &RunOptions) -> Result<Vec<CrawlRequest>, RunError> {
    let records = if options.inputs.is_empty() {
        read_input_file(&options.input_path)?
    } else {
        options.inputs.clone()
    };

    if records.is_empty() {
        return Err(RunError::EmptyInput);
    }

    Ok(records.into_iter().map(CrawlRequest::from).collect())
}

/// Runs one crawl end to end: inputs, browser, crawl, dataset, webhook.
///
/// `launcher` starts the browser from the derived launch configuration; it is
/// only called once every configuration check has passed.
pub async fn run_crawler<B, L, F>(
    options: RunOptions,
    launcher: L,
    on_result: F,
) -> Result<RunReport, RunError>
where
    B: BrowserDriver,
    L: FnOnce(&LaunchConfig) -> Result<B, BrowserError>,
    F: Fn(&PageResult) + Send + Sync + 'static,
{
    let started_at = Utc::now();
    info!("Starting crawl run at {}", started_at.to_rfc3339());

    let format: DatasetFormat = options.format.parse()?;
    let seeds = load_inputs(&options)?;
    let total_requests = seeds.len();

    let active_proxy = ProxySettings::load(&options.proxy_config).and_then(|s| s.select());
    let driver_args = build_driver_args(active_proxy.as_deref());

    let launch_config = LaunchConfig {
        headless: options.headless,
        args: driver_args.args.clone(),
        ..LaunchConfig::default()
    };

    let crawl_config = CrawlConfig {
        max_depth: options.max_depth,
        max_links_per_page: options.max_links_per_page,
        session: SessionConfig {
            user_agent: options.user_agent.clone(),
            navigation_timeout: options.navigation_timeout,
            settle_delay: options.wait_for,
            link_selector: options.link_selector.clone(),
            max_depth: options.max_depth,
            proxy: driver_args.proxy.as_ref().map(|p| p.server()),
            proxy_auth: driver_args.proxy_auth().cloned(),
            page_function: options.page_function.clone(),
            interception: options.interception.clone(),
        },
    };

    let session = BrowserSession::new(launcher(&launch_config)?);
    let mut crawler = Crawler::new(crawl_config).with_progress(on_result);
    let results = crawler.run(session.browser(), seeds).await?;

    if let Err(e) = session.close() {
        warn!("Failed to close browser: {}", e);
    }

    Exporter::new().export(&results, &options.output_path, format)?;

    let finished_at = Utc::now();
    info!(
        "Finished crawl run at {}, processed {} pages",
        finished_at.to_rfc3339(),
        results.len()
    );

    let summary = RunSummary {
        started_at,
        finished_at,
        total_requests,
        total_results: results.len(),
        output_path: options.output_path.display().to_string(),
    };

    Notifier::new(options.notification.clone())
        .notify_run_finished(&summary)
        .await;

    Ok(RunReport { summary, results })
}
