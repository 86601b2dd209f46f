use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "page-crawler")]
#[command(version)]
#[command(about = "Breadth-first headless browser crawler", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl the seed requests from an input file and write a dataset
    Crawl(CrawlArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// JSON file holding an array of {url, label?, depth?} seeds
    #[arg(short, long, default_value = "data/inputs.json")]
    pub input: PathBuf,

    /// Dataset output path
    #[arg(short, long, default_value = "data/results.json")]
    pub output: PathBuf,

    /// Dataset format: json or csv
    #[arg(short, long, default_value = "json")]
    pub format: String,

    /// JavaScript file exporting the extraction function
    #[arg(long, value_name = "FILE")]
    pub page_function: Option<PathBuf>,

    /// JSON file with request interception rules
    #[arg(long, value_name = "FILE")]
    pub intercept_rules: Option<PathBuf>,

    /// Proxy settings file; a missing file means no proxy
    #[arg(long, default_value = "config/proxy_settings.json")]
    pub proxy_config: PathBuf,

    /// Maximum link depth to follow from the seeds
    #[arg(short = 'd', long, default_value = "1")]
    pub max_depth: u32,

    /// Delay after navigation before extracting, in milliseconds
    #[arg(long, default_value = "3000")]
    pub wait_for: u64,

    /// Per-page navigation timeout in milliseconds
    #[arg(long, default_value = "30000")]
    pub navigation_timeout: u64,

    /// CSS selector for links to follow
    #[arg(long)]
    pub follow_links_selector: Option<String>,

    /// Only consider the first N links found on each page
    #[arg(long)]
    pub max_links_per_page: Option<usize>,

    /// URL to POST a run summary to when the crawl finishes
    #[arg(long, env = "FINISH_WEBHOOK_URL")]
    pub finish_webhook: Option<String>,

    /// Show the browser window
    #[arg(long)]
    pub headful: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
