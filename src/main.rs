mod cli;
mod progress;
mod run;

use anyhow::{Context, Result};
use browser::{ChromeBrowser, InterceptionAdapter, PageFunction, RulePolicy};
use notifier::NotificationConfig;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, CrawlArgs};
use progress::CrawlProgress;
use run::{run_crawler, RunOptions};

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Maps CLI flags onto run options, resolving the script and rules files.
fn build_options(args: CrawlArgs) -> Result<RunOptions> {
    let page_function = match &args.page_function {
        Some(path) => PageFunction::from_file(path)
            .with_context(|| format!("Failed to load page function {}", path.display()))?,
        None => PageFunction::builtin(),
    };

    let interception = match &args.intercept_rules {
        Some(path) => {
            let rules = RulePolicy::from_file(path)
                .with_context(|| format!("Failed to load intercept rules {}", path.display()))?;
            Some(InterceptionAdapter::from_policy(rules))
        }
        None => None,
    };

    Ok(RunOptions {
        inputs: Vec::new(),
        input_path: args.input,
        output_path: args.output,
        format: args.format,
        proxy_config: args.proxy_config,
        max_depth: args.max_depth,
        max_links_per_page: args.max_links_per_page,
        wait_for: Duration::from_millis(args.wait_for),
        navigation_timeout: Duration::from_millis(args.navigation_timeout),
        link_selector: args.follow_links_selector,
        page_function,
        interception,
        headless: !args.headful,
        notification: NotificationConfig {
            webhook_url: args.finish_webhook.filter(|u| !u.trim().is_empty()),
            ..NotificationConfig::default()
        },
        ..RunOptions::default()
    })
}

async fn crawl(args: CrawlArgs, show_progress: bool) -> Result<()> {
    let options = build_options(args)?;
    let progress = CrawlProgress::new(show_progress);

    let report = run_crawler(options, ChromeBrowser::launch, progress.tracker()).await?;

    progress.finish(format!("✓ Crawled {} pages", report.summary.total_results));
    info!(
        "Wrote {} results for {} requests to {}",
        report.summary.total_results, report.summary.total_requests, report.summary.output_path
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose, cli.quiet);

    let outcome = match cli.command {
        Commands::Crawl(args) => crawl(args, !cli.quiet).await,
    };

    if let Err(e) = outcome {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
