use indicatif::{ProgressBar, ProgressStyle};
use session::PageResult;
use std::cell::Cell;
use std::time::Duration;

/// Spinner counting processed pages; the total is unknown while links are
/// still being discovered.
pub struct CrawlProgress {
    bar: Option<ProgressBar>,
    finished: Cell<bool>,
}

impl CrawlProgress {
    pub fn new(enabled: bool) -> Self {
        let bar = if enabled {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {pos} pages ({per_sec}) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        Self {
            bar,
            finished: Cell::new(false),
        }
    }

    /// Callback for the crawl engine: one tick per result.
    pub fn tracker(&self) -> impl Fn(&PageResult) + Send + Sync + 'static {
        let bar = self.bar.clone();
        move |result: &PageResult| {
            if let Some(pb) = &bar {
                pb.inc(1);
                let marker = if result.is_error() { "✗" } else { "✓" };
                pb.set_message(format!("{} {}", marker, result.loaded_url));
            }
        }
    }

    pub fn finish(&self, message: String) {
        if self.finished.replace(true) {
            return;
        }

        if let Some(ref pb) = self.bar {
            pb.finish_with_message(message);
        }
    }
}

impl Drop for CrawlProgress {
    fn drop(&mut self) {
        // Clear only if nobody finished it.
        if !self.finished.get() {
            if let Some(ref pb) = self.bar {
                pb.finish_and_clear();
            }
        }
    }
}
