//! Terminal progress bar fed by the download meter.

use indicatif::{ProgressBar, ProgressStyle};
use pullbox_oci::ProgressSink;

const TEMPLATE: &str =
    "{msg} {bar:40.green/green.dim} {bytes:.bold}/{total_bytes:.dim} ({bytes_per_sec}, {eta})";

/// A [`ProgressSink`] drawing a byte-based bar labelled "pulling image".
#[derive(Clone)]
pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(0))
    }

    /// Wrap an existing bar, e.g. a hidden one in tests.
    pub fn with_bar(bar: ProgressBar) -> Self {
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=+-");
        bar.set_style(style);
        bar.set_message("pulling image");
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    /// Stop the bar at its current position after a failed pull.
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn update(&self, transferred: u64, total: u64) {
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }
        self.bar.set_position(transferred);
    }
}
