//! Progress reporting for the parallel passes

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Owns the terminal progress display for one run. When disabled every
/// bar is hidden and updates are no-ops, so non-interactive runs stay
/// quiet.
pub struct ProgressReporter {
    multi: MultiProgress,
    enabled: bool,
}

impl ProgressReporter {
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            enabled,
        }
    }

    /// A bar tracking one stage across `len` ranges.
    pub fn stage_bar(&self, name: &str, len: u64) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let bar = self.multi.add(ProgressBar::new(len));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ranges | {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        bar.set_message(name.to_string());
        bar
    }
}
