//! CLI-specific progress handling for sicar-dl
//!
//! Provides progress bar implementation for the command-line interface.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use sicar_dl::ProgressCallback;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {bytes_per_sec} {msg}";

/// Creates a progress bar for CLI display with enhanced information
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Progress manager shared by every file of a batch download
pub struct ProgressManager {
    pub pb: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(total_size: u64, message: &str) -> Self {
        let pb = create_progress_bar(total_size);

        // Print initial message to stderr
        eprintln!("{message}");

        Self { pb }
    }

    /// Callback feeding the bar; a new total starts a new file
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |downloaded, total| {
            if pb.length().unwrap_or(0) != total || downloaded < pb.position() {
                pb.reset();
                pb.set_length(total);
            }
            pb.set_position(downloaded);
            if downloaded >= total {
                pb.set_message("✅");
            }
        })
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_progress_bar_template() {
        let pb = create_progress_bar(1000);
        assert_eq!(pb.length().unwrap(), 1000);

        pb.set_position(100);
        pb.finish();
    }

    #[test]
    fn test_progress_manager_creation() {
        let manager = ProgressManager::new(500, "Test download");
        assert_eq!(manager.pb.length().unwrap(), 500);
    }

    #[test]
    fn test_callback_resets_for_new_file() {
        let manager = ProgressManager::new(0, "Batch");
        let progress = manager.callback();

        progress(400, 1000);
        assert_eq!(manager.pb.length(), Some(1000));
        assert_eq!(manager.pb.position(), 400);

        progress(10, 200);
        assert_eq!(manager.pb.length(), Some(200));
        assert_eq!(manager.pb.position(), 10);
    }
}
