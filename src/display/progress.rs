//! Progress tracking utilities for long-running index builds.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use is_terminal::IsTerminal;

/// Whether progress bars should be drawn at all.
///
/// Bars go to stderr, so a redirected stderr means no bars.
pub fn progress_enabled(requested: bool) -> bool {
    requested && std::io::stderr().is_terminal()
}

/// Create a styled progress bar, or a hidden one when `visible` is false.
pub fn create_progress_bar(total: u64, message: &str, visible: bool) -> ProgressBar {
    if !progress_enabled(visible) {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Create a spinner for indeterminate progress such as model downloads.
pub fn create_spinner(message: &str, visible: bool) -> ProgressBar {
    if !progress_enabled(visible) {
        return ProgressBar::hidden();
    }

    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Helper to display a temporary spinner during an operation.
pub fn with_spinner<F, T>(message: &str, visible: bool, operation: F) -> T
where
    F: FnOnce() -> T,
{
    let spinner = create_spinner(message, visible);
    let result = operation();
    spinner.finish_and_clear();
    result
}
