//! Terminal progress indicators for long-running file passes

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner counting processed rows
pub fn create_row_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg} {human_pos} rows ({per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Spinner when `visible`, otherwise a hidden bar that swallows updates
pub fn row_spinner_if(visible: bool, message: &str) -> ProgressBar {
    if visible {
        create_row_spinner(message)
    } else {
        ProgressBar::hidden()
    }
}
