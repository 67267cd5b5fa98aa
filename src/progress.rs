//! Terminal progress display
//!
//! A bar of uploaded parts stays at the bottom; notes (retries, deletions)
//! scroll above it. A hidden bar still counts, so the number of chunks
//! remaining can always be queried.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

pub struct UploadProgress {
    bar: ProgressBar,
    start_time: Instant,
}

impl UploadProgress {
    pub fn new(total_parts: u64, visible: bool) -> Self {
        let bar = ProgressBar::new(total_parts);
        if visible {
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} parts ({elapsed})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.set_message("Uploading".to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            bar,
            start_time: Instant::now(),
        }
    }

    pub fn hidden(total_parts: u64) -> Self {
        Self::new(total_parts, false)
    }

    pub fn chunk_done(&self) {
        self.bar.inc(1);
    }

    /// Parts not yet uploaded
    pub fn remaining(&self) -> u64 {
        self.bar
            .length()
            .unwrap_or(0)
            .saturating_sub(self.bar.position())
    }

    /// Print a line above the bar
    pub fn note(&self, msg: &str) {
        self.bar.suspend(|| {
            eprintln!("  {}", msg.with(Color::Yellow));
        });
    }

    pub fn finish_success(&self, bytes: u64) {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            bytes as f64 / elapsed / 1_048_576.0
        } else {
            0.0
        };
        self.bar.finish_with_message(format!(
            "{} {:.1} MB in {:.1}s ({:.1} MB/s)",
            "Uploaded".with(Color::Green).bold(),
            bytes as f64 / 1_048_576.0,
            elapsed,
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_bar_counts_remaining_chunks() {
        let progress = UploadProgress::hidden(3);
        assert_eq!(progress.remaining(), 3);
        progress.chunk_done();
        progress.chunk_done();
        assert_eq!(progress.remaining(), 1);
        progress.chunk_done();
        assert_eq!(progress.remaining(), 0);
    }
}
