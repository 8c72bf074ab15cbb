//! Terminal display utilities for the CLI.
//!
//! Provides styled tables, progress bars, and formatted output.

pub mod progress;
pub mod tables;
pub mod theme;

pub use progress::{create_progress_bar, create_spinner, progress_enabled, with_spinner};
pub use tables::{
    TableBuilder, build_report_table, buckets_table, cache_stats_table, search_hits_table,
};
pub use theme::{THEME, Theme};
