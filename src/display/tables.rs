//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::cache::StoreStats;
use crate::index::{BuildReport, SearchHit};
use crate::tokens::{TokenCounter, total_tokens};
use crate::vector::CacheStats;

/// Longest excerpt shown in a table cell.
const EXCERPT_CHARS: usize = 80;

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Add a row of pre-styled cells.
    pub fn add_cells(mut self, row: Vec<Cell>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

/// Summary of an index build.
pub fn build_report_table(report: &BuildReport) -> String {
    let mut builder = TableBuilder::new().set_headers(vec!["Metric", "Value"]);

    if report.from_saved_index {
        builder = builder.add_row(vec!["Source".into(), "saved index".into()]);
    }

    // Plain text rows, comfy-table miscounts ANSI escapes
    builder = builder
        .add_row(vec!["Documents".into(), report.total_documents.to_string()])
        .add_row(vec!["Unique".into(), report.unique_documents.to_string()])
        .add_row(vec!["Loaded from shards".into(), report.loaded.to_string()])
        .add_row(vec!["Embedded".into(), report.embedded.to_string()])
        .add_row(vec!["Batches".into(), report.batches.to_string()])
        .add_row(vec![
            "Cache hits".into(),
            format!(
                "{} / {} ({:.0}%)",
                report.cache.hits,
                report.cache.hits + report.cache.misses,
                report.cache.hit_rate() * 100.0
            ),
        ]);

    if let Some(cost) = &report.cost {
        builder = builder.add_row(vec![
            "Estimated cost".into(),
            format!("${:.6} for {} tokens", cost.dollars, cost.tokens),
        ]);
    }
    if let Some(expiry) = &report.expiry {
        builder = builder.add_row(vec!["Expired".into(), expiry.display()]);
    }

    builder = builder.add_row(vec!["Time".into(), format!("{:?}", report.duration)]);

    let degraded = report.bypassed_batches + report.failed_ids.len() + report.stuck_workers;
    let (status, color) = if degraded == 0 {
        ("✓ healthy".to_string(), Color::Green)
    } else {
        (
            format!(
                "⚠ {} batch(es) bypassed the cache, {} merge failure(s), {} stuck worker(s)",
                report.bypassed_batches,
                report.failed_ids.len(),
                report.stuck_workers
            ),
            Color::Yellow,
        )
    };

    builder
        .add_cells(vec![
            Cell::new("Status"),
            Cell::new(status).fg(color).add_attribute(Attribute::Bold),
        ])
        .build()
}

/// Size of a cache namespace, with hit counters when available.
pub fn cache_stats_table(location: &str, stats: StoreStats, usage: Option<CacheStats>) -> String {
    let mut builder = TableBuilder::new()
        .set_headers(vec!["Metric", "Value"])
        .add_row(vec!["Location".into(), location.to_string()])
        .add_row(vec!["Entries".into(), stats.entries.to_string()])
        .add_row(vec!["Size".into(), format_bytes(stats.bytes)]);

    if let Some(usage) = usage {
        builder = builder.add_row(vec![
            "Hit rate".into(),
            format!("{:.1}%", usage.hit_rate() * 100.0),
        ]);
    }

    builder.build()
}

/// Ranked search results.
pub fn search_hits_table(hits: &[SearchHit]) -> String {
    let mut builder = TableBuilder::new().set_headers(vec!["#", "Score", "Id", "Excerpt"]);
    for (rank, hit) in hits.iter().enumerate() {
        let id = hit.id.as_str();
        builder = builder.add_row(vec![
            (rank + 1).to_string(),
            format!("{:.3}", hit.score),
            id.chars().take(12).collect(),
            excerpt(&hit.document.page_content),
        ]);
    }
    builder.build()
}

/// Buckets with their sizes and token counts.
pub fn buckets_table(buckets: &[Vec<String>], tokens: &dyn TokenCounter) -> String {
    let mut builder =
        TableBuilder::new().set_headers(vec!["Bucket", "Texts", "Tokens", "First text"]);
    for (i, bucket) in buckets.iter().enumerate() {
        let total = total_tokens(tokens, bucket.iter().map(String::as_str));
        builder = builder.add_row(vec![
            (i + 1).to_string(),
            bucket.len().to_string(),
            total.to_string(),
            bucket.first().map(|t| excerpt(t)).unwrap_or_default(),
        ]);
    }
    builder.build()
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let mut short: String = flat.chars().take(EXCERPT_CHARS - 1).collect();
    short.push('…');
    short
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicTokenCounter;

    #[test]
    fn test_table_builder() {
        let table = TableBuilder::new()
            .set_headers(vec!["Column 1", "Column 2"])
            .add_row(vec!["Value 1".to_string(), "Value 2".to_string()])
            .build();

        assert!(table.contains("Column 1"));
        assert!(table.contains("Value 1"));
    }

    #[test]
    fn test_build_report_status() {
        let report = BuildReport {
            total_documents: 4,
            unique_documents: 3,
            ..Default::default()
        };
        let table = build_report_table(&report);
        assert!(table.contains("healthy"));

        let degraded = BuildReport {
            bypassed_batches: 2,
            ..Default::default()
        };
        assert!(build_report_table(&degraded).contains("2 batch(es) bypassed"));
    }

    #[test]
    fn test_buckets_table() {
        let buckets = vec![
            vec!["alpha beta".to_string(), "gamma".to_string()],
            vec!["delta".to_string()],
        ];
        let table = buckets_table(&buckets, &HeuristicTokenCounter);
        assert!(table.contains("alpha beta"));
        assert!(table.contains("Tokens"));
    }

    #[test]
    fn test_excerpt_and_bytes() {
        let long = "word ".repeat(40);
        let short = excerpt(&long);
        assert_eq!(short.chars().count(), EXCERPT_CHARS);
        assert!(short.ends_with('…'));
        assert_eq!(excerpt("a\n  b"), "a b");

        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }
}
