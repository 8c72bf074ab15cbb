//! Colors for CLI messages.
//!
//! Everything degrades to plain text when `NO_COLOR` is set or stdout is
//! not a terminal.

use console::Style;
use is_terminal::IsTerminal;
use owo_colors::{AnsiColors, OwoColorize};
use std::fmt::Display;
use std::sync::LazyLock;

pub static THEME: LazyLock<Theme> = LazyLock::new(Theme::default);

/// Scores at or above this are shown as strong matches.
const STRONG_SCORE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct Theme {
    pub success: Style,
    pub error: Style,
    pub warning: Style,
    /// Shard, cache and index locations
    pub path: Style,
    pub strong_match: Style,
    pub weak_match: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            success: Style::new().green().bright(),
            error: Style::new().red().bright(),
            warning: Style::new().yellow().bright(),
            path: Style::new().magenta(),
            strong_match: Style::new().green(),
            weak_match: Style::new().yellow(),
        }
    }
}

impl Theme {
    pub fn success_with_icon(&self, text: &str) -> String {
        self.with_icon('✓', AnsiColors::Green, &self.success, text)
    }

    pub fn error_with_icon(&self, text: &str) -> String {
        self.with_icon('✗', AnsiColors::Red, &self.error, text)
    }

    pub fn warning_with_icon(&self, text: &str) -> String {
        self.with_icon('⚠', AnsiColors::Yellow, &self.warning, text)
    }

    /// Relevance score with three decimals, colored by strength.
    pub fn score(&self, score: f32) -> String {
        let style = if score >= STRONG_SCORE {
            &self.strong_match
        } else {
            &self.weak_match
        };
        self.apply(style, format!("{score:.3}"))
    }

    pub fn should_disable_colors() -> bool {
        std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal()
    }

    /// Styles `text` unless colors are disabled.
    pub fn apply<T: Display>(&self, style: &Style, text: T) -> String {
        if Self::should_disable_colors() {
            text.to_string()
        } else {
            style.apply_to(text).to_string()
        }
    }

    fn with_icon(&self, icon: char, color: AnsiColors, style: &Style, text: &str) -> String {
        if Self::should_disable_colors() {
            format!("{icon} {text}")
        } else {
            format!("{} {}", icon.color(color), style.apply_to(text))
        }
    }
}
