//! CLI Output Formatting Module
//! Provides consistent, colorized output for terminal UX

use colored::Colorize;

use crate::engine::updater::state::{InstallationState, StateTransition};
use crate::engine::updater::verify::TrustVerdict;

pub struct CliFormatter;

impl CliFormatter {
    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print an info message
    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.len()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    pub fn verdict(verdict: &TrustVerdict) {
        match verdict {
            TrustVerdict::Trusted => Self::success("Signature valid"),
            TrustVerdict::Untrusted(reason) => Self::error(&format!("Untrusted: {}", reason)),
            TrustVerdict::Unverifiable(reason) => {
                Self::warning(&format!("Cannot verify: {}", reason))
            }
        }
    }

    /// Print the states an installation went through
    pub fn history(transitions: &[StateTransition]) {
        for transition in transitions {
            let label = state_label(&transition.to);
            let label = match transition.to {
                InstallationState::Failed(_) => label.red().bold(),
                InstallationState::Done => label.green().bold(),
                _ => label.normal(),
            };
            println!(
                "  {} {} {}",
                transition.at.format("%H:%M:%S%.3f").to_string().bright_black(),
                "▶".bright_blue(),
                label
            );
        }
    }
}

/// Short human label for a state
pub fn state_label(state: &InstallationState) -> String {
    match state {
        InstallationState::Verifying => "verifying".to_string(),
        InstallationState::Staging => "staging".to_string(),
        InstallationState::AwaitingAuthorization => "awaiting authorization".to_string(),
        InstallationState::Swapping => "swapping".to_string(),
        InstallationState::PostProcessing => "post-processing".to_string(),
        InstallationState::Done => "done".to_string(),
        InstallationState::Failed(reason) => format!("failed: {}", reason),
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
