pub mod send;
pub mod split;

use crate::config::OutputFormat;
use anyhow::Result;
use colored::*;
use serde::Serialize;

/// Format output based on user preference
pub fn format_output<T: Serialize>(
    data: T,
    format: &OutputFormat,
    title: Option<&str>,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        OutputFormat::Text => {
            if let Some(title) = title {
                println!("\n{}", title.bold().green());
                println!("{}", "=".repeat(title.len()));
            }
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
    }
    Ok(())
}

/// Print a key/value row in text output
pub fn print_row(label: &str, value: impl std::fmt::Display) {
    println!("  {:<22} {}", format!("{}:", label).bold(), value);
}

/// Render millisatoshis as sats with three decimals
pub fn format_msat(msat: u64) -> String {
    format!("{}.{:03} sat", msat / 1000, msat % 1000)
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message.blue());
}
