//! User-facing terminal messages
//!
//! Colored, padded messages for the CLI, kept apart from `log` output
//! (no timestamps, levels or module paths).

use owo_colors::OwoColorize;

/// Display a warning message in yellow with padding
///
/// # Example
/// ```ignore
/// output::warn("12 files failed to parse and were left out");
/// ```
pub fn warn(message: &str) {
    eprintln!("\n{}\n", message.yellow());
}

/// Display an error message in red with padding
///
/// # Example
/// ```ignore
/// output::error("Error: unknown repository 'acme/web'");
/// ```
pub fn error(message: &str) {
    eprintln!("\n{}\n", message.red());
}

/// Display an informational message with padding
pub fn info(message: &str) {
    eprintln!("\n{}\n", message);
}
