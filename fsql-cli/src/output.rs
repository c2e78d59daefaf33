//! Styled terminal output utilities.
//!
//! Progress goes to stdout; errors go to stderr alongside the log stream.

use owo_colors::OwoColorize;

/// Print a header/title
pub fn header(text: &str) {
    println!();
    println!("{}", text.bold().cyan());
    println!("{}", "─".repeat(text.chars().count()).dimmed());
    println!();
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a success message
pub fn success(text: &str) {
    println!("{} {}", "✔".green().bold(), text.green());
}

/// Print a warning message
pub fn warn(text: &str) {
    println!("{} {}", "⚠".yellow().bold(), text.yellow());
}

/// Print an error message
pub fn error(text: &str) {
    eprintln!("{} {}", "✖".red().bold(), text.red());
}

/// Print an indented error detail
pub fn error_item(text: &str) {
    eprintln!("  {} {}", "•".red(), text);
}

/// Print a step indicator with its elapsed time
pub fn step(current: usize, total: usize, text: &str, duration_ms: i64) {
    println!(
        "{} {} {}",
        format!("[{}/{}]", current, total).dimmed(),
        text,
        format!("({}ms)", duration_ms).dimmed()
    );
}

/// Print a list item
pub fn list_item(text: &str) {
    println!("  {} {}", "•".dimmed(), text);
}

/// Print a list item for a failed entry
pub fn failed_item(text: &str) {
    println!("  {} {}", "✖".red(), text.red());
}

/// Print a newline
pub fn newline() {
    println!();
}

/// Print dimmed text
pub fn dim(text: &str) {
    println!("{}", text.dimmed());
}

/// Print an indented code block
pub fn code(code: &str) {
    for line in code.lines() {
        println!("    {}", line.bright_white());
    }
}
