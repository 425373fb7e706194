use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Longest client-supplied string written to the logs as is
pub const MAX_LOGGED_LENGTH: usize = 256;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `verbose`.
/// With a log file, events are appended there without ANSI colours instead
/// of going to stderr.
pub fn setup_tracing(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Couldn't set global tracing subscriber")?;
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Couldn't set global tracing subscriber")?;
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {:?}", path))
}

/// Escapes control and non-ASCII characters so that client text cannot
/// forge log lines, and cuts it at `MAX_LOGGED_LENGTH` characters.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len().min(MAX_LOGGED_LENGTH));
    for (count, c) in input.chars().enumerate() {
        if count == MAX_LOGGED_LENGTH {
            result.push_str("...");
            break;
        }
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_log_string() {
        assert_eq!(safe_log_string("MAIL FROM:<a@x>"), "MAIL FROM:<a@x>");
        assert_eq!(safe_log_string("a\r\nb"), "a\\r\\nb");
        assert_eq!(safe_log_string("\0\x1b[31m"), "\\0\\x1b[31m");
        assert_eq!(safe_log_string("café"), "caf\\u{e9}");
    }

    #[test]
    fn test_safe_log_string_truncates() {
        let long = "x".repeat(MAX_LOGGED_LENGTH + 10);
        let logged = safe_log_string(&long);
        assert_eq!(logged.len(), MAX_LOGGED_LENGTH + 3);
        assert!(logged.ends_with("..."));
    }

    #[test]
    fn test_open_log_file_creates_parent() {
        let dir = std::env::temp_dir().join(format!("smtp-forwarder-log-{}", std::process::id()));
        let path = dir.join("nested").join("forwarder.log");

        open_log_file(&path).unwrap();
        assert!(path.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
