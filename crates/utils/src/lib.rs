//! Utilities: logging init, text helpers

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; `RUST_LOG_FORMAT=json` switches to JSON lines on stderr.
/// Later calls are no-ops.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().try_init().ok();
    } else {
        builder.compact().try_init().ok();
    }
    Ok(())
}

/// First `max` characters of `text`; `max == 0` keeps everything.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    if max == 0 {
        return text;
    }
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Shorten an upstream error body for log lines.
pub fn clip(text: &str) -> String {
    const LIMIT: usize = 200;
    let t = truncate_chars(text.trim(), LIMIT);
    if t.len() < text.trim().len() {
        format!("{t}…")
    } else {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_tracing().unwrap();
        init_tracing().unwrap();
    }

    #[test]
    fn truncate_counts_chars_not_bytes() {
        assert_eq!(truncate_chars("llamó", 4), "llam");
        assert_eq!(truncate_chars("llamó", 5), "llamó");
        assert_eq!(truncate_chars("llamó", 50), "llamó");
        assert_eq!(truncate_chars("llamó", 0), "llamó");
    }

    #[test]
    fn clip_marks_cut_bodies() {
        let long = "x".repeat(500);
        let c = clip(&long);
        assert!(c.ends_with('…'));
        assert_eq!(clip(" short "), "short");
    }
}
