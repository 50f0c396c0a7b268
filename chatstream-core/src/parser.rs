//! Splits a transport delivery into logical lines.
//!
//! The transport delivers text aligned on line boundaries; reassembling
//! partial lines across deliveries is its job, not ours.

const DONE_SENTINEL: &str = "[DONE]";

/// One logical entry of a delivery, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Line(String),
    Terminal,
}

/// Split `chunk` on newlines, drop blanks, strip `data:` and detect `[DONE]`.
/// Never fails: malformed lines are handed to the classifier untouched.
pub fn parse_chunk(chunk: &str) -> Vec<ParsedLine> {
    chunk
        .split('\n')
        .map(|raw| strip_data_prefix(raw.strip_suffix('\r').unwrap_or(raw)))
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if line.trim() == DONE_SENTINEL {
                ParsedLine::Terminal
            } else {
                ParsedLine::Line(line.to_string())
            }
        })
        .collect()
}

fn strip_data_prefix(line: &str) -> &str {
    match line.strip_prefix("data:") {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    }
}
