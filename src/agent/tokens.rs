//! Token-usage extraction from agent CLI output.
//!
//! The two backends report usage very differently: one emits a JSON result
//! document, the other free-text summaries. Parsing is an ordered strategy
//! list that short-circuits on the first hit and returns 0 on a total miss.

use regex::Regex;
use std::sync::LazyLock;

static FALLBACK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)total tokens:\s*([0-9][0-9,]*)",
        r"(?i)tokens used:\s*([0-9][0-9,]*)",
        r"(?i)usage:\s*([0-9][0-9,]*)\s*tokens",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap_or_else(|e| unreachable!("static pattern: {e}")))
    .collect()
});

/// Slice out the first balanced `{...}` span in `text`. Braces inside JSON
/// string literals don't count toward nesting, so a result document whose
/// message text contains `{` still parses.
fn first_json_object(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[open..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..open + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Sum of the usage counters inside a JSON result document, when present.
fn from_json(stdout: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())
        .ok()
        .or_else(|| serde_json::from_str(first_json_object(stdout)?).ok())?;
    let usage = value.get("usage")?;
    let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
    Some(
        field("input_tokens")
            + field("output_tokens")
            + field("cache_read_input_tokens")
            + field("cache_creation_input_tokens"),
    )
}

/// First regex hit over the combined output, commas tolerated.
fn from_patterns(combined: &str) -> Option<u64> {
    for pattern in FALLBACK_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(combined)
            && let Some(m) = caps.get(1)
        {
            let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
    }
    None
}

/// Extract total token usage from an invocation's output. Returns 0 when
/// neither strategy matches.
pub fn parse_token_usage(stdout: &str, stderr: &str) -> u64 {
    if let Some(tokens) = from_json(stdout) {
        return tokens;
    }
    let combined = format!("{stdout}\n{stderr}");
    from_patterns(&combined).unwrap_or(0)
}
