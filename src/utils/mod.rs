use regex::Regex;
use std::sync::LazyLock;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_\s-]").expect("valid regex"));
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strips everything outside `[A-Za-z0-9_\s-]` and turns whitespace runs
/// into a single underscore.
pub fn sanitize_title(title: &str) -> String {
    let stripped = UNSAFE_CHARS.replace_all(title, "");
    WHITESPACE_RUN.replace_all(&stripped, "_").into_owned()
}

/// `<ordinal>_<sanitized title>` without extension; ordinals are 1-based.
pub fn chapter_file_stem(ordinal: usize, title: &str) -> String {
    format!("{}_{}", ordinal, sanitize_title(title))
}

/// Pull the JSON payload out of a model response that may wrap it in code
/// fences or surrounding prose. Arrays and objects are both accepted.
pub fn extract_json_block(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Some(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Some(block);
            }
        }
    }

    let open = trimmed.find(['[', '{'])?;
    let close = match trimmed.as_bytes()[open] {
        b'[' => trimmed.rfind(']')?,
        _ => trimmed.rfind('}')?,
    };
    (open < close).then(|| &trimmed[open..=close])
}
