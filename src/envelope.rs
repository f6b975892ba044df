//! Response-envelope normalization for the tool service.
//!
//! The data service answers the same logical call in several incompatible
//! wrappings: plain JSON, JSON wrapped as SSE text (sometimes under a JSON
//! content type), or JSON buried in markdown fences or prose. Each wrapping
//! gets its own parse attempt; attempts compose in a fixed order and the
//! first hit wins. Detection is by content inspection, never by declared
//! content type alone.

use serde_json::Value;

/// Wrapper keys checked, in order, when a list-shaped result arrives as an
/// object instead of a bare array.
pub const LIST_WRAPPER_KEYS: [&str; 6] = ["data", "items", "results", "rows", "values", "fields"];

/// Normalize a raw response body into a JSON value.
///
/// Attempts, in order: direct parse, SSE data-line extraction, code-fence
/// stripping, balanced-segment scan. Whichever succeeds, a double-encoded
/// string payload is parsed one more level.
#[must_use]
pub fn normalize_body(body: &str) -> Option<Value> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed = try_direct(trimmed)
        .or_else(|| try_sse(trimmed))
        .or_else(|| try_fenced(trimmed))
        .or_else(|| try_balanced(trimmed))?;

    Some(unwrap_double_encoded(parsed))
}

fn try_direct(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

fn try_sse(text: &str) -> Option<Value> {
    let data = extract_sse_data(text)?;
    serde_json::from_str(&data)
        .ok()
        .or_else(|| try_balanced(&data))
}

fn try_fenced(text: &str) -> Option<Value> {
    let stripped = strip_code_fences(text)?;
    serde_json::from_str(&stripped)
        .ok()
        .or_else(|| try_balanced(&stripped))
}

fn try_balanced(text: &str) -> Option<Value> {
    let segment = extract_json_segment(text)?;
    serde_json::from_str(&segment).ok()
}

/// Detect SSE-shaped text and join its `data:` payload lines.
///
/// Requires at least one `data:`-prefixed line; `event:`/`id:`/`retry:`
/// fields and the `[DONE]` sentinel are ignored.
#[must_use]
pub fn extract_sse_data(text: &str) -> Option<String> {
    let mut saw_data_line = false;
    let mut payload = String::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if data.trim() == "[DONE]" {
                continue;
            }
            saw_data_line = true;
            payload.push_str(data);
        }
    }

    if saw_data_line && !payload.trim().is_empty() {
        Some(payload)
    } else {
        None
    }
}

/// Strip markdown code fences, keeping only the fenced body.
#[must_use]
pub fn strip_code_fences(text: &str) -> Option<String> {
    if !text.contains("```") {
        return None;
    }
    let mut lines = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            continue;
        }
        lines.push(line);
    }
    let stripped = lines.join("\n");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Find the first balanced `{...}` or `[...]` segment in free text.
#[must_use]
pub fn extract_json_segment(text: &str) -> Option<String> {
    let obj = text.find('{');
    let arr = text.find('[');
    // Whichever opener comes first decides the segment shape.
    match (obj, arr) {
        (Some(o), Some(a)) if a < o => extract_balanced_segment(text, '[', ']')
            .or_else(|| extract_balanced_segment(text, '{', '}')),
        (_, Some(_)) if obj.is_none() => extract_balanced_segment(text, '[', ']'),
        (Some(_), _) => extract_balanced_segment(text, '{', '}')
            .or_else(|| extract_balanced_segment(text, '[', ']')),
        _ => None,
    }
}

/// Scan for the balanced closing delimiter, honoring string and escape
/// state so braces inside string literals do not miscount.
fn extract_balanced_segment(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            _ if ch == open => depth += 1,
            _ if ch == close => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + ch.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    end.map(|end_idx| text[start..end_idx].to_string())
}

/// Responses are sometimes double-encoded: the payload parses to a string
/// that itself holds JSON. Unwrap one level when that happens.
#[must_use]
pub fn unwrap_double_encoded(value: Value) -> Value {
    if let Value::String(inner) = &value
        && let Ok(reparsed) = serde_json::from_str::<Value>(inner)
        && (reparsed.is_object() || reparsed.is_array())
    {
        return reparsed;
    }
    value
}

/// Coerce a list-shaped result into a vector of values.
///
/// Accepts a bare array or an object wrapping the array under one of
/// [`LIST_WRAPPER_KEYS`]. Returns `None` when no list shape is found.
#[must_use]
pub fn unwrap_list(value: &Value) -> Option<Vec<Value>> {
    if let Some(items) = value.as_array() {
        return Some(items.clone());
    }
    let obj = value.as_object()?;
    for key in LIST_WRAPPER_KEYS {
        if let Some(items) = obj.get(key).and_then(Value::as_array) {
            return Some(items.clone());
        }
    }
    None
}
