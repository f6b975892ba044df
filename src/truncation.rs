//! Size control for tool outputs before they enter the transcript.
//!
//! Row-oriented results are row-capped with a metadata note recording the
//! original and kept counts. Anything still exceeding the byte ceiling is
//! cut back at a structural boundary (whole rows), and when structure
//! cannot be preserved at all the output collapses to a minimal wrapper
//! object describing the truncation.

use serde_json::{Value, json};

use crate::envelope::LIST_WRAPPER_KEYS;

/// Outcome of applying the size policy to one tool result.
#[derive(Debug, Clone)]
pub struct TruncatedResult {
    /// Serialized content, guaranteed to be valid JSON text.
    pub content: String,
    pub truncated: bool,
    /// Original row count when a row array was capped.
    pub total_rows: Option<usize>,
    /// Rows kept after capping.
    pub kept_rows: Option<usize>,
}

impl TruncatedResult {
    fn passthrough(content: String) -> Self {
        Self {
            content,
            truncated: false,
            total_rows: None,
            kept_rows: None,
        }
    }
}

/// Find the row array inside a result, either bare or under a known
/// wrapper key. Returns the wrapper key (None for a bare array).
fn locate_rows(value: &Value) -> Option<(Option<&'static str>, usize)> {
    if let Some(rows) = value.as_array() {
        return Some((None, rows.len()));
    }
    let obj = value.as_object()?;
    for key in LIST_WRAPPER_KEYS {
        if let Some(rows) = obj.get(key).and_then(Value::as_array) {
            return Some((Some(key), rows.len()));
        }
    }
    None
}

fn cap_rows_in_place(value: &mut Value, key: Option<&str>, cap: usize) {
    let rows = match key {
        Some(key) => value.get_mut(key).and_then(Value::as_array_mut),
        None => value.as_array_mut(),
    };
    if let Some(rows) = rows {
        rows.truncate(cap);
    }
}

/// Apply the row cap and byte ceiling to a tool result value.
///
/// The returned content always parses as JSON; a `meta` block records
/// `totalRows`/`returnedRows`/`truncated` whenever anything was dropped.
#[must_use]
pub fn bound_result(value: &Value, row_cap: usize, byte_ceiling: usize) -> TruncatedResult {
    let mut working = value.clone();
    let located = locate_rows(&working);
    let mut total_rows = None;
    let mut kept_rows = None;
    let mut row_capped = false;

    if let Some((key, count)) = located
        && count > row_cap
    {
        cap_rows_in_place(&mut working, key, row_cap);
        total_rows = Some(count);
        kept_rows = Some(row_cap);
        row_capped = true;
    }

    let serialized = match serialize_with_meta(&working, total_rows, kept_rows) {
        Some(text) => text,
        None => return fallback_wrapper(value, byte_ceiling),
    };

    if serialized.len() <= byte_ceiling {
        let mut result = TruncatedResult::passthrough(serialized);
        result.truncated = row_capped;
        result.total_rows = total_rows;
        result.kept_rows = kept_rows;
        return result;
    }

    // Over the byte ceiling even after (or without) row capping: shrink the
    // row array until it fits, halving each time to bound the rescans.
    if let Some((key, count)) = locate_rows(&working) {
        let mut keep = count;
        while keep > 0 {
            keep /= 2;
            cap_rows_in_place(&mut working, key, keep);
            let total = total_rows.or(Some(count));
            if let Some(text) = serialize_with_meta(&working, total, Some(keep))
                && text.len() <= byte_ceiling
            {
                return TruncatedResult {
                    content: text,
                    truncated: true,
                    total_rows: total,
                    kept_rows: Some(keep),
                };
            }
        }
    }

    fallback_wrapper(value, byte_ceiling)
}

fn serialize_with_meta(
    value: &Value,
    total_rows: Option<usize>,
    kept_rows: Option<usize>,
) -> Option<String> {
    let wrapped = match (total_rows, kept_rows) {
        (Some(total), Some(kept)) => {
            let mut out = if value.is_object() {
                value.clone()
            } else {
                json!({ "data": value })
            };
            if let Some(obj) = out.as_object_mut() {
                obj.insert(
                    "meta".to_string(),
                    json!({
                        "totalRows": total,
                        "returnedRows": kept,
                        "truncated": true,
                    }),
                );
            }
            out
        }
        _ => value.clone(),
    };
    serde_json::to_string(&wrapped).ok()
}

/// Last resort when no structurally valid truncation fits: emit a small
/// wrapper describing what was dropped instead of invalid JSON.
fn fallback_wrapper(original: &Value, byte_ceiling: usize) -> TruncatedResult {
    let original_bytes = serde_json::to_string(original).map(|s| s.len()).unwrap_or(0);
    let content = json!({
        "truncated": true,
        "originalBytes": original_bytes,
        "note": format!(
            "Result exceeded the {byte_ceiling}-byte limit and could not be \
             truncated at a structural boundary."
        ),
    })
    .to_string();
    TruncatedResult {
        content,
        truncated: true,
        total_rows: None,
        kept_rows: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Value {
        let rows: Vec<Value> = (0..n).map(|i| json!({ "state": i, "sales": i * 10 })).collect();
        json!({ "data": rows })
    }

    #[test]
    fn small_results_pass_through_untouched() {
        let value = rows(10);
        let result = bound_result(&value, 1_000, 100_000);
        assert!(!result.truncated);
        assert_eq!(serde_json::from_str::<Value>(&result.content).unwrap(), value);
    }

    #[test]
    fn row_cap_keeps_exactly_cap_rows_with_metadata() {
        let value = rows(50_000);
        let result = bound_result(&value, 1_000, 10_000_000);
        assert!(result.truncated);
        assert_eq!(result.total_rows, Some(50_000));
        assert_eq!(result.kept_rows, Some(1_000));

        let parsed: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["data"].as_array().unwrap().len(), 1_000);
        assert_eq!(parsed["meta"]["totalRows"], 50_000);
        assert_eq!(parsed["meta"]["truncated"], true);
    }

    #[test]
    fn byte_ceiling_shrinks_rows_to_fit() {
        let value = rows(500);
        let result = bound_result(&value, 1_000, 2_000);
        assert!(result.truncated);
        assert!(result.content.len() <= 2_000);
        // Still valid JSON with a rows array.
        let parsed: Value = serde_json::from_str(&result.content).unwrap();
        assert!(parsed["data"].is_array());
        assert_eq!(parsed["meta"]["truncated"], true);
    }

    #[test]
    fn bare_array_results_are_capped_too() {
        let value = json!([1, 2, 3, 4, 5]);
        let result = bound_result(&value, 2, 100_000);
        assert!(result.truncated);
        let parsed: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["data"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["meta"]["totalRows"], 5);
    }

    #[test]
    fn unshrinkable_payload_falls_back_to_wrapper() {
        // One giant string value: no row array to drop.
        let value = json!({ "blob": "x".repeat(5_000) });
        let result = bound_result(&value, 1_000, 200);
        assert!(result.truncated);
        assert!(result.content.len() <= 400);
        let parsed: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["truncated"], true);
        assert!(parsed["originalBytes"].as_u64().unwrap() > 4_000);
    }
}
