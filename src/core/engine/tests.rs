use super::*;
use serde_json::json;

fn call(name: &str, input: Value) -> ToolCall {
    ToolCall::new("call_1", name, input).expect("valid call")
}

#[test]
fn scope_guard_allows_unlocked_runs() {
    let query = call(QUERY_DATASOURCE_TOOL, json!({ "datasourceId": "ds-9" }));
    assert!(validate_scope(&query, None).is_ok());

    let list = call(LIST_DATASOURCES_TOOL, json!({}));
    assert!(validate_scope(&list, None).is_ok());
}

#[test]
fn scope_guard_blocks_foreign_datasource() {
    let query = call(QUERY_DATASOURCE_TOOL, json!({ "datasourceId": "ds-other" }));
    let err = validate_scope(&query, Some("ds-1")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);
    assert!(err.message.contains("ds-other"));
}

#[test]
fn scope_guard_blocks_enumeration_when_locked() {
    let list = call(LIST_DATASOURCES_TOOL, json!({}));
    let err = validate_scope(&list, Some("ds-1")).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);
}

#[test]
fn scope_guard_allows_matching_and_unnamed_datasource() {
    let matching = call(QUERY_DATASOURCE_TOOL, json!({ "datasourceId": "ds-1" }));
    assert!(validate_scope(&matching, Some("ds-1")).is_ok());

    // A call that names no datasource is in scope.
    let unnamed = call("read-metadata", json!({}));
    assert!(validate_scope(&unnamed, Some("ds-1")).is_ok());
}

#[test]
fn summary_is_bounded_to_top_level_keys() {
    let value = json!({
        "a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6, "g": 7
    });
    let summary = summarize_result(&value);
    let obj = summary.as_object().unwrap();
    // Five kept keys plus the omission marker.
    assert_eq!(obj.len(), SUMMARY_MAX_KEYS + 1);
    assert_eq!(obj["omittedKeys"], json!(2));
}

#[test]
fn summary_collapses_nested_payloads_to_counts() {
    let value = json!({
        "data": [1, 2, 3],
        "meta": { "totalRows": 3, "truncated": false },
        "note": "ok"
    });
    let summary = summarize_result(&value);
    assert_eq!(summary["data"], json!({ "count": 3 }));
    assert_eq!(summary["meta"], json!({ "keys": 2 }));
    assert_eq!(summary["note"], json!("ok"));
}

#[test]
fn summary_truncates_long_strings() {
    let value = json!({ "blob": "x".repeat(500) });
    let summary = summarize_result(&value);
    let text = summary["blob"].as_str().unwrap();
    assert!(text.len() <= 120);
    assert!(text.ends_with("..."));
}

#[test]
fn summary_of_bare_array_is_a_count() {
    assert_eq!(summarize_result(&json!([1, 2, 3, 4])), json!({ "count": 4 }));
}

#[test]
fn citations_come_from_query_calls_only() {
    let query = call(
        QUERY_DATASOURCE_TOOL,
        json!({ "datasourceId": "ds-1", "fields": ["state", "SUM(sales)"] }),
    );
    let citation = citation_for(&query).unwrap();
    assert_eq!(citation.datasource_id.as_deref(), Some("ds-1"));
    assert_eq!(citation.fields, vec!["state", "SUM(sales)"]);

    let metadata = call("read-metadata", json!({ "datasourceId": "ds-1" }));
    assert!(citation_for(&metadata).is_none());
}

#[test]
fn run_request_builder_defaults() {
    let request = RunRequest::new("question", "session-1");
    assert!(request.datasource_id.is_none());
    assert!(request.max_rounds.is_none());
    assert!(!request.cancel.is_cancelled());

    let request = request.with_datasource("ds-1").with_max_rounds(3);
    assert_eq!(request.datasource_id.as_deref(), Some("ds-1"));
    assert_eq!(request.max_rounds, Some(3));
}
