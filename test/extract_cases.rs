//! Extraction against realistic model responses

use dialogen::extract::{extract, Extractor, Strategy};
use dialogen::validate::Validator;
use serde_json::Value;

const MARKER: &str = "【完整请求总结】";

fn systems(raw: &str) -> Vec<String> {
    extract(raw)
        .unwrap_or_default()
        .iter()
        .map(|r| r["system"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_clean_array_uses_whole_document() {
    let raw = r#"[
  {"system": "s1", "conversations": [{"from": "human", "value": "hi"}]},
  {"system": "s2", "conversations": []}
]"#;
    let out = Extractor::default().extract(raw).unwrap();
    assert_eq!(out.strategy, Strategy::WholeDocument);
    let expected: Vec<Value> = serde_json::from_str(raw).unwrap();
    let got: Vec<Value> = out.records.into_iter().map(Value::Object).collect();
    assert_eq!(got, expected);
}

#[test]
fn test_json_mode_wrapper_object() {
    let raw = r#"{"data": [{"system": "a", "conversations": []}, {"system": "b", "conversations": []}]}"#;
    assert_eq!(systems(raw), vec!["a", "b"]);
}

#[test]
fn test_prose_and_fence() {
    let raw = "好的，以下是生成的数据：\n\n```json\n[\n  {\"system\": \"a\", \"conversations\": []}\n]\n```\n\n如需更多请告诉我。";
    let out = Extractor::default().extract(raw).unwrap();
    assert_eq!(out.strategy, Strategy::FencedBlock);
    assert_eq!(out.records.len(), 1);
}

#[test]
fn test_brackets_inside_strings_do_not_confuse_depth() {
    let raw = r#"Result: [{"system": "use [brackets] and {braces}", "conversations": [{"from": "human", "value": "quote \" ] here"}]}] end"#;
    assert_eq!(systems(raw), vec!["use [brackets] and {braces}"]);
}

#[test]
fn test_truncated_at_output_cap() {
    let raw = r#"[{"system":"a","conversations":[]},{"system":"b","conversations":[]},{"system":"c""#;
    let out = Extractor::default().extract(raw).unwrap();
    assert_eq!(out.strategy, Strategy::TruncatedArray);
    assert_eq!(systems(raw), vec!["a", "b"]);
}

#[test]
fn test_truncated_inside_string_value() {
    let raw = r#"```json
[
  {"system": "a", "conversations": [{"from": "human", "value": "x"}]},
  {"system": "b", "conversations": [{"from": "gpt", "value": "cut off mid {sentence"#;
    assert_eq!(systems(raw), vec!["a"]);
}

#[test]
fn test_loose_objects_without_array() {
    let raw = "Record one:\n{\"system\": \"a\", \"conversations\": []}\nRecord two:\n{\"system\": \"b\", \"conversations\": []}";
    let out = Extractor::default().extract(raw).unwrap();
    assert_eq!(out.strategy, Strategy::ObjectSoup);
    assert_eq!(out.records.len(), 2);
}

#[test]
fn test_incidental_braces_are_ignored() {
    assert!(extract("Use the format {\"name\": value} as shown.").is_none());
    assert_eq!(
        systems(r#"Example {"name": "x"} then [{"system": "real"}]"#),
        vec!["real"]
    );
}

#[test]
fn test_every_returned_record_has_field() {
    let inputs = [
        r#"[{"a":1},{"system":"x"}]"#,
        r#"{"only": [{"b":2}, {"system":"y"}]}"#,
        r#"text [{"c":3}, {"system":"z"},] text"#,
        r#"[{"d":4}, {"system":"w"}, {"system""#,
        r#"{"e":5} {"system":"v"}"#,
    ];
    for raw in inputs {
        let records = extract(raw).unwrap();
        assert!(!records.is_empty(), "nothing from {}", raw);
        assert!(records.iter().all(|r| r.contains_key("system")), "{}", raw);
    }
}

#[test]
fn test_extract_then_validate_batch() {
    let valid = format!(
        r#"{{"system":"s","conversations":[{{"from":"human","value":"book a table"}},{{"from":"gpt","value":"{}table for two at 7"}}]}}"#,
        MARKER
    );
    let missing_marker = r#"{"system":"s","conversations":[{"from":"human","value":"q"},{"from":"gpt","value":"done"}]}"#;
    let raw = format!("Here:\n[{}, {}, {}]", valid, missing_marker, valid);

    let records = extract(&raw).unwrap();
    let validator = Validator::new("system", MARKER);
    let partition = validator.partition(records, 1);
    assert_eq!(partition.valid.len(), 2);
    assert_eq!(partition.rejected, 1);
    assert_eq!(partition.reasons[0].index, 1);

    let again = validator.partition(partition.valid.clone(), 1);
    assert_eq!(again.valid, partition.valid);
}
