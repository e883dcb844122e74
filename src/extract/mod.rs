//! Structured-Output Extraction
//!
//! Turns a raw model response into a list of candidate records. The response
//! may be clean JSON, JSON wrapped in markdown fences, JSON surrounded by
//! prose, an array cut off mid-object by the output cap, or loose objects.
//!
//! Extraction runs an ordered list of independent strategies; the first one
//! to produce at least one record wins. Every record returned is an object
//! that carries the identifying field.

pub mod scan;

use serde_json::{Map, Value};
use std::fmt;

/// One extracted candidate record
pub type Record = Map<String, Value>;

/// Field every sharegpt record carries
pub const DEFAULT_IDENTIFYING_FIELD: &str = "system";

/// Result of a single strategy
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Found(Vec<Record>),
    NotFound,
}

impl Attempt {
    fn from_records(records: Vec<Record>) -> Self {
        if records.is_empty() {
            Attempt::NotFound
        } else {
            Attempt::Found(records)
        }
    }
}

/// Extraction strategies in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    WholeDocument,
    FencedBlock,
    BalancedSpan,
    TruncatedArray,
    ObjectSoup,
}

impl Strategy {
    pub const ORDER: [Strategy; 5] = [
        Strategy::WholeDocument,
        Strategy::FencedBlock,
        Strategy::BalancedSpan,
        Strategy::TruncatedArray,
        Strategy::ObjectSoup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::WholeDocument => "whole-document",
            Strategy::FencedBlock => "fenced-block",
            Strategy::BalancedSpan => "balanced-span",
            Strategy::TruncatedArray => "truncated-array",
            Strategy::ObjectSoup => "object-soup",
        }
    }

    pub fn run(self, text: &str, field: &str) -> Attempt {
        match self {
            Strategy::WholeDocument => whole_document(text, field),
            Strategy::FencedBlock => fenced_blocks(text, field),
            Strategy::BalancedSpan => balanced_spans(text, field),
            Strategy::TruncatedArray => truncated_array(text, field),
            Strategy::ObjectSoup => object_soup(text, field),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Records plus the strategy that produced them
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub records: Vec<Record>,
    pub strategy: Strategy,
}

/// Record extractor keyed on an identifying field
#[derive(Debug, Clone)]
pub struct Extractor {
    identifying_field: String,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFYING_FIELD)
    }
}

impl Extractor {
    pub fn new(identifying_field: impl Into<String>) -> Self {
        Self {
            identifying_field: identifying_field.into(),
        }
    }

    pub fn identifying_field(&self) -> &str {
        &self.identifying_field
    }

    /// Run the strategies in order. `None` when none of them found a record.
    pub fn extract(&self, raw: &str) -> Option<Extracted> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        for strategy in Strategy::ORDER {
            if let Attempt::Found(records) = strategy.run(text, &self.identifying_field) {
                tracing::debug!(strategy = %strategy, records = records.len(), "extracted records");
                if strategy == Strategy::TruncatedArray {
                    tracing::warn!(
                        records = records.len(),
                        "salvaged complete records from truncated output"
                    );
                }
                return Some(Extracted { records, strategy });
            }
        }
        None
    }
}

/// Extract with the default identifying field
pub fn extract(raw: &str) -> Option<Vec<Record>> {
    Extractor::default().extract(raw).map(|e| e.records)
}

fn keep_records(values: impl IntoIterator<Item = Value>, field: &str) -> Vec<Record> {
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) if map.contains_key(field) => Some(map),
            _ => None,
        })
        .collect()
}

/// Records from an already-parsed document: an array of objects, or an
/// object with exactly one field holding a non-empty array.
fn records_from_document(value: Value, field: &str) -> Vec<Record> {
    match value {
        Value::Array(items) => keep_records(items, field),
        Value::Object(mut map) if map.len() == 1 => {
            let only = map.values_mut().next().map(Value::take);
            match only {
                Some(Value::Array(items)) if !items.is_empty() => keep_records(items, field),
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn parse_with_repair(span: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(span) {
        return Some(value);
    }
    let repaired = scan::strip_trailing_commas(&scan::strip_line_comments(span));
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Parse the entire text as one document.
pub fn whole_document(text: &str, field: &str) -> Attempt {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => Attempt::from_records(records_from_document(value, field)),
        Err(_) => Attempt::NotFound,
    }
}

/// Contents of fenced code blocks tagged as JSON or untagged.
pub fn fenced_block_bodies(text: &str) -> Vec<&str> {
    const FENCE: &str = "```";
    let mut bodies = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let line_end = after_open.find('\n').unwrap_or(after_open.len());
        // inline span such as ```x```, opened and closed on one line
        if let Some(close) = after_open[..line_end].find(FENCE) {
            rest = &after_open[close + FENCE.len()..];
            continue;
        }
        if line_end == after_open.len() {
            break;
        }
        let tag = after_open[..line_end].trim().to_ascii_lowercase();
        let body_and_rest = &after_open[line_end + 1..];
        let Some(close) = body_and_rest.find(FENCE) else {
            break;
        };
        if matches!(tag.as_str(), "" | "json" | "jsonc" | "json5") {
            bodies.push(body_and_rest[..close].trim());
        }
        rest = &body_and_rest[close + FENCE.len()..];
    }
    bodies
}

/// Apply the whole-document rule to each fenced block, collecting records.
pub fn fenced_blocks(text: &str, field: &str) -> Attempt {
    let records = fenced_block_bodies(text)
        .into_iter()
        .filter(|body| body.starts_with('[') || body.starts_with('{'))
        .filter_map(|body| parse_with_repair(body))
        .flat_map(|value| records_from_document(value, field))
        .collect();
    Attempt::from_records(records)
}

/// Locate outermost complete array spans and parse the first that yields
/// records, retrying once after comment and trailing-comma repair.
pub fn balanced_spans(text: &str, field: &str) -> Attempt {
    for span in scan::scan_arrays(text).complete {
        if let Some(Value::Array(items)) = parse_with_repair(&text[span]) {
            let records = keep_records(items, field);
            if !records.is_empty() {
                return Attempt::Found(records);
            }
        }
    }
    Attempt::NotFound
}

/// Recover the complete top-level objects of an array that never closed.
/// The trailing incomplete object is discarded.
pub fn truncated_array(text: &str, field: &str) -> Attempt {
    let Some(open) = scan::scan_arrays(text).unclosed else {
        return Attempt::NotFound;
    };
    let values = scan::top_level_objects(text, open + 1)
        .into_iter()
        .filter_map(|span| parse_with_repair(&text[span]));
    Attempt::from_records(keep_records(values, field))
}

/// Any balanced object anywhere in the text that parses and carries the
/// identifying field.
pub fn object_soup(text: &str, field: &str) -> Attempt {
    let mut records = Vec::new();
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let parsed = scan::object_end(text, start)
            .and_then(|end| parse_with_repair(&text[start..end]).map(|v| (end, v)));
        match parsed {
            Some((end, Value::Object(map))) if map.contains_key(field) => {
                records.push(map);
                pos = end;
            }
            _ => pos = start + 1,
        }
    }
    Attempt::from_records(records)
}
