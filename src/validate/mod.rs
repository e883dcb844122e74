//! Record Validator
//!
//! Checks a candidate record against the sharegpt schema for a bucket's
//! round count. Pure and idempotent: validating an already filtered batch
//! keeps every record.

pub mod check;

use crate::extract::Record;
use serde_json::Value;
use thiserror::Error;

/// Key holding the turn sequence
pub const TURNS_FIELD: &str = "conversations";
/// Key holding a turn's role
pub const ROLE_FIELD: &str = "from";
/// Key holding a turn's text
pub const TEXT_FIELD: &str = "value";

/// Reasons kept per source when partitioning
pub const MAX_REASONS: usize = 5;

/// Why a record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("record is not an object")]
    NotAnObject,

    #[error("missing '{0}' field")]
    MissingIdentifyingField(String),

    #[error("missing or non-array 'conversations' field")]
    MissingTurns,

    #[error("turn {0} is not an object or has no 'from' field")]
    TurnWithoutRole(usize),

    #[error("human turns ({human}) and assistant turns ({assistant}) differ")]
    UnbalancedTurns { human: usize, assistant: usize },

    #[error("{found} rounds, expected {expected}")]
    RoundCountMismatch { found: usize, expected: usize },

    #[error("last assistant turn has no text")]
    EmptyFinalAnswer,

    #[error("last assistant turn does not start with the summary marker (starts with {0:?})")]
    MissingSummaryMarker(String),

    #[error("turn {0} breaks human/assistant alternation")]
    BrokenAlternation(usize),
}

/// A rejected record and its position in the source batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecord {
    pub index: usize,
    pub reason: InvalidReason,
}

/// Valid records plus a bounded sample of rejections
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub valid: Vec<Record>,
    pub rejected: usize,
    /// First [`MAX_REASONS`] rejections
    pub reasons: Vec<InvalidRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speaker {
    Human,
    Assistant,
    Other,
}

fn speaker(role: &str) -> Speaker {
    match role {
        "human" | "user" => Speaker::Human,
        "gpt" | "assistant" => Speaker::Assistant,
        _ => Speaker::Other,
    }
}

/// Schema checks for one bucket's records
#[derive(Debug, Clone)]
pub struct Validator {
    identifying_field: String,
    summary_marker: String,
}

impl Validator {
    pub fn new(identifying_field: impl Into<String>, summary_marker: impl Into<String>) -> Self {
        Self {
            identifying_field: identifying_field.into(),
            summary_marker: summary_marker.into(),
        }
    }

    pub fn summary_marker(&self) -> &str {
        &self.summary_marker
    }

    /// Validate any JSON value; non-objects are rejected.
    pub fn validate_value(&self, value: &Value, expected_rounds: u32) -> Result<(), InvalidReason> {
        match value {
            Value::Object(record) => self.validate(record, expected_rounds),
            _ => Err(InvalidReason::NotAnObject),
        }
    }

    /// Checks run in order and stop at the first failure.
    pub fn validate(&self, record: &Record, expected_rounds: u32) -> Result<(), InvalidReason> {
        if !record.contains_key(&self.identifying_field) {
            return Err(InvalidReason::MissingIdentifyingField(
                self.identifying_field.clone(),
            ));
        }

        let turns = record
            .get(TURNS_FIELD)
            .and_then(Value::as_array)
            .ok_or(InvalidReason::MissingTurns)?;

        let mut speakers = Vec::with_capacity(turns.len());
        for (i, turn) in turns.iter().enumerate() {
            let role = turn
                .get(ROLE_FIELD)
                .and_then(Value::as_str)
                .ok_or(InvalidReason::TurnWithoutRole(i))?;
            speakers.push(speaker(role));
        }

        let human = speakers.iter().filter(|s| **s == Speaker::Human).count();
        let assistant = speakers.iter().filter(|s| **s == Speaker::Assistant).count();
        if human != assistant {
            return Err(InvalidReason::UnbalancedTurns { human, assistant });
        }
        if human != expected_rounds as usize {
            return Err(InvalidReason::RoundCountMismatch {
                found: human,
                expected: expected_rounds as usize,
            });
        }

        let last_answer = turns
            .iter()
            .zip(&speakers)
            .rev()
            .find(|(_, s)| **s == Speaker::Assistant)
            .and_then(|(turn, _)| turn.get(TEXT_FIELD))
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
            .ok_or(InvalidReason::EmptyFinalAnswer)?;
        if !last_answer.starts_with(&self.summary_marker) {
            let head: String = last_answer.chars().take(20).collect();
            return Err(InvalidReason::MissingSummaryMarker(head));
        }

        let mut expect = Speaker::Human;
        for (i, s) in speakers.iter().enumerate() {
            if *s != expect {
                return Err(InvalidReason::BrokenAlternation(i));
            }
            expect = if expect == Speaker::Human {
                Speaker::Assistant
            } else {
                Speaker::Human
            };
        }

        Ok(())
    }

    /// Split a batch into valid records and a bounded list of rejections.
    pub fn partition(&self, records: Vec<Record>, expected_rounds: u32) -> Partition {
        let mut partition = Partition::default();
        for (index, record) in records.into_iter().enumerate() {
            match self.validate(&record, expected_rounds) {
                Ok(()) => partition.valid.push(record),
                Err(reason) => {
                    partition.rejected += 1;
                    if partition.reasons.len() < MAX_REASONS {
                        partition.reasons.push(InvalidRecord { index, reason });
                    }
                }
            }
        }
        partition
    }
}
