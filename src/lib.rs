//! Dialogen - Token-Budgeted Dialogue Corpus Generator
//!
//! Drives a chat completion API to synthesize multi-turn sharegpt dialogue
//! records, organised into buckets by (domain, ambiguity type, round count).
//! Each bucket is filled to a target count through bounded-context sessions,
//! resilient extraction of JSON records from free-form responses, and
//! schema validation, with many buckets running in parallel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  Dispatcher  │  worker pool, one bucket per worker at a time
//! └──────┬───────┘
//!        │ Bucket
//!        ▼
//! ┌──────────────┐    send     ┌──────────────────┐
//! │ Bucket loop  │────────────►│ Session          │──► CompletionBackend
//! └──────┬───────┘  ◄─ reply ──│ history + budget │
//!        │                     └──────────────────┘
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Extractor   │──►│  Validator   │──►│ RecordStore  │  append-only
//! └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use dialogen::extract::extract;
//!
//! let raw = r#"Here you go: [{"system":"a","conversations":[]},{"system":"b""#;
//! let records = extract(raw).unwrap();
//! assert_eq!(records.len(), 1);
//! ```

pub mod bucket;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod extract;
pub mod plan;
pub mod session;
pub mod store;
pub mod tokens;
pub mod validate;

pub use bucket::{Bucket, BucketContext, BucketOutcome, BucketStatus, Descriptor};
pub use client::{CompletionBackend, HttpBackend, ScriptedBackend};
pub use config::{ConfigError, DialogenConfig};
pub use dispatch::{DispatchSummary, Dispatcher};
pub use extract::{Extractor, Record};
pub use plan::GenerationPlan;
pub use session::{ModelVariant, Session, SessionConfig};
pub use store::{IncompleteLog, RecordStore};
pub use validate::Validator;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
