//! Bucket completion loop scenarios against a scripted backend

use dialogen::bucket::{
    Bucket, BucketContext, BucketStatus, Descriptor, InstructionBuilder, LoopSettings,
};
use dialogen::client::{ClientError, CompletionBackend, CompletionResponse, Role, ScriptedBackend};
use dialogen::extract::Extractor;
use dialogen::session::{ModelVariant, Session, SessionConfig, TokenBudget};
use dialogen::store::IncompleteLog;
use dialogen::tokens::TokenEstimator;
use dialogen::validate::Validator;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

const MARKER: &str = "【完整请求总结】";

fn record(rounds: usize, tag: usize) -> Value {
    let mut turns = Vec::new();
    for i in 0..rounds {
        turns.push(json!({"from": "human", "value": format!("request {} part {}", tag, i)}));
        let answer = if i + 1 == rounds {
            format!("{}item {}", MARKER, tag)
        } else {
            "Could you tell me more?".to_string()
        };
        turns.push(json!({"from": "gpt", "value": answer}));
    }
    json!({"system": "You are a careful secretary.", "conversations": turns})
}

/// `valid` good records followed by `invalid` with the wrong round count
fn batch(rounds: usize, valid: usize, invalid: usize) -> String {
    let mut items: Vec<Value> = (0..valid).map(|i| record(rounds, i)).collect();
    items.extend((0..invalid).map(|i| record(rounds + 1, 1000 + i)));
    serde_json::to_string(&items).unwrap()
}

fn session_config(max_context_tokens: usize) -> SessionConfig {
    SessionConfig {
        model: "deepseek-reasoner".to_string(),
        variant: ModelVariant::Reasoner,
        temperature: 0.7,
        json_mode: true,
        budget: TokenBudget {
            max_context_tokens,
            ..TokenBudget::default()
        },
        estimator: TokenEstimator::default(),
    }
}

fn bucket(rounds: u32, target: usize) -> Bucket {
    Bucket {
        domain: Descriptor::new("美容美发 (Beauty_Hairdressing)", "Beauty_Hairdressing"),
        ambiguity: Descriptor::new("condition_missing（条件缺失）", "condition_missing"),
        round_line: format!("{}轮：多次追问", rounds),
        round_count: rounds,
        target,
    }
}

fn context(backend: Arc<dyn CompletionBackend>, output: &Path, max_retries: u32) -> BucketContext {
    BucketContext {
        backend,
        extractor: Extractor::default(),
        validator: Validator::new("system", MARKER),
        instructions: InstructionBuilder::new(MARKER),
        settings: LoopSettings::immediate(max_retries),
        output_dir: output.to_path_buf(),
        incomplete_log: IncompleteLog::in_dir(output),
    }
}

fn session(max_context_tokens: usize) -> Session {
    Session::new(session_config(max_context_tokens), "Generate sharegpt dialogues.")
}

#[test]
fn test_two_turns_reach_target_in_one_session() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![
        Ok(CompletionResponse::stop(batch(3, 40, 2))),
        Ok(CompletionResponse::stop(batch(3, 10, 0))),
    ]));
    let ctx = context(backend.clone(), dir.path(), 3);
    let b = bucket(3, 50);
    let mut s = session(110_000);

    let outcome = ctx.run(&mut s, &b, &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    assert_eq!(outcome.count, 50);
    assert_eq!(outcome.calls, 2);
    assert_eq!(outcome.rollovers, 0);
    assert_eq!(b.store(dir.path()).count(), 50);

    let requests = backend.requests();
    assert!(requests[0].messages[1].content.starts_with("请生成50条数据"));
    let second = &requests[1].messages;
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert_eq!(
        second[3].content,
        InstructionBuilder::new(MARKER).continuation(40, 10)
    );

    assert!(ctx.incomplete_log.entries().is_empty());
    assert_eq!(s.history().len(), 1);
}

#[test]
fn test_rollover_resends_full_instruction() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![
        Ok(CompletionResponse::stop(batch(2, 3, 0))),
        Ok(CompletionResponse::stop(batch(2, 2, 0))),
    ]));
    let ctx = context(backend.clone(), dir.path(), 3);
    // just above the continuation's output estimate, so any history overflows
    let mut s = session(6_100);

    let outcome = ctx.run(&mut s, &bucket(2, 5), &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    assert_eq!(outcome.rollovers, 1);
    let second = &backend.requests()[1].messages;
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].role, Role::System);
    assert!(second[1].content.starts_with("请生成2条数据"));
}

#[test]
fn test_retries_exhausted_marks_failed_and_logs() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::from_fn(|_| {
        Err(ClientError::Transport("connection reset".to_string()))
    }));
    let ctx = context(backend.clone(), dir.path(), 3);

    let outcome = ctx.run(&mut session(110_000), &bucket(1, 5), &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Failed);
    assert_eq!(outcome.count, 0);
    assert_eq!(backend.call_count(), 3);
    // every attempt was a fresh generation instruction, not a continuation
    for request in backend.requests() {
        assert_eq!(request.messages.len(), 2);
        assert!(request.messages[1].content.starts_with("请生成5条数据"));
    }

    let entries = ctx.incomplete_log.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].ends_with("Beauty_Hairdressing | condition_missing | 1_round | 0/5"));
}

#[test]
fn test_success_resets_retry_counter() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![
        Ok(CompletionResponse::stop("Sorry, I cannot produce that.")),
        Ok(CompletionResponse::stop("Still nothing.")),
        Ok(CompletionResponse::stop(batch(1, 1, 0))),
        Ok(CompletionResponse::stop("nope")),
        Ok(CompletionResponse::stop("nope")),
        Ok(CompletionResponse::stop(batch(1, 2, 0))),
    ]));
    let ctx = context(backend.clone(), dir.path(), 3);

    let outcome = ctx.run(&mut session(110_000), &bucket(1, 3), &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    assert_eq!(outcome.calls, 6);
    assert_eq!(outcome.count, 3);
}

#[test]
fn test_unparsed_response_is_dumped() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::from_fn(|_| {
        Ok(CompletionResponse::stop("no json here"))
    }));
    let mut ctx = context(backend, dir.path(), 2);
    ctx.settings.dump_unparsed = true;
    let b = bucket(1, 5);

    let outcome = ctx.run(&mut session(110_000), &b, &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Failed);
    let dump = std::fs::read_to_string(b.store(dir.path()).debug_path()).unwrap();
    assert_eq!(dump.matches("no json here").count(), 2);
}

#[test]
fn test_complete_store_is_skipped() {
    let dir = TempDir::new().unwrap();
    let b = bucket(2, 3);
    let existing: Vec<Value> = (0..3).map(|i| record(2, i)).collect();
    b.store(dir.path()).write_all(&existing).unwrap();

    let backend = Arc::new(ScriptedBackend::queue(vec![]));
    let ctx = context(backend.clone(), dir.path(), 3);
    let outcome = ctx.run(&mut session(110_000), &b, &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Skipped);
    assert_eq!(outcome.calls, 0);
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn test_resume_asks_only_for_missing_records() {
    let dir = TempDir::new().unwrap();
    let b = bucket(1, 5);
    let existing: Vec<Value> = (0..2).map(|i| record(1, i)).collect();
    b.store(dir.path()).write_all(&existing).unwrap();

    let backend = Arc::new(ScriptedBackend::queue(vec![Ok(CompletionResponse::stop(
        batch(1, 3, 0),
    ))]));
    let ctx = context(backend.clone(), dir.path(), 3);
    let outcome = ctx.run(&mut session(110_000), &b, &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    assert_eq!(outcome.count, 5);
    assert!(backend.requests()[0].messages[1]
        .content
        .starts_with("请生成3条数据"));
}

#[test]
fn test_reasoning_exhaustion_raises_budget() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![
        Err(ClientError::TruncatedEmptyContent {
            reasoning_tokens: 9000,
            max_tokens: 9000,
        }),
        Ok(CompletionResponse::stop(batch(1, 5, 0))),
    ]));
    let ctx = context(backend.clone(), dir.path(), 3);

    let outcome = ctx.run(&mut session(110_000), &bucket(1, 5), &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    let requests = backend.requests();
    let first = requests[0].max_tokens;
    assert_eq!(requests[1].max_tokens, (first as f64 * 1.5) as usize);
    // the unanswered instruction was replaced, not stacked
    assert_eq!(requests[1].messages.len(), 2);
}

#[test]
fn test_budget_boost_clears_after_records_arrive() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![
        Err(ClientError::TruncatedEmptyContent {
            reasoning_tokens: 9000,
            max_tokens: 9000,
        }),
        Ok(CompletionResponse::stop(batch(1, 2, 0))),
        Ok(CompletionResponse::stop(batch(1, 3, 0))),
    ]));
    let ctx = context(backend.clone(), dir.path(), 3);

    let outcome = ctx.run(&mut session(110_000), &bucket(1, 5), &AtomicBool::new(false));

    assert_eq!(outcome.status, BucketStatus::Done);
    let requests = backend.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].max_tokens > requests[0].max_tokens);
    let unboosted = session(110_000).plan_output(1, 3).max_tokens;
    assert_eq!(requests[2].max_tokens, unboosted);
}

#[test]
fn test_stop_flag_ends_after_current_turn() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::queue(vec![Ok(CompletionResponse::stop(
        batch(1, 2, 0),
    ))]));
    let ctx = context(backend.clone(), dir.path(), 3);

    let outcome = ctx.run(&mut session(110_000), &bucket(1, 5), &AtomicBool::new(true));

    assert_eq!(outcome.status, BucketStatus::Interrupted);
    assert_eq!(outcome.count, 2);
    assert_eq!(backend.call_count(), 1);
    assert!(ctx.incomplete_log.entries().is_empty());
}
