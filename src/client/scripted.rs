//! Scripted Backend
//!
//! Replays queued responses, or answers through a closure, and records every
//! request it sees. Used by tests to drive sessions and bucket loops without a
//! network.

use super::{ClientError, CompletionBackend, CompletionRequest, CompletionResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, ClientError> + Send + Sync>;

enum Script {
    Queue(VecDeque<Result<CompletionResponse, ClientError>>),
    Responder(Responder),
}

/// Backend returning pre-arranged responses
pub struct ScriptedBackend {
    script: Mutex<Script>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    /// Answer requests in order from `responses`; an exhausted queue yields
    /// a transport failure.
    pub fn queue(responses: Vec<Result<CompletionResponse, ClientError>>) -> Self {
        Self {
            script: Mutex::new(Script::Queue(responses.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request by calling `f`
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, ClientError> + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(Script::Responder(Box::new(f))),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every request received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ClientError> {
        self.requests.lock().push(request.clone());
        match &mut *self.script.lock() {
            Script::Queue(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::Transport("script exhausted".to_string()))),
            Script::Responder(f) => f(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChatMessage;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user(text)],
            temperature: 0.0,
            max_tokens: 10,
            json_mode: false,
            reasoning: false,
        }
    }

    #[test]
    fn test_queue_in_order_then_exhausted() {
        let backend = ScriptedBackend::queue(vec![
            Ok(CompletionResponse::stop("one")),
            Err(ClientError::EmptyBody),
        ]);
        assert_eq!(
            backend.complete(&request("a")).unwrap().content.as_deref(),
            Some("one")
        );
        assert!(matches!(
            backend.complete(&request("b")),
            Err(ClientError::EmptyBody)
        ));
        assert!(matches!(
            backend.complete(&request("c")),
            Err(ClientError::Transport(_))
        ));
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.requests()[1].messages[0].content, "b");
    }

    #[test]
    fn test_from_fn_echoes() {
        let backend = ScriptedBackend::from_fn(|req| {
            Ok(CompletionResponse::stop(req.max_tokens.to_string()))
        });
        let resp = backend.complete(&request("x")).unwrap();
        assert_eq!(resp.content.as_deref(), Some("10"));
    }
}
