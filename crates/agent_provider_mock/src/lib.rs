//! Deterministic scripted implementation of the shared `agent_provider` contract.
//!
//! This crate contains no transport/protocol logic and is intended for local
//! development and contract-level integration testing. Each request consumes
//! the next scripted response; the response text is streamed back in
//! whitespace-delimited chunks.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use agent_provider::{
    is_cancelled, CancelSignal, CompletionEvent, CompletionProvider, CompletionRequest,
    ProviderProfile,
};

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// One scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Text(String),
    Failure(String),
}

/// Deterministic provider used by `coding_agent` tests and offline runs.
#[derive(Debug)]
pub struct ScriptedProvider {
    model_id: Mutex<String>,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Creates a provider that answers requests with `replies` in order.
    #[must_use]
    pub fn new(replies: Vec<String>) -> Self {
        Self::with_script(replies.into_iter().map(ScriptedReply::Text).collect())
    }

    #[must_use]
    pub fn with_script(replies: Vec<ScriptedReply>) -> Self {
        Self {
            model_id: Mutex::new("mock".to_string()),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues another reply behind the existing script.
    pub fn push_reply(&self, reply: ScriptedReply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    /// Requests received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn remaining_replies(&self) -> usize {
        lock_unpoisoned(&self.replies).len()
    }
}

impl Default for ScriptedProvider {
    /// An offline plan that only inspects the workspace.
    fn default() -> Self {
        Self::new(vec![concat!(
            "{\"summary\": \"Inspect the workspace\", \"steps\": [",
            "{\"tool\": \"search_text\", \"parameters\": {\"query\": \"TODO\", \"scope\": \".\"}, ",
            "\"rationale\": \"Find outstanding work markers\"}",
            "]}"
        )
        .to_string()])
    }
}

impl CompletionProvider for ScriptedProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: lock_unpoisoned(&self.model_id).clone(),
        }
    }

    fn select_model(&self, model_id: &str) -> Result<ProviderProfile, String> {
        let trimmed = model_id.trim();
        if trimmed.is_empty() {
            return Err("Model id must not be empty".to_string());
        }
        *lock_unpoisoned(&self.model_id) = trimmed.to_string();
        Ok(self.profile())
    }

    fn complete(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(CompletionEvent),
    ) -> Result<(), String> {
        let request_id = req.request_id;
        lock_unpoisoned(&self.requests).push(req);

        emit(CompletionEvent::Started { request_id });

        let Some(reply) = lock_unpoisoned(&self.replies).pop_front() else {
            emit(CompletionEvent::Failed {
                request_id,
                error: "mock script exhausted".to_string(),
            });
            return Ok(());
        };

        let text = match reply {
            ScriptedReply::Text(text) => text,
            ScriptedReply::Failure(error) => {
                emit(CompletionEvent::Failed { request_id, error });
                return Ok(());
            }
        };

        let mut pending_token = String::new();
        for ch in text.chars() {
            pending_token.push(ch);

            if ch.is_whitespace() {
                if is_cancelled(&cancel) {
                    emit(CompletionEvent::Cancelled { request_id });
                    return Ok(());
                }
                emit(CompletionEvent::Chunk {
                    request_id,
                    text: std::mem::take(&mut pending_token),
                });
            }
        }

        if !pending_token.is_empty() {
            emit(CompletionEvent::Chunk {
                request_id,
                text: pending_token,
            });
        }

        if is_cancelled(&cancel) {
            emit(CompletionEvent::Cancelled { request_id });
        } else {
            emit(CompletionEvent::Finished { request_id });
        }

        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
