//! Scriptable mock adapter
//!
//! Backs unit tests and dry-run deployments. A mock either echoes the last
//! user message or plays back a queue of scripted outcomes, so failure
//! sequences (429 storms, mid-stream disconnects) can be rehearsed
//! deterministically.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::llm::traits::{CallContext, ChunkStream, ModelInfo, ProviderAdapter};
use crate::llm::{
    ChatMessage, Choice, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind,
    ResponseChunk, Usage,
};

/// One scripted call outcome.
pub enum MockOutcome {
    /// Succeed with this completion text.
    Reply(String),
    /// Fail before the first byte.
    Fail(LLMError),
    /// Stream these deltas, then break the stream with an error.
    ReplyThenFail(Vec<String>, LLMError),
}

pub struct MockAdapter {
    name: String,
    kind: ProviderKind,
    script: Mutex<VecDeque<MockOutcome>>,
    /// Echo the last user message when the script is exhausted.
    echo_when_empty: bool,
    calls: AtomicU32,
    available: AtomicBool,
}

impl MockAdapter {
    /// An adapter that always echoes.
    pub fn echo() -> Self {
        Self::named("mock", ProviderKind::Mock)
    }

    /// An echoing adapter under an arbitrary name and kind, so tests can
    /// stand in for real providers.
    pub fn named(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            script: Mutex::new(VecDeque::new()),
            echo_when_empty: true,
            calls: AtomicU32::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Queue outcomes; they are consumed in order before any echoing.
    pub fn push(&self, outcome: MockOutcome) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
        self
    }

    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        {
            let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
            script.extend(outcomes);
        }
        self
    }

    /// Calls observed across complete/stream/embed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn next_outcome(&self, request: &CompletionRequest) -> MockOutcome {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match scripted {
            Some(outcome) => outcome,
            None if self.echo_when_empty => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                MockOutcome::Reply(format!("echo: {last_user}"))
            }
            None => MockOutcome::Fail(LLMError::Internal("mock script exhausted".into())),
        }
    }

    fn respond(&self, request: &CompletionRequest, text: String) -> CompletionResponse {
        let prompt_tokens = (request.joined_content().len() / 4) as u32;
        let completion_tokens = (text.len() / 4).max(1) as u32;
        CompletionResponse {
            id: format!("mock-{}", request.id),
            created: chrono::Utc::now().timestamp() as u64,
            model: request.model.clone(),
            provider: self.kind.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(text),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage::new(prompt_tokens, completion_tokens),
            metadata: Default::default(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind.clone()
    }

    fn models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "mock-model".into(),
            display_name: "Mock Model".into(),
            provider: self.kind.clone(),
            context_window: 32_768,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: false,
            supports_vision: false,
            supports_embeddings: true,
            input_price_per_token: 0.0,
            output_price_per_token: 0.0,
        }]
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        _ctx: &CallContext,
    ) -> LLMResult<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_outcome(request) {
            MockOutcome::Reply(text) => Ok(self.respond(request, text)),
            MockOutcome::Fail(error) | MockOutcome::ReplyThenFail(_, error) => Err(error),
        }
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        ctx: CallContext,
    ) -> LLMResult<ChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", request.id);
        let model = request.model.clone();
        let kind = self.kind.clone();

        match self.next_outcome(&request) {
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Reply(text) => {
                let prompt_tokens = (request.joined_content().len() / 4) as u32;
                let completion_tokens = (text.len() / 4).max(1) as u32;
                let mut chunks: Vec<LLMResult<ResponseChunk>> = text
                    .split_inclusive(' ')
                    .map(|word| Ok(ResponseChunk::delta(&id, &model, kind.clone(), word)))
                    .collect();
                chunks.push(Ok(ResponseChunk::terminal(
                    &id,
                    &model,
                    kind,
                    FinishReason::Stop,
                    Some(Usage::new(prompt_tokens, completion_tokens)),
                )));
                let cancel = ctx.cancel.clone();
                Ok(Box::new(Box::pin(
                    futures::StreamExt::take_until(futures::stream::iter(chunks), async move {
                        cancel.cancelled().await
                    }),
                )))
            }
            MockOutcome::ReplyThenFail(deltas, error) => {
                let mut chunks: Vec<LLMResult<ResponseChunk>> = deltas
                    .into_iter()
                    .map(|d| Ok(ResponseChunk::delta(&id, &model, kind.clone(), d)))
                    .collect();
                chunks.push(Err(error));
                Ok(Box::new(Box::pin(futures::stream::iter(chunks))))
            }
        }
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        _ctx: &CallContext,
    ) -> LLMResult<EmbeddingResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let embeddings = request
            .input
            .iter()
            .map(|text| {
                let len = text.len() as f32;
                vec![len / 100.0, (len % 7.0) / 7.0, 0.5]
            })
            .collect();
        let prompt_tokens: u32 = request.input.iter().map(|t| (t.len() / 4) as u32).sum();
        Ok(EmbeddingResponse {
            id: format!("mock-{}", request.id),
            model: request.model.clone(),
            provider: self.kind.clone(),
            embeddings,
            usage: Usage::new(prompt_tokens, 0),
        })
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
