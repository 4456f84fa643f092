//! Cohere adapter

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::llm::providers::{classify_status, classify_transport, parse_retry_after};
use crate::llm::sse::{self, response_to_json_lines};
use crate::llm::traits::{CallContext, ChunkStream, ModelInfo, ProviderAdapter};
use crate::llm::{
    ChatMessage, Choice, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind, Usage,
};

use super::config::CohereConfig;
use super::types::{
    ChatWireRequest, ChatWireResponse, EmbedWireRequest, EmbedWireResponse, ErrorEnvelope,
    HistoryEntry,
};

pub struct CohereAdapter {
    client: Client,
    config: CohereConfig,
}

impl CohereAdapter {
    pub fn new(config: CohereConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn headers(&self) -> LLMResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| LLMError::Internal(format!("invalid api key: {e}")))?,
        );
        Ok(headers)
    }

    /// Cohere takes the latest user turn as `message` and everything earlier
    /// as `chat_history`; system turns become the preamble.
    fn to_wire(&self, request: &CompletionRequest, stream: bool) -> LLMResult<ChatWireRequest> {
        let mut preamble = None;
        let mut turns: Vec<HistoryEntry> = Vec::new();
        for message in &request.messages {
            match message.role {
                MessageRole::System => preamble = Some(message.content.clone()),
                MessageRole::User | MessageRole::Tool => turns.push(HistoryEntry {
                    role: "USER".into(),
                    message: message.content.clone(),
                }),
                MessageRole::Assistant => turns.push(HistoryEntry {
                    role: "CHATBOT".into(),
                    message: message.content.clone(),
                }),
            }
        }

        let message = match turns.pop() {
            Some(last) if last.role == "USER" => last.message,
            Some(last) => {
                turns.push(last);
                return Err(LLMError::BadRequest(
                    "conversation must end with a user message".into(),
                ));
            }
            None => {
                return Err(LLMError::BadRequest("no user message in request".into()));
            }
        };

        Ok(ChatWireRequest {
            model: request.model.clone(),
            message,
            chat_history: turns,
            preamble,
            temperature: request.temperature,
            p: request.top_p,
            max_tokens: request.max_tokens,
            stop_sequences: request.stop.clone(),
            stream: stream.then_some(true),
        })
    }

    fn from_wire(
        &self,
        request: &CompletionRequest,
        response: ChatWireResponse,
    ) -> CompletionResponse {
        let usage = response
            .meta
            .and_then(|m| m.billed_units)
            .map(|b| Usage::new(b.input_tokens, b.output_tokens))
            .unwrap_or_default();

        CompletionResponse {
            id: response.response_id,
            created: chrono::Utc::now().timestamp() as u64,
            model: request.model.clone(),
            provider: ProviderKind::Cohere,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(response.text),
                finish_reason: response
                    .finish_reason
                    .as_deref()
                    .map(FinishReason::from_provider)
                    .or(Some(FinishReason::Stop)),
            }],
            usage,
            metadata: Default::default(),
        }
    }

    async fn error_from(&self, response: reqwest::Response) -> LLMError {
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        classify_status("cohere", status, message, retry_after)
    }
}

#[async_trait]
impl ProviderAdapter for CohereAdapter {
    fn name(&self) -> &str {
        "cohere"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cohere
    }

    fn models(&self) -> Vec<ModelInfo> {
        super::config::available_models()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> LLMResult<CompletionResponse> {
        let url = format!("{}/v1/chat", self.config.base_url);
        debug!("cohere completion {} model={}", ctx.request_id, request.model);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(request, false)?)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("cohere", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let wire: ChatWireResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Parse(e.to_string()))?;
        Ok(self.from_wire(request, wire))
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        ctx: CallContext,
    ) -> LLMResult<ChunkStream> {
        let url = format!("{}/v1/chat", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(&request, true)?)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("cohere", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let request_id = ctx.request_id.clone();
        let model = request.model.clone();
        let cancel = ctx.cancel.clone();

        let lines = response_to_json_lines(response);
        let chunks = lines
            .filter_map(move |line| {
                let request_id = request_id.clone();
                let model = model.clone();
                async move {
                    match line {
                        Ok(line) => {
                            sse::cohere::line_to_chunk(&line, &request_id, &model).transpose()
                        }
                        Err(e) => Some(Err(e)),
                    }
                }
            })
            .take_until(async move { cancel.cancelled().await });

        Ok(Box::new(Box::pin(chunks)))
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        ctx: &CallContext,
    ) -> LLMResult<EmbeddingResponse> {
        let url = format!("{}/v1/embed", self.config.base_url);
        let wire = EmbedWireRequest {
            model: request.model.clone(),
            texts: request.input.clone(),
            input_type: "search_document".into(),
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&wire)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("cohere", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let wire: EmbedWireResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Parse(e.to_string()))?;

        let prompt_tokens = wire
            .meta
            .and_then(|m| m.billed_units)
            .map(|b| b.input_tokens)
            .unwrap_or(0);

        Ok(EmbeddingResponse {
            id: wire.id,
            model: request.model.clone(),
            provider: ProviderKind::Cohere,
            embeddings: wire.embeddings,
            usage: Usage::new(prompt_tokens, 0),
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/v1/models", self.config.base_url);
        let headers = match self.headers() {
            Ok(headers) => headers,
            Err(_) => return false,
        };
        self.client
            .get(&url)
            .headers(headers)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
