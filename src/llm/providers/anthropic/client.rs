//! Anthropic adapter

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::llm::providers::{classify_status, classify_transport, parse_retry_after};
use crate::llm::sse::{self, response_to_sse_stream};
use crate::llm::traits::{CallContext, ChunkStream, ModelInfo, ProviderAdapter};
use crate::llm::{
    ChatMessage, Choice, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind, ToolCall,
    Usage,
};

use super::config::{AnthropicConfig, DEFAULT_MAX_TOKENS};
use super::types::{ContentBlock, ErrorEnvelope, MessagesRequest, MessagesResponse, WireMessage, WireTool};

pub struct AnthropicAdapter {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn headers(&self) -> LLMResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| LLMError::Internal(format!("invalid api key: {e}")))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(&self.config.api_version)
                .map_err(|e| LLMError::Internal(format!("invalid api version: {e}")))?,
        );
        Ok(headers)
    }

    /// System messages move to the dedicated `system` field; tool results are
    /// folded into user turns since the uniform model carries them as text.
    fn to_wire(&self, request: &CompletionRequest, stream: bool) -> MessagesRequest {
        let mut system = None;
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                MessageRole::System => system = Some(message.content.clone()),
                MessageRole::Assistant => messages.push(WireMessage {
                    role: "assistant".into(),
                    content: message.content.clone(),
                }),
                MessageRole::User | MessageRole::Tool => messages.push(WireMessage {
                    role: "user".into(),
                    content: message.content.clone(),
                }),
            }
        }

        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| WireTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect()
        });

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream: stream.then_some(true),
            tools,
        }
    }

    fn from_wire(
        &self,
        request: &CompletionRequest,
        response: MessagesResponse,
    ) -> CompletionResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
            }
        }

        let mut message = ChatMessage::assistant(text);
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }

        CompletionResponse {
            id: response.id,
            created: chrono::Utc::now().timestamp() as u64,
            model: request.model.clone(),
            provider: ProviderKind::Anthropic,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: response
                    .stop_reason
                    .as_deref()
                    .map(FinishReason::from_provider),
            }],
            usage: Usage::new(response.usage.input_tokens, response.usage.output_tokens),
            metadata: Default::default(),
        }
    }

    async fn error_from(&self, response: reqwest::Response) -> LLMError {
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        classify_status("anthropic", status, message, retry_after)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn models(&self) -> Vec<ModelInfo> {
        super::config::available_models()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> LLMResult<CompletionResponse> {
        let url = format!("{}/v1/messages", self.config.base_url);
        debug!("anthropic completion {} model={}", ctx.request_id, request.model);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(request, false))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("anthropic", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let wire: MessagesResponse = response
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
        let url = format!("{}/v1/messages", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(&request, true))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("anthropic", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let request_id = ctx.request_id.clone();
        let model = request.model.clone();
        let cancel = ctx.cancel.clone();

        // Event translation is stateful: message_start carries the input
        // token count the terminal chunk needs.
        let events = response_to_sse_stream(response);
        let chunks = events
            .scan(sse::anthropic::EventState::default(), move |state, event| {
                let out = match event {
                    Ok(event) => {
                        sse::anthropic::event_to_chunk(&event, state, &request_id, &model)
                            .transpose()
                    }
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(Some(out))
            })
            .filter_map(futures::future::ready)
            .take_until(async move { cancel.cancelled().await });

        Ok(Box::new(Box::pin(chunks)))
    }

    async fn embed(
        &self,
        _request: &EmbeddingRequest,
        _ctx: &CallContext,
    ) -> LLMResult<EmbeddingResponse> {
        Err(LLMError::NotSupported(
            "anthropic does not provide an embeddings endpoint".into(),
        ))
    }

    async fn is_available(&self) -> bool {
        // Minimal one-token request; Anthropic has no cheap listing endpoint.
        let url = format!("{}/v1/messages", self.config.base_url);
        let headers = match self.headers() {
            Ok(headers) => headers,
            Err(_) => return false,
        };
        let probe = serde_json::json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1
        });
        self.client
            .post(&url)
            .headers(headers)
            .json(&probe)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn supports_multimodal(&self) -> bool {
        true
    }
}
