//! OpenAI adapter

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::llm::providers::{classify_status, classify_transport, parse_retry_after};
use crate::llm::sse::{self, response_to_sse_stream};
use crate::llm::traits::{CallContext, ChunkStream, ModelInfo, ProviderAdapter};
use crate::llm::{
    ChatMessage, Choice, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind, ToolCall,
    ToolChoice, Usage,
};

use super::config::OpenAIConfig;
use super::types::{
    ChatRequest, ChatResponse, EmbeddingWireRequest, EmbeddingWireResponse, ErrorEnvelope,
    StreamOptions, WireFunction, WireMessage, WireTool, WireToolCall,
};

pub struct OpenAIAdapter {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIAdapter {
    pub fn new(config: OpenAIConfig) -> Self {
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
        if let Some(org) = &self.config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org)
                    .map_err(|e| LLMError::Internal(format!("invalid organization: {e}")))?,
            );
        }
        Ok(headers)
    }

    fn to_wire(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        let messages = request.messages.iter().map(wire_message).collect();
        let tools = request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| WireTool {
                    tool_type: "function".into(),
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect()
        });
        let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Mode(mode) => serde_json::Value::String(mode.clone()),
            ToolChoice::Tool { name } => serde_json::json!({
                "type": "function",
                "function": { "name": name }
            }),
        });

        ChatRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            stop: request.stop.clone(),
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            tools,
            tool_choice,
            user: request.user.clone(),
        }
    }

    fn from_wire(&self, request: &CompletionRequest, response: ChatResponse) -> CompletionResponse {
        let choices = response
            .choices
            .into_iter()
            .map(|c| Choice {
                index: c.index,
                message: from_wire_message(c.message),
                finish_reason: c.finish_reason.as_deref().map(FinishReason::from_provider),
            })
            .collect();

        CompletionResponse {
            id: response.id,
            created: response.created,
            model: request.model.clone(),
            provider: ProviderKind::OpenAI,
            choices,
            usage: Usage::new(response.usage.prompt_tokens, response.usage.completion_tokens),
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
        classify_status("openai", status, message, retry_after)
    }
}

fn wire_message(message: &ChatMessage) -> WireMessage {
    WireMessage {
        role: match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
        .to_string(),
        content: message.content.clone(),
        name: message.name.clone(),
        tool_calls: message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| WireToolCall {
                    id: c.id.clone(),
                    call_type: "function".into(),
                    function: super::types::WireFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect()
        }),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn from_wire_message(message: WireMessage) -> ChatMessage {
    ChatMessage {
        role: match message.role.as_str() {
            "system" => MessageRole::System,
            "user" => MessageRole::User,
            "tool" => MessageRole::Tool,
            _ => MessageRole::Assistant,
        },
        content: message.content,
        name: message.name,
        tool_calls: message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect()
        }),
        tool_call_id: message.tool_call_id,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn models(&self) -> Vec<ModelInfo> {
        super::config::available_models()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> LLMResult<CompletionResponse> {
        let url = format!("{}/chat/completions", self.config.base_url);
        debug!("openai completion {} model={}", ctx.request_id, request.model);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(request, false))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("openai", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let wire: ChatResponse = response
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
        let url = format!("{}/chat/completions", self.config.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(&request, true))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("openai", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let model = request.model.clone();
        let cancel = ctx.cancel.clone();
        let events = response_to_sse_stream(response);
        let chunks = events
            .filter_map(move |event| {
                let model = model.clone();
                async move {
                    match event {
                        Ok(event) => {
                            sse::openai::event_to_chunk(&event, &model, ProviderKind::OpenAI)
                                .transpose()
                        }
                        Err(e) => Some(Err(e)),
                    }
                }
            })
            // Cancellation drops the upstream body, closing the connection.
            .take_until(async move { cancel.cancelled().await });

        Ok(Box::new(Box::pin(chunks)))
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        ctx: &CallContext,
    ) -> LLMResult<EmbeddingResponse> {
        let url = format!("{}/embeddings", self.config.base_url);
        let wire = EmbeddingWireRequest {
            model: request.model.clone(),
            input: request.input.clone(),
            user: request.user.clone(),
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&wire)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("openai", ctx.timeout, e))?;

        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        let wire: EmbeddingWireResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Parse(e.to_string()))?;

        let mut data = wire.data;
        data.sort_by_key(|d| d.index);
        Ok(EmbeddingResponse {
            id: request.id.to_string(),
            model: request.model.clone(),
            provider: ProviderKind::OpenAI,
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            usage: Usage::new(wire.usage.prompt_tokens, 0),
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.config.base_url);
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

    fn supports_multimodal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OpenAIAdapter {
        OpenAIAdapter::new(OpenAIConfig {
            api_key: "test-key".into(),
            ..OpenAIConfig::default()
        })
    }

    #[test]
    fn wire_request_carries_parameters() {
        let mut request = CompletionRequest::new(
            "gpt-4",
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hello"),
            ],
        );
        request.temperature = Some(0.2);
        request.max_tokens = Some(64);
        request.stop = Some(vec!["END".into()]);

        let wire = adapter().to_wire(&request, false);
        assert_eq!(wire.model, "gpt-4");
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.temperature, Some(0.2));
        assert_eq!(wire.max_tokens, Some(64));
        assert!(wire.stream.is_none());
    }

    #[test]
    fn streaming_request_asks_for_usage() {
        let request = CompletionRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        let wire = adapter().to_wire(&request, true);
        assert_eq!(wire.stream, Some(true));
        assert!(wire.stream_options.is_some());
    }

    #[test]
    fn tool_definitions_translate() {
        let mut request = CompletionRequest::new("gpt-4", vec![ChatMessage::user("weather?")]);
        request.tools = Some(vec![crate::llm::ToolDefinition {
            name: "get_weather".into(),
            description: "Look up weather".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]);
        request.tool_choice = Some(ToolChoice::Tool {
            name: "get_weather".into(),
        });

        let wire = adapter().to_wire(&request, false);
        let tools = wire.tools.unwrap();
        assert_eq!(tools[0].function.name, "get_weather");
        assert_eq!(
            wire.tool_choice.unwrap()["function"]["name"],
            "get_weather"
        );
    }

    #[test]
    fn wire_response_converts() {
        let request = CompletionRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        let wire: ChatResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "created": 1700000000,
                "model": "gpt-4-0613",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            }"#,
        )
        .unwrap();

        let response = adapter().from_wire(&request, wire);
        assert_eq!(response.model, "gpt-4");
        assert_eq!(response.provider, ProviderKind::OpenAI);
        assert_eq!(response.content(), Some("Hello!"));
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn static_model_table_is_populated() {
        let adapter = adapter();
        assert!(adapter.models().iter().any(|m| m.id == "gpt-4"));
        assert!(adapter.model("gpt-3.5-turbo").is_ok());
        assert!(matches!(
            adapter.model("missing"),
            Err(LLMError::ModelNotFound(_))
        ));
    }
}
