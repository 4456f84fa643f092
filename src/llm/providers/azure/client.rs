//! Azure OpenAI adapter
//!
//! Speaks the OpenAI chat-completions wire format against deployment-scoped
//! URLs, so the wire types and SSE translation are shared with the OpenAI
//! adapter; only addressing and authentication differ.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::llm::providers::openai::types::{
    ChatRequest, ChatResponse, EmbeddingWireRequest, EmbeddingWireResponse, ErrorEnvelope,
    StreamOptions, WireMessage,
};
use crate::llm::providers::{classify_status, classify_transport, parse_retry_after};
use crate::llm::sse::{self, response_to_sse_stream};
use crate::llm::traits::{CallContext, ChunkStream, ModelInfo, ProviderAdapter};
use crate::llm::{
    ChatMessage, Choice, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind, Usage,
};

use super::config::AzureConfig;

pub struct AzureOpenAIAdapter {
    client: Client,
    config: AzureConfig,
}

impl AzureOpenAIAdapter {
    pub fn new(config: AzureConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn headers(&self) -> LLMResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| LLMError::Internal(format!("invalid api key: {e}")))?,
        );
        Ok(headers)
    }

    fn url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.config.base_url.trim_end_matches('/'),
            deployment,
            operation,
            self.config.api_version
        )
    }

    fn to_wire(&self, request: &CompletionRequest, stream: bool) -> ChatRequest {
        ChatRequest {
            // Azure takes the model from the deployment path.
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: match m.role {
                        MessageRole::System => "system",
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                        MessageRole::Tool => "tool",
                    }
                    .to_string(),
                    content: m.content.clone(),
                    name: m.name.clone(),
                    tool_calls: None,
                    tool_call_id: m.tool_call_id.clone(),
                })
                .collect(),
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
            tools: None,
            tool_choice: None,
            user: request.user.clone(),
        }
    }

    fn from_wire(&self, request: &CompletionRequest, response: ChatResponse) -> CompletionResponse {
        CompletionResponse {
            id: response.id,
            created: response.created,
            model: request.model.clone(),
            provider: ProviderKind::AzureOpenAI,
            choices: response
                .choices
                .into_iter()
                .map(|c| Choice {
                    index: c.index,
                    message: ChatMessage::assistant(c.message.content),
                    finish_reason: c.finish_reason.as_deref().map(FinishReason::from_provider),
                })
                .collect(),
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
        classify_status("azure-openai", status, message, retry_after)
    }
}

#[async_trait]
impl ProviderAdapter for AzureOpenAIAdapter {
    fn name(&self) -> &str {
        "azure-openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureOpenAI
    }

    fn models(&self) -> Vec<ModelInfo> {
        super::config::available_models(&self.config)
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> LLMResult<CompletionResponse> {
        let deployment = self.config.deployment_for(&request.model);
        let url = self.url(&deployment, "chat/completions");
        debug!(
            "azure completion {} deployment={}",
            ctx.request_id, deployment
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(request, false))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("azure-openai", ctx.timeout, e))?;

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
        let deployment = self.config.deployment_for(&request.model);
        let url = self.url(&deployment, "chat/completions");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&self.to_wire(&request, true))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify_transport("azure-openai", ctx.timeout, e))?;

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
                        Ok(event) => sse::openai::event_to_chunk(
                            &event,
                            &model,
                            ProviderKind::AzureOpenAI,
                        )
                        .transpose(),
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
        let deployment = self.config.deployment_for(&request.model);
        let url = self.url(&deployment, "embeddings");
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
            .map_err(|e| classify_transport("azure-openai", ctx.timeout, e))?;

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
            provider: ProviderKind::AzureOpenAI,
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            usage: Usage::new(wire.usage.prompt_tokens, 0),
        })
    }

    async fn is_available(&self) -> bool {
        if self.config.base_url.is_empty() {
            return false;
        }
        // Listing deployments needs management-plane auth; probe the endpoint
        // root instead and accept any response that is not a transport error.
        self.client
            .get(self.config.base_url.trim_end_matches('/'))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Deployment;

    fn adapter() -> AzureOpenAIAdapter {
        AzureOpenAIAdapter::new(AzureConfig {
            api_key: "test-key".into(),
            base_url: "https://unit.openai.azure.com".into(),
            api_version: "2024-02-01".into(),
            timeout_seconds: 30,
            deployments: vec![Deployment {
                deployment_id: "prod-gpt4".into(),
                model_id: "gpt-4".into(),
            }],
        })
    }

    #[test]
    fn url_is_deployment_scoped() {
        let adapter = adapter();
        let deployment = adapter.config.deployment_for("gpt-4");
        assert_eq!(deployment, "prod-gpt4");
        assert_eq!(
            adapter.url(&deployment, "chat/completions"),
            "https://unit.openai.azure.com/openai/deployments/prod-gpt4/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn unmapped_model_uses_its_own_name_as_deployment() {
        assert_eq!(adapter().config.deployment_for("gpt-35"), "gpt-35");
    }

    #[test]
    fn models_reflect_deployments() {
        let models = adapter().models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "gpt-4");
        assert_eq!(models[0].provider, ProviderKind::AzureOpenAI);
    }
}
