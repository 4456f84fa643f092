//! Streaming wire-format parsing
//!
//! Providers stream either SSE (`data: ...` frames separated by blank lines)
//! or newline-delimited JSON. The incremental parsers here buffer partial
//! network chunks and yield complete events; the per-provider submodules
//! translate native events into the uniform [`ResponseChunk`].

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::llm::{LLMError, LLMResult, ProviderKind, ResponseChunk};

/// One server-sent event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed raw bytes, get complete events.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a network chunk into zero or more complete events. Partial
    /// events stay buffered for the next chunk.
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> LLMResult<Vec<SseEvent>> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| LLMError::Parse(format!("invalid utf-8 in event stream: {e}")))?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn parse_block(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut data_lines = Vec::new();

        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            match line.split_once(':') {
                Some(("event", value)) => event_type = Some(value.trim_start().to_string()),
                Some(("data", value)) => data_lines.push(value.trim_start().to_string()),
                Some(_) => {}
                None => data_lines.push(line.to_string()),
            }
        }

        if event_type.is_none() && data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}

/// Incremental newline-delimited JSON parser (Cohere-style streams).
#[derive(Default)]
pub struct JsonLineParser {
    buffer: String,
}

impl JsonLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_chunk(&mut self, chunk: &[u8]) -> LLMResult<Vec<String>> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| LLMError::Parse(format!("invalid utf-8 in json-line stream: {e}")))?;
        self.buffer.push_str(text);

        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim().to_string();
            self.buffer.drain(..newline + 1);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

/// Turn a streaming HTTP response body into an SSE event stream.
pub fn response_to_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = LLMResult<SseEvent>> + Send + Unpin {
    let mut parser = SseParser::new();
    Box::pin(
        response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => parser.parse_chunk(&bytes),
                Err(e) => Err(LLMError::Network(e.to_string())),
            })
            .flat_map(|result| {
                futures::stream::iter(match result {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            }),
    )
}

/// Turn a streaming HTTP response body into a JSON-line stream.
pub fn response_to_json_lines(
    response: reqwest::Response,
) -> impl Stream<Item = LLMResult<String>> + Send + Unpin {
    let mut parser = JsonLineParser::new();
    Box::pin(
        response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => parser.parse_chunk(&bytes),
                Err(e) => Err(LLMError::Network(e.to_string())),
            })
            .flat_map(|result| {
                futures::stream::iter(match result {
                    Ok(lines) => lines.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                })
            }),
    )
}

/// OpenAI-compatible SSE translation (also used by the Azure adapter).
pub mod openai {
    use super::*;
    use crate::llm::{FinishReason, Usage};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct StreamChunk {
        pub id: String,
        pub model: String,
        #[serde(default)]
        pub choices: Vec<StreamChoice>,
        #[serde(default)]
        pub usage: Option<StreamUsage>,
    }

    #[derive(Debug, Deserialize)]
    pub struct StreamChoice {
        pub delta: Delta,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Delta {
        #[serde(default)]
        pub content: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct StreamUsage {
        pub prompt_tokens: u32,
        pub completion_tokens: u32,
    }

    /// One SSE event into at most one uniform chunk. `[DONE]` and empty
    /// frames yield `None`.
    pub fn event_to_chunk(
        event: &SseEvent,
        logical_model: &str,
        provider: ProviderKind,
    ) -> LLMResult<Option<ResponseChunk>> {
        let data = event.data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(None);
        }

        let parsed: StreamChunk = serde_json::from_str(data)
            .map_err(|e| LLMError::Parse(format!("malformed stream chunk: {e}")))?;

        let usage = parsed
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));

        let Some(choice) = parsed.choices.first() else {
            // Usage-only frame at end of stream.
            if let Some(usage) = usage {
                let mut chunk =
                    ResponseChunk::delta(&parsed.id, logical_model, provider, "");
                chunk.usage = Some(usage);
                return Ok(Some(chunk));
            }
            return Ok(None);
        };

        let mut chunk = ResponseChunk::delta(
            &parsed.id,
            logical_model,
            provider,
            choice.delta.content.clone().unwrap_or_default(),
        );
        chunk.finish_reason = choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_provider);
        chunk.usage = usage;
        Ok(Some(chunk))
    }
}

/// Anthropic typed-event SSE translation.
pub mod anthropic {
    use super::*;
    use crate::llm::{FinishReason, Usage};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum StreamEvent {
        #[serde(rename = "ping")]
        Ping,
        #[serde(rename = "message_start")]
        MessageStart { message: MessageStart },
        #[serde(rename = "content_block_start")]
        ContentBlockStart,
        #[serde(rename = "content_block_delta")]
        ContentBlockDelta { delta: ContentDelta },
        #[serde(rename = "content_block_stop")]
        ContentBlockStop,
        #[serde(rename = "message_delta")]
        MessageDelta { delta: MessageDelta, usage: Option<DeltaUsage> },
        #[serde(rename = "message_stop")]
        MessageStop,
        #[serde(rename = "error")]
        Error { error: StreamError },
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageStart {
        pub id: String,
        pub usage: Option<StartUsage>,
    }

    #[derive(Debug, Deserialize)]
    pub struct StartUsage {
        pub input_tokens: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct ContentDelta {
        #[serde(default)]
        pub text: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct MessageDelta {
        pub stop_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct DeltaUsage {
        pub output_tokens: u32,
    }

    #[derive(Debug, Deserialize)]
    pub struct StreamError {
        pub message: String,
    }

    /// Carries the input-token count from `message_start` to the terminal
    /// chunk, where Anthropic reports output tokens.
    #[derive(Debug, Default)]
    pub struct EventState {
        pub message_id: Option<String>,
        pub input_tokens: u32,
    }

    pub fn event_to_chunk(
        event: &SseEvent,
        state: &mut EventState,
        request_id: &str,
        logical_model: &str,
    ) -> LLMResult<Option<ResponseChunk>> {
        let data = event.data.trim();
        if data.is_empty() {
            return Ok(None);
        }

        let parsed: StreamEvent = serde_json::from_str(data)
            .map_err(|e| LLMError::Parse(format!("malformed stream event: {e}")))?;

        let id = state
            .message_id
            .clone()
            .unwrap_or_else(|| request_id.to_string());

        match parsed {
            StreamEvent::Ping
            | StreamEvent::ContentBlockStart
            | StreamEvent::ContentBlockStop
            | StreamEvent::MessageStop => Ok(None),
            StreamEvent::MessageStart { message } => {
                state.message_id = Some(message.id);
                state.input_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                Ok(None)
            }
            StreamEvent::ContentBlockDelta { delta } => Ok(delta.text.map(|text| {
                ResponseChunk::delta(&id, logical_model, ProviderKind::Anthropic, text)
            })),
            StreamEvent::MessageDelta { delta, usage } => {
                let Some(stop_reason) = delta.stop_reason else {
                    return Ok(None);
                };
                let usage = usage.map(|u| Usage::new(state.input_tokens, u.output_tokens));
                Ok(Some(ResponseChunk::terminal(
                    &id,
                    logical_model,
                    ProviderKind::Anthropic,
                    FinishReason::from_provider(&stop_reason),
                    usage,
                )))
            }
            StreamEvent::Error { error } => Err(LLMError::Upstream {
                provider: "anthropic".into(),
                status: 0,
                message: error.message,
            }),
        }
    }
}

/// Cohere JSON-line translation.
pub mod cohere {
    use super::*;
    use crate::llm::{FinishReason, Usage};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct StreamLine {
        pub event_type: String,
        #[serde(default)]
        pub text: Option<String>,
        #[serde(default)]
        pub finish_reason: Option<String>,
        #[serde(default)]
        pub response: Option<FinalResponse>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FinalResponse {
        #[serde(default)]
        pub meta: Option<Meta>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Meta {
        #[serde(default)]
        pub billed_units: Option<BilledUnits>,
    }

    #[derive(Debug, Deserialize)]
    pub struct BilledUnits {
        #[serde(default)]
        pub input_tokens: u32,
        #[serde(default)]
        pub output_tokens: u32,
    }

    pub fn line_to_chunk(
        line: &str,
        request_id: &str,
        logical_model: &str,
    ) -> LLMResult<Option<ResponseChunk>> {
        let parsed: StreamLine = serde_json::from_str(line)
            .map_err(|e| LLMError::Parse(format!("malformed stream line: {e}")))?;

        match parsed.event_type.as_str() {
            "stream-start" => Ok(None),
            "text-generation" => Ok(parsed.text.map(|text| {
                ResponseChunk::delta(request_id, logical_model, ProviderKind::Cohere, text)
            })),
            "stream-end" => {
                let usage = parsed
                    .response
                    .and_then(|r| r.meta)
                    .and_then(|m| m.billed_units)
                    .map(|b| Usage::new(b.input_tokens, b.output_tokens));
                let reason = parsed
                    .finish_reason
                    .as_deref()
                    .map(FinishReason::from_provider)
                    .unwrap_or(FinishReason::Stop);
                Ok(Some(ResponseChunk::terminal(
                    request_id,
                    logical_model,
                    ProviderKind::Cohere,
                    reason,
                    usage,
                )))
            }
            other => {
                debug!("ignoring cohere stream event {other}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FinishReason;

    #[test]
    fn sse_parser_handles_complete_events() {
        let mut parser = SseParser::new();
        let events = parser
            .parse_chunk(b"event: message\ndata: hello\n\ndata: world\n\n")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "world");
    }

    #[test]
    fn sse_parser_buffers_partial_events() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: par").unwrap().is_empty());
        assert!(parser.parse_chunk(b"tial").unwrap().is_empty());
        let events = parser.parse_chunk(b"\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn sse_parser_skips_comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser
            .parse_chunk(b": keepalive\r\ndata: x\r\n\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn json_line_parser_splits_on_newlines() {
        let mut parser = JsonLineParser::new();
        assert!(parser.parse_chunk(b"{\"a\":1").unwrap().is_empty());
        let lines = parser.parse_chunk(b"}\n{\"b\":2}\n").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn openai_delta_translates() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"id":"c1","model":"gpt-4","choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#.into(),
        };
        let chunk = openai::event_to_chunk(&event, "openai.gpt-4", ProviderKind::OpenAI)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "Hi");
        assert_eq!(chunk.model, "openai.gpt-4");
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn openai_done_frame_is_skipped() {
        let event = SseEvent {
            event_type: None,
            data: "[DONE]".into(),
        };
        assert!(openai::event_to_chunk(&event, "m", ProviderKind::OpenAI)
            .unwrap()
            .is_none());
    }

    #[test]
    fn openai_finish_reason_maps() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"id":"c1","model":"gpt-4","choices":[{"delta":{},"finish_reason":"length"}]}"#.into(),
        };
        let chunk = openai::event_to_chunk(&event, "m", ProviderKind::OpenAI)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn anthropic_event_sequence_translates() {
        let mut state = anthropic::EventState::default();

        let start = SseEvent {
            event_type: Some("message_start".into()),
            data: r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":12}}}"#.into(),
        };
        assert!(anthropic::event_to_chunk(&start, &mut state, "req", "anthropic.claude-3-sonnet")
            .unwrap()
            .is_none());

        let delta = SseEvent {
            event_type: Some("content_block_delta".into()),
            data: r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#.into(),
        };
        let chunk =
            anthropic::event_to_chunk(&delta, &mut state, "req", "anthropic.claude-3-sonnet")
                .unwrap()
                .unwrap();
        assert_eq!(chunk.delta, "Hello");
        assert_eq!(chunk.id, "msg_1");

        let end = SseEvent {
            event_type: Some("message_delta".into()),
            data: r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#.into(),
        };
        let terminal =
            anthropic::event_to_chunk(&end, &mut state, "req", "anthropic.claude-3-sonnet")
                .unwrap()
                .unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        let usage = terminal.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 7);
    }

    #[test]
    fn anthropic_error_event_is_an_error() {
        let mut state = anthropic::EventState::default();
        let event = SseEvent {
            event_type: Some("error".into()),
            data: r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#.into(),
        };
        assert!(anthropic::event_to_chunk(&event, &mut state, "req", "m").is_err());
    }

    #[test]
    fn cohere_lines_translate() {
        assert!(cohere::line_to_chunk(r#"{"event_type":"stream-start"}"#, "r", "m")
            .unwrap()
            .is_none());

        let chunk = cohere::line_to_chunk(
            r#"{"event_type":"text-generation","text":"Bonjour"}"#,
            "r",
            "cohere.command-r",
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.delta, "Bonjour");

        let terminal = cohere::line_to_chunk(
            r#"{"event_type":"stream-end","finish_reason":"COMPLETE","response":{"meta":{"billed_units":{"input_tokens":4,"output_tokens":2}}}}"#,
            "r",
            "cohere.command-r",
        )
        .unwrap()
        .unwrap();
        assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
        assert_eq!(terminal.usage.unwrap().total_tokens, 6);
    }
}
