//! Streaming fan-out
//!
//! Pure transform from a provider-native chunk stream to the uniform chunk
//! sequence the transport layer consumes. Chunk order is upstream order; no
//! retries happen here (a stream that dies mid-way fails the whole call).
//! The transform guarantees at least one terminal chunk, applies the
//! completion filter to each delta, and reports accumulated totals exactly
//! once — on natural completion or when the consumer drops the stream.

use futures::StreamExt;
use std::sync::{Arc, Mutex};

use crate::llm::filter::{ContentFilter, FILTERED_PLACEHOLDER};
use crate::llm::metrics;
use crate::llm::traits::ChunkStream;
use crate::llm::{FinishReason, ProviderKind, ResponseChunk, Usage};

/// What one stream produced, as observed by the fan-out.
#[derive(Debug, Clone, Default)]
pub struct StreamTotals {
    /// Concatenation of every delta forwarded downstream.
    pub content: String,
    /// Last usage reported by the provider (providers report totals on the
    /// terminal chunk).
    pub usage: Option<Usage>,
    pub chunks: u64,
    /// True when a terminal chunk was emitted; false means the consumer
    /// dropped the stream mid-flight.
    pub completed: bool,
    pub errored: bool,
}

/// Called exactly once with the final totals.
pub type CompletionHook = Box<dyn FnOnce(StreamTotals) + Send + 'static>;

/// Fires the hook when dropped, so cancellation still reports partial usage.
struct HookGuard {
    totals: Arc<Mutex<StreamTotals>>,
    hook: Option<CompletionHook>,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            let totals = self
                .totals
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default();
            hook(totals);
        }
    }
}

/// Identity of the logical call the chunks belong to.
#[derive(Clone)]
pub struct FanOutParams {
    pub request_id: String,
    pub logical_model: String,
    pub provider: ProviderKind,
    pub filter: Arc<ContentFilter>,
    pub filter_deltas: bool,
}

/// Wrap `upstream` into the uniform sequence.
pub fn fan_out(
    upstream: ChunkStream,
    params: FanOutParams,
    hook: CompletionHook,
) -> ChunkStream {
    let totals = Arc::new(Mutex::new(StreamTotals::default()));

    let stream = async_stream::stream! {
        let mut upstream = upstream;
        let guard = HookGuard {
            totals: totals.clone(),
            hook: Some(hook),
        };

        let mut terminal_sent = false;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(mut chunk) => {
                    // Chunks leave under the logical identity, whatever the
                    // provider called them.
                    chunk.model = params.logical_model.clone();
                    chunk.provider = params.provider.clone();

                    if params.filter_deltas && !chunk.delta.is_empty() {
                        let verdict = params.filter.check_completion(&chunk.delta).await;
                        if !verdict.allowed {
                            metrics::FILTER_BLOCKED.inc();
                            chunk.delta = FILTERED_PLACEHOLDER.to_string();
                            chunk.finish_reason = Some(FinishReason::ContentFilter);
                        }
                    }

                    let is_terminal = chunk.is_terminal();
                    if let Ok(mut t) = guard.totals.lock() {
                        t.content.push_str(&chunk.delta);
                        t.chunks += 1;
                        if chunk.usage.is_some() {
                            t.usage = chunk.usage;
                        }
                        if is_terminal {
                            t.completed = true;
                        }
                    }

                    yield Ok(chunk);
                    if is_terminal {
                        terminal_sent = true;
                        break;
                    }
                }
                Err(error) => {
                    // A broken stream still ends with a terminal chunk.
                    let usage = guard.totals.lock().ok().and_then(|t| t.usage);
                    let mut chunk = ResponseChunk::terminal(
                        &params.request_id,
                        &params.logical_model,
                        params.provider.clone(),
                        FinishReason::Error,
                        usage,
                    );
                    chunk.error = Some(error.to_string());
                    if let Ok(mut t) = guard.totals.lock() {
                        t.completed = true;
                        t.errored = true;
                        t.chunks += 1;
                    }
                    yield Ok(chunk);
                    terminal_sent = true;
                    break;
                }
            }
        }

        if !terminal_sent {
            // Upstream ended without saying why.
            let usage = guard.totals.lock().ok().and_then(|t| t.usage);
            let mut chunk = ResponseChunk::terminal(
                &params.request_id,
                &params.logical_model,
                params.provider.clone(),
                FinishReason::Error,
                usage,
            );
            chunk.error = Some("stream ended without a terminal chunk".to_string());
            if let Ok(mut t) = guard.totals.lock() {
                t.completed = true;
                t.errored = true;
            }
            yield Ok(chunk);
        }

        drop(guard);
    };

    Box::new(Box::pin(stream))
}
