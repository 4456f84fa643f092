//! Provider-aware response cache
//!
//! Responses are keyed by a deterministic fingerprint over the cache-relevant
//! request fields, scoped by provider so re-routing can never surface another
//! provider's output. Admission and TTL are decided by temperature; a per-key
//! single-flight group collapses concurrent identical requests into one
//! upstream call.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::llm::{CompletionRequest, CompletionResponse, LLMError, LLMResult, ProviderKind};

/// Cache admission decision for a completed request.
///
/// Streaming responses, high-temperature sampling and tool-call responses are
/// never cached. The TTL ladder: temperature ≤ 0.1 → 60 min, ≤ 0.3 → 30 min.
pub fn admission_ttl(
    request: &CompletionRequest,
    response: &CompletionResponse,
) -> Option<Duration> {
    if request.stream || response.has_tool_calls() {
        return None;
    }
    match request.temperature {
        Some(t) if t <= 0.1 => Some(Duration::from_secs(60 * 60)),
        Some(t) if t <= 0.3 => Some(Duration::from_secs(30 * 60)),
        // Unset temperature means the provider default (well above 0.3).
        _ => None,
    }
}

/// Deterministic fingerprint of a request, scoped to `provider`.
///
/// Canonical form: fixed field order, absent optionals as null, numbers in
/// shortest-representation notation, so equivalent encodings of the same
/// request collide. First 16 hex chars of SHA-256.
pub fn fingerprint(provider: &ProviderKind, request: &CompletionRequest) -> String {
    let mut canon = String::with_capacity(256);
    canon.push_str("{\"provider\":");
    push_str_json(&mut canon, &provider.to_string());
    canon.push_str(",\"model\":");
    push_str_json(&mut canon, &request.model);
    canon.push_str(",\"messages\":[");
    for (i, message) in request.messages.iter().enumerate() {
        if i > 0 {
            canon.push(',');
        }
        canon.push_str("{\"role\":");
        let role = serde_json::to_string(&message.role).unwrap_or_default();
        canon.push_str(&role);
        canon.push_str(",\"content\":");
        push_str_json(&mut canon, &message.content);
        canon.push('}');
    }
    canon.push_str("],\"temperature\":");
    push_f32(&mut canon, request.temperature);
    canon.push_str(",\"max_tokens\":");
    push_u32(&mut canon, request.max_tokens);
    canon.push_str(",\"top_p\":");
    push_f32(&mut canon, request.top_p);
    canon.push_str(",\"frequency_penalty\":");
    push_f32(&mut canon, request.frequency_penalty);
    canon.push_str(",\"presence_penalty\":");
    push_f32(&mut canon, request.presence_penalty);
    canon.push_str(",\"stop\":");
    match &request.stop {
        None => canon.push_str("null"),
        Some(stops) => {
            canon.push('[');
            for (i, stop) in stops.iter().enumerate() {
                if i > 0 {
                    canon.push(',');
                }
                push_str_json(&mut canon, stop);
            }
            canon.push(']');
        }
    }
    canon.push('}');

    let digest = Sha256::digest(canon.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn push_str_json(out: &mut String, value: &str) {
    out.push_str(&serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string()));
}

fn push_f32(out: &mut String, value: Option<f32>) {
    match value {
        // `Display` for f32 is the shortest round-trippable form, so 0.30
        // and 0.3 render identically.
        Some(v) => out.push_str(&format!("{}", v)),
        None => out.push_str("null"),
    }
}

fn push_u32(out: &mut String, value: Option<u32>) {
    match value {
        Some(v) => out.push_str(&v.to_string()),
        None => out.push_str("null"),
    }
}

/// Byte-safe cache contract; in-memory and distributed backings both fit.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Miss on absent or expired entries; never surfaces backing errors.
    async fn get(&self, key: &str) -> Option<CompletionResponse>;

    async fn set(&self, key: &str, value: CompletionResponse, ttl: Duration);

    /// Like `set`, but each read pushes the expiry out by `ttl` again.
    async fn set_sliding(&self, key: &str, value: CompletionResponse, ttl: Duration);
}

struct CacheSlot {
    value: CompletionResponse,
    expires_at: Instant,
    sliding: Option<Duration>,
}

/// Process-local cache backing.
#[derive(Default)]
pub struct InMemoryResponseCache {
    entries: DashMap<String, CacheSlot>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Called opportunistically and from the sweeper.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, slot| slot.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Option<CompletionResponse> {
        let now = Instant::now();
        let mut slot = self.entries.get_mut(key)?;
        if slot.expires_at <= now {
            drop(slot);
            self.entries.remove(key);
            return None;
        }
        if let Some(window) = slot.sliding {
            slot.expires_at = now + window;
        }
        Some(slot.value.clone())
    }

    async fn set(&self, key: &str, value: CompletionResponse, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheSlot {
                value,
                expires_at: Instant::now() + ttl,
                sliding: None,
            },
        );
    }

    async fn set_sliding(&self, key: &str, value: CompletionResponse, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheSlot {
                value,
                expires_at: Instant::now() + ttl,
                sliding: Some(ttl),
            },
        );
    }
}

type FlightResult = LLMResult<CompletionResponse>;

/// Collapses concurrent identical requests onto one upstream call.
///
/// The first caller for a key becomes the leader and performs the call; late
/// callers await the leader's result. A leader that is dropped (cancelled)
/// releases the key so a waiter can take over.
#[derive(Clone, Default)]
pub struct SingleFlight {
    inflight: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
}

/// What `SingleFlight::join` handed this caller.
pub enum Flight {
    /// This caller performs the upstream call and must `complete` the guard.
    Leader(FlightGuard),
    /// Another caller was already in flight; this is its result.
    Follower(FlightResult),
}

/// Held by the leader; completing it publishes the result to followers.
pub struct FlightGuard {
    key: String,
    group: SingleFlight,
    done: bool,
}

impl FlightGuard {
    pub fn complete(mut self, result: FlightResult) {
        self.done = true;
        if let Some((_, tx)) = self.group.inflight.remove(&self.key) {
            // Entry removed before send: anyone who finds no entry from here
            // on becomes a fresh leader; existing subscribers get the value.
            let _ = tx.send(result);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            // Leader abandoned (cancelled or panicked): free the key and let
            // waiters retry as leaders.
            self.group.inflight.remove(&self.key);
        }
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, key: &str) -> Flight {
        loop {
            let mut rx = {
                use dashmap::mapref::entry::Entry;
                match self.inflight.entry(key.to_string()) {
                    Entry::Occupied(entry) => entry.get().subscribe(),
                    Entry::Vacant(entry) => {
                        let (tx, _rx) = broadcast::channel(1);
                        entry.insert(tx);
                        return Flight::Leader(FlightGuard {
                            key: key.to_string(),
                            group: self.clone(),
                            done: false,
                        });
                    }
                }
            };

            match rx.recv().await {
                Ok(result) => return Flight::Follower(result),
                // Leader vanished without publishing; race for leadership.
                Err(_) => {
                    debug!("single-flight leader for {key} abandoned, retrying");
                    continue;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, Choice, FinishReason, MessageRole, Usage};
    use std::collections::HashMap;

    fn request(temperature: Option<f32>) -> CompletionRequest {
        let mut req = CompletionRequest::new(
            "openai.gpt-3.5-turbo",
            vec![ChatMessage::user("2+2")],
        );
        req.temperature = temperature;
        req
    }

    fn response() -> CompletionResponse {
        CompletionResponse {
            id: "resp-1".into(),
            created: 1_700_000_000,
            model: "openai.gpt-3.5-turbo".into(),
            provider: ProviderKind::OpenAI,
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new(MessageRole::Assistant, "4"),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage::new(3, 1),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_provider_scoped() {
        let req = request(Some(0.0));
        let a = fingerprint(&ProviderKind::OpenAI, &req);
        let b = fingerprint(&ProviderKind::OpenAI, &req);
        let c = fingerprint(&ProviderKind::Anthropic, &req);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_ignores_request_id_and_stream_flag() {
        let mut a = request(Some(0.2));
        let mut b = request(Some(0.2));
        b.id = uuid::Uuid::new_v4();
        a.stream = false;
        b.stream = true;
        assert_eq!(
            fingerprint(&ProviderKind::OpenAI, &a),
            fingerprint(&ProviderKind::OpenAI, &b)
        );
    }

    #[test]
    fn fingerprint_canonicalizes_float_encodings() {
        // 0.30 and 0.3 parse to the same f32; both hash identically.
        let a = request(Some(0.30));
        let b = request(Some(0.3));
        assert_eq!(
            fingerprint(&ProviderKind::OpenAI, &a),
            fingerprint(&ProviderKind::OpenAI, &b)
        );

        let c = request(None);
        assert_ne!(
            fingerprint(&ProviderKind::OpenAI, &a),
            fingerprint(&ProviderKind::OpenAI, &c)
        );
    }

    #[test]
    fn fingerprint_varies_with_content() {
        let a = request(Some(0.0));
        let mut b = request(Some(0.0));
        b.messages = vec![ChatMessage::user("2+3")];
        assert_ne!(
            fingerprint(&ProviderKind::OpenAI, &a),
            fingerprint(&ProviderKind::OpenAI, &b)
        );
    }

    #[test]
    fn admission_follows_temperature_ladder() {
        let resp = response();

        assert_eq!(
            admission_ttl(&request(Some(0.0)), &resp),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            admission_ttl(&request(Some(0.25)), &resp),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(admission_ttl(&request(Some(0.7)), &resp), None);
        assert_eq!(admission_ttl(&request(None), &resp), None);
    }

    #[test]
    fn streaming_and_tool_calls_are_not_admitted() {
        let mut req = request(Some(0.0));
        req.stream = true;
        assert_eq!(admission_ttl(&req, &response()), None);

        let mut resp = response();
        resp.choices[0].message.tool_calls = Some(vec![crate::llm::ToolCall {
            id: "call-1".into(),
            name: "lookup".into(),
            arguments: "{}".into(),
        }]);
        assert_eq!(admission_ttl(&request(Some(0.0)), &resp), None);
    }

    #[tokio::test]
    async fn cache_get_set_and_expiry() {
        let cache = InMemoryResponseCache::new();
        cache.set("k", response(), Duration::from_millis(20)).await;
        assert!(cache.get("k").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn sliding_expiration_extends_on_read() {
        let cache = InMemoryResponseCache::new();
        cache
            .set_sliding("k", response(), Duration::from_millis(60))
            .await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(cache.get("k").await.is_some(), "entry should keep sliding");
        }

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_callers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let flights = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                match flights.join("key").await {
                    Flight::Leader(guard) => {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold leadership long enough for followers to pile up.
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        let resp = response();
                        guard.complete(Ok(resp.clone()));
                        resp
                    }
                    Flight::Follower(result) => result.unwrap(),
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one upstream call");
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(flights.inflight_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_leader_releases_key() {
        let flights = SingleFlight::new();

        let guard = match flights.join("key").await {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };
        drop(guard);

        // The key is free again; the next caller leads.
        match flights.join("key").await {
            Flight::Leader(guard) => guard.complete(Err(LLMError::Internal("test".into()))),
            Flight::Follower(_) => panic!("key should have been released"),
        }
    }
}
