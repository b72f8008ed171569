//! Usage enrichment: TTL-cached, retried cost lookup for completions.
//!
//! [`UsageEnrichmentMiddleware`] guarantees that every response carrying
//! a completion id terminates with at most one authoritative usage
//! message. Provider-supplied inline usage wins outright; otherwise a
//! buffered provider usage message is enhanced with cost data from the
//! generation endpoint, and when the provider supplied nothing, a usage
//! message is synthesized from the endpoint alone. Endpoint failures
//! degrade silently: a run never fails because cost data is missing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::message::{Message, MessageCommon, Metadata, UsageMessage};
use crate::middleware::{AgentMiddleware, MiddlewareContext};
use crate::options::GenerateReplyOptions;
use crate::provider::{MessageStream, ProviderAgent};
use crate::usage::Usage;

/// Environment variable overriding the cache TTL, in whole seconds.
pub const USAGE_CACHE_TTL_ENV: &str = "USAGE_CACHE_TTL_SEC";

const DEFAULT_TTL_SECS: u64 = 300;

/// Marker written into `extra_properties` by the enhancement path.
const ENHANCED_BY: &str = "openrouter_middleware";

fn parse_ttl(raw: Option<String>) -> Duration {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map_or(Duration::from_secs(DEFAULT_TTL_SECS), Duration::from_secs)
}

struct CacheInner {
    entries: Mutex<HashMap<String, (Usage, Instant)>>,
    ttl: Duration,
}

/// A TTL cache mapping completion ids to authoritative usage.
///
/// Eviction is lazy on read; an optional periodic sweep can be attached
/// with [`UsageCache::with_sweep`]. The sweep task is aborted on drop.
pub struct UsageCache {
    inner: Arc<CacheInner>,
    sweeper: Option<JoinHandle<()>>,
}

impl UsageCache {
    /// Creates a cache with the TTL from `USAGE_CACHE_TTL_SEC`, falling
    /// back to 300 seconds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(parse_ttl(std::env::var(USAGE_CACHE_TTL_ENV).ok()))
    }

    /// Creates a cache with an explicit TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                ttl,
            }),
            sweeper: None,
        }
    }

    /// Attaches a periodic sweep that drops expired entries.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_sweep(mut self, period: Duration) -> Self {
        let inner = Arc::clone(&self.inner);
        self.sweeper = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if let Ok(mut entries) = inner.entries.lock() {
                    let ttl = inner.ttl;
                    entries.retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
                }
            }
        }));
        self
    }

    /// Looks up a completion id; `None` when absent or expired.
    #[must_use]
    pub fn try_get(&self, completion_id: &str) -> Option<Usage> {
        let mut entries = self.inner.entries.lock().ok()?;
        match entries.get(completion_id) {
            Some((usage, stored_at)) if stored_at.elapsed() < self.inner.ttl => {
                Some(usage.clone())
            }
            Some(_) => {
                entries.remove(completion_id);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces an entry, refreshing its TTL.
    pub fn set(&self, completion_id: impl Into<String>, usage: Usage) {
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.insert(completion_id.into(), (usage, Instant::now()));
        }
    }

    /// Stops the background sweep, if one was attached.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UsageCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for UsageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageCache")
            .field("ttl", &self.inner.ttl)
            .field("sweeping", &self.sweeper.is_some())
            .finish()
    }
}

/// Authoritative generation data returned by the cost endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationCost {
    /// Prompt tokens billed.
    #[serde(default)]
    pub tokens_prompt: u32,

    /// Completion tokens billed.
    #[serde(default)]
    pub tokens_completion: u32,

    /// Total cost in account currency.
    #[serde(default)]
    pub total_cost: f64,

    /// Model that served the generation.
    #[serde(default)]
    pub model: Option<String>,

    /// Generation wall time reported by the endpoint.
    #[serde(default)]
    pub generation_time: Option<f64>,

    /// Whether the generation was streamed.
    #[serde(default)]
    pub streamed: Option<bool>,

    /// Endpoint-reported creation timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
}

impl GenerationCost {
    /// Maps the endpoint response into a [`Usage`] payload.
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        let mut usage = Usage::new(self.tokens_prompt, self.tokens_completion)
            .with_cost(self.total_cost)
            .with_extra("is_cached", false);
        if let Some(model) = &self.model {
            usage = usage.with_extra("model", model.clone());
        }
        if let Some(generation_time) = self.generation_time {
            usage = usage.with_extra("generation_time", generation_time);
        }
        if let Some(streamed) = self.streamed {
            usage = usage.with_extra("streamed", streamed);
        }
        if let Some(created_at) = &self.created_at {
            usage = usage.with_extra("created_at", created_at.clone());
        }
        usage
    }
}

/// Looks up authoritative cost data for a completion id.
#[async_trait]
pub trait CostLookup: Send + Sync {
    /// Fetches generation data for `completion_id`.
    async fn generation_cost(&self, completion_id: &str) -> Result<GenerationCost>;
}

#[derive(Debug, Deserialize)]
struct GenerationEnvelope {
    data: GenerationCost,
}

/// HTTP client for a `GET {base}/generation?id={completion_id}` cost
/// endpoint with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpCostClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCostClient {
    /// Creates a client for the given endpoint base and API key.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CostLookup for HttpCostClient {
    async fn generation_cost(&self, completion_id: &str) -> Result<GenerationCost> {
        let url = format!(
            "{}/generation?id={}",
            self.base_url.trim_end_matches('/'),
            completion_id
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::transport(format!(
                "cost endpoint returned {status}"
            )));
        }

        let envelope: GenerationEnvelope = response
            .json()
            .await
            .map_err(|e| AgentError::transport(format!("unparseable cost response: {e}")))?;
        Ok(envelope.data)
    }
}

/// Retry bounds for the cost endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts (1 initial + retries).
    pub attempts: u32,

    /// Gap between attempts.
    pub delay: Duration,

    /// Per-attempt deadline on the streaming path.
    pub timeout_streaming: Duration,

    /// Per-attempt deadline on the unary path.
    pub timeout_unary: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 7,
            delay: Duration::from_millis(500),
            timeout_streaming: Duration::from_millis(3000),
            timeout_unary: Duration::from_millis(5000),
        }
    }
}

/// How to reconcile multiple provider usage messages in one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UsagePolicy {
    /// Keep the last usage message observed (provider convention).
    #[default]
    KeepLast,
    /// Keep the first usage message observed.
    KeepFirst,
    /// Sum token counts and costs across all usage messages.
    Sum,
}

/// Streaming middleware that enriches responses with authoritative usage.
pub struct UsageEnrichmentMiddleware {
    cost: Arc<dyn CostLookup>,
    cache: Arc<UsageCache>,
    retry: RetryPolicy,
    policy: UsagePolicy,
}

impl UsageEnrichmentMiddleware {
    /// Creates the middleware with its own cache and default retries.
    #[must_use]
    pub fn new(cost: Arc<dyn CostLookup>) -> Self {
        Self {
            cost,
            cache: Arc::new(UsageCache::new()),
            retry: RetryPolicy::default(),
            policy: UsagePolicy::default(),
        }
    }

    /// Uses a shared cache (e.g. one cache across middleware instances).
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<UsageCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the multiple-usage-message policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: UsagePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Injects `{"usage": {"include": true}}` into the request's extra
    /// properties, merging with any existing usage config key-by-key.
    fn inject_usage_flag(options: &mut GenerateReplyOptions) {
        let mut usage_cfg = match options.extra_properties.get("usage") {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Metadata::new(),
        };
        usage_cfg.insert("include".to_owned(), Value::Bool(true));
        options
            .extra_properties
            .insert("usage".to_owned(), Value::Object(usage_cfg));
    }
}

impl std::fmt::Debug for UsageEnrichmentMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageEnrichmentMiddleware")
            .field("retry", &self.retry)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Per-response state accumulated while the inner stream is forwarded.
#[derive(Debug, Default)]
struct ResponseState {
    buffered: Option<Usage>,
    buffered_common: Option<MessageCommon>,
    inline: Option<Usage>,
    last_common: Option<MessageCommon>,
    policy: UsagePolicy,
}

impl ResponseState {
    fn with_policy(policy: UsagePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Records whatever the message contributes to the final usage.
    fn observe(&mut self, message: &Message) {
        self.last_common = Some(message.common().clone());

        if let Some(meta) = &message.common().metadata
            && let Some(inline) = inline_usage(meta)
        {
            self.inline = Some(inline);
        }

        if let Some(usage) = message.usage_payload() {
            let keep_existing =
                self.policy == UsagePolicy::KeepFirst && self.buffered.is_some();
            self.buffered = Some(match (self.policy, self.buffered.take()) {
                (UsagePolicy::KeepFirst, Some(existing)) => existing,
                (UsagePolicy::Sum, Some(existing)) => sum_usage(&existing, usage),
                _ => usage.clone(),
            });
            if !keep_existing {
                self.buffered_common = Some(message.common().clone());
            }
        }
    }

    /// Resolves the completion id: generation id first, then the
    /// `completion_id` and `id` metadata keys, on the buffered usage
    /// message and then the last message observed.
    fn completion_id(&self) -> Option<String> {
        for common in [self.buffered_common.as_ref(), self.last_common.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(id) = &common.generation_id {
                return Some(id.clone());
            }
            for key in ["completion_id", "id"] {
                if let Some(Value::String(id)) = common.meta(key) {
                    return Some(id.clone());
                }
            }
        }
        None
    }
}

fn inline_usage(meta: &Metadata) -> Option<Usage> {
    for key in ["inline_usage", "usage"] {
        if let Some(value) = meta.get(key)
            && let Ok(usage) = serde_json::from_value::<Usage>(value.clone())
            && usage.total_tokens > 0
        {
            return Some(usage);
        }
    }
    None
}

fn sum_usage(a: &Usage, b: &Usage) -> Usage {
    let mut summed = Usage::new(
        a.prompt_tokens + b.prompt_tokens,
        a.completion_tokens + b.completion_tokens,
    );
    summed.total_cost = match (a.total_cost, b.total_cost) {
        (Some(x), Some(y)) => Some(x + y),
        (x, y) => x.or(y),
    };
    summed.extra = a.extra.clone();
    for (key, value) in &b.extra {
        summed.extra.insert(key.clone(), value.clone());
    }
    summed
}

/// Outcome of a cost lookup, with cache provenance.
struct CostHit {
    usage: Usage,
    cached: bool,
}

/// Consults the cache, then the endpoint with bounded retries.
///
/// Exhaustion logs one structured warning and yields `None`.
async fn lookup_cost(
    cost: &Arc<dyn CostLookup>,
    cache: &Arc<UsageCache>,
    retry: RetryPolicy,
    per_attempt: Duration,
    completion_id: &str,
) -> Option<CostHit> {
    if let Some(usage) = cache.try_get(completion_id) {
        debug!(completion_id, "usage cache hit");
        return Some(CostHit {
            usage,
            cached: true,
        });
    }

    let mut last_error = String::new();
    for attempt in 1..=retry.attempts {
        match tokio::time::timeout(per_attempt, cost.generation_cost(completion_id)).await {
            Ok(Ok(data)) => {
                let usage = data.to_usage();
                cache.set(completion_id, usage.clone());
                return Some(CostHit {
                    usage,
                    cached: false,
                });
            }
            Ok(Err(error)) => last_error = error.to_string(),
            Err(_) => last_error = format!("attempt deadline {per_attempt:?} exceeded"),
        }
        if attempt < retry.attempts {
            tokio::time::sleep(retry.delay).await;
        }
    }

    warn!(
        counter = "usage_middleware_failure",
        completion_id,
        attempts = retry.attempts,
        error = %last_error,
        "abandoning usage enrichment after exhausting cost endpoint retries"
    );
    None
}

/// Builds the final usage message for a finished response, or `None`
/// when the response cannot be attributed or enrichment failed with
/// nothing buffered.
async fn finalize(
    state: ResponseState,
    cost: &Arc<dyn CostLookup>,
    cache: &Arc<UsageCache>,
    retry: RetryPolicy,
    per_attempt: Duration,
    options: &GenerateReplyOptions,
) -> Option<Message> {
    let completion_id = state.completion_id()?;

    // Provider-supplied inline usage is authoritative as-is.
    if let Some(inline) = state.inline {
        let usage = inline
            .with_extra("source", "inline")
            .with_extra("is_cached", false);
        return Some(usage_message(usage, &completion_id, options));
    }

    if let Some(buffered) = state.buffered {
        if buffered.total_tokens > 0 && buffered.total_cost.is_some() {
            // Already costed upstream; nothing to add.
            return Some(usage_message(buffered, &completion_id, options));
        }
        if buffered.total_tokens > 0 {
            // Enhancement: merge authoritative endpoint data over the
            // provider counts, preferring the endpoint on disagreement.
            let Some(hit) = lookup_cost(cost, cache, retry, per_attempt, &completion_id).await
            else {
                // Endpoint unreachable; the provider counts still stand.
                return Some(usage_message(buffered, &completion_id, options));
            };

            let mut discrepancies = false;
            for (field, ours, theirs) in [
                ("prompt_tokens", buffered.prompt_tokens, hit.usage.prompt_tokens),
                (
                    "completion_tokens",
                    buffered.completion_tokens,
                    hit.usage.completion_tokens,
                ),
            ] {
                if ours != 0 && theirs != 0 && ours != theirs {
                    discrepancies = true;
                    warn!(
                        completion_id = %completion_id,
                        field,
                        provider = ours,
                        endpoint = theirs,
                        "token count disagreement; using endpoint value"
                    );
                }
            }

            let mut merged = buffered
                .merge(&hit.usage)
                .with_extra("enhanced_by", ENHANCED_BY)
                .with_extra("is_cached", hit.cached);
            if discrepancies {
                merged = merged
                    .with_extra("token_discrepancies_resolved", true)
                    .with_extra("resolution_strategy", "used_openrouter_values");
            }
            return Some(usage_message(merged, &completion_id, options));
        }
    }

    // Fallback: nothing usable from the provider; synthesize entirely
    // from the endpoint.
    let hit = lookup_cost(cost, cache, retry, per_attempt, &completion_id).await?;
    let usage = hit.usage.with_extra("is_cached", hit.cached);
    Some(usage_message(usage, &completion_id, options))
}

fn usage_message(usage: Usage, completion_id: &str, options: &GenerateReplyOptions) -> Message {
    Message::Usage(UsageMessage {
        usage,
        common: MessageCommon {
            generation_id: Some(completion_id.to_owned()),
            run_id: options.run_id.clone(),
            thread_id: options.thread_id.clone(),
            parent_run_id: options.parent_run_id.clone(),
            ..MessageCommon::default()
        },
    })
}

#[async_trait]
impl AgentMiddleware for UsageEnrichmentMiddleware {
    async fn invoke(
        &self,
        mut ctx: MiddlewareContext,
        next: &dyn ProviderAgent,
    ) -> Result<Vec<Message>> {
        Self::inject_usage_flag(&mut ctx.options);

        let reply = next.generate_reply(ctx.messages, &ctx.options).await?;
        let mut state = ResponseState::with_policy(self.policy);
        let mut forwarded = Vec::with_capacity(reply.len() + 1);
        for message in reply {
            state.observe(&message);
            if message.usage_payload().is_none() {
                forwarded.push(message);
            }
        }

        if let Some(final_usage) = finalize(
            state,
            &self.cost,
            &self.cache,
            self.retry,
            self.retry.timeout_unary,
            &ctx.options,
        )
        .await
        {
            forwarded.push(final_usage);
        }
        Ok(forwarded)
    }

    async fn invoke_streaming(
        &self,
        mut ctx: MiddlewareContext,
        next: &dyn ProviderAgent,
    ) -> Result<MessageStream> {
        Self::inject_usage_flag(&mut ctx.options);

        let mut inner = next
            .generate_reply_streaming(ctx.messages, &ctx.options)
            .await?;

        let cost = Arc::clone(&self.cost);
        let cache = Arc::clone(&self.cache);
        let retry = self.retry;
        let policy = self.policy;
        let options = ctx.options;

        Ok(Box::pin(stream! {
            let mut state = ResponseState::with_policy(policy);
            while let Some(item) = inner.next().await {
                match item {
                    Ok(message) => {
                        state.observe(&message);
                        if message.usage_payload().is_none() {
                            yield Ok(message);
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }

            if let Some(final_usage) = finalize(
                state,
                &cost,
                &cache,
                retry,
                retry.timeout_streaming,
                &options,
            )
            .await
            {
                yield Ok(final_usage);
            }
        }))
    }

    fn name(&self) -> &str {
        "usage_enrichment"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::provider::mock::MockAgent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCost {
        response: Result<GenerationCost>,
        calls: AtomicUsize,
    }

    impl FakeCost {
        fn ok(data: GenerationCost) -> Self {
            Self {
                response: Ok(data),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: Err(AgentError::transport("503 from endpoint")),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CostLookup for FakeCost {
        async fn generation_cost(&self, _completion_id: &str) -> Result<GenerationCost> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(data) => Ok(data.clone()),
                Err(_) => Err(AgentError::transport("503 from endpoint")),
            }
        }
    }

    fn sample_cost() -> GenerationCost {
        GenerationCost {
            tokens_prompt: 11,
            tokens_completion: 21,
            total_cost: 0.002,
            model: Some("test-model".to_owned()),
            generation_time: Some(1.5),
            streamed: Some(true),
            created_at: Some("2026-01-01T00:00:00Z".to_owned()),
        }
    }

    fn middleware(cost: Arc<FakeCost>) -> UsageEnrichmentMiddleware {
        UsageEnrichmentMiddleware::new(cost)
            .with_cache(Arc::new(UsageCache::with_ttl(Duration::from_secs(300))))
            .with_retry(RetryPolicy {
                delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            })
    }

    async fn run_streaming(
        mw: &UsageEnrichmentMiddleware,
        reply: Vec<Message>,
    ) -> Vec<Message> {
        let inner = MockAgent::with_reply(reply);
        let mut stream = mw
            .invoke_streaming(MiddlewareContext::default(), &inner)
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        out
    }

    mod cache {
        use super::*;

        #[test]
        fn parse_ttl_accepts_positive_integers() {
            assert_eq!(parse_ttl(Some("60".into())), Duration::from_secs(60));
            assert_eq!(parse_ttl(Some("0".into())), Duration::from_secs(300));
            assert_eq!(parse_ttl(Some("nope".into())), Duration::from_secs(300));
            assert_eq!(parse_ttl(None), Duration::from_secs(300));
        }

        #[test]
        fn set_then_get_within_ttl() {
            let cache = UsageCache::with_ttl(Duration::from_secs(60));
            cache.set("c1", Usage::new(1, 2));
            assert_eq!(cache.try_get("c1").unwrap().total_tokens, 3);
            assert!(cache.try_get("other").is_none());
        }

        #[test]
        fn expired_entries_are_evicted_on_read() {
            let cache = UsageCache::with_ttl(Duration::ZERO);
            cache.set("c1", Usage::new(1, 2));
            assert!(cache.try_get("c1").is_none());
        }

        #[test]
        fn set_replaces_existing_entry() {
            let cache = UsageCache::with_ttl(Duration::from_secs(60));
            cache.set("c1", Usage::new(1, 2));
            cache.set("c1", Usage::new(5, 5));
            assert_eq!(cache.try_get("c1").unwrap().total_tokens, 10);
        }
    }

    mod flag_injection {
        use super::*;

        #[tokio::test]
        async fn usage_include_is_injected() {
            let inner = Arc::new(MockAgent::with_reply(vec![Message::assistant("ok")]));
            let mw = middleware(Arc::new(FakeCost::ok(sample_cost())));
            let _ = mw
                .invoke(MiddlewareContext::default(), inner.as_ref())
                .await
                .unwrap();

            let seen = &inner.requests()[0].1;
            assert_eq!(seen.extra_properties["usage"]["include"], true);
        }

        #[tokio::test]
        async fn existing_usage_config_keys_survive() {
            let inner = Arc::new(MockAgent::with_reply(vec![Message::assistant("ok")]));
            let mw = middleware(Arc::new(FakeCost::ok(sample_cost())));
            let ctx = MiddlewareContext::new(
                Vec::new(),
                GenerateReplyOptions::new()
                    .with_extra("usage", serde_json::json!({"granularity": "turn"})),
            );
            let _ = mw.invoke(ctx, inner.as_ref()).await.unwrap();

            let seen = &inner.requests()[0].1;
            assert_eq!(seen.extra_properties["usage"]["granularity"], "turn");
            assert_eq!(seen.extra_properties["usage"]["include"], true);
        }
    }

    mod inline {
        use super::*;

        #[tokio::test]
        async fn inline_usage_short_circuits_the_endpoint() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let final_msg = Message::assistant("Hi there")
                .with_meta(
                    "inline_usage",
                    serde_json::json!({
                        "prompt_tokens": 10,
                        "completion_tokens": 20,
                        "total_tokens": 30,
                        "total_cost": 0.001
                    }),
                )
                .with_run("r1", "g1", None);

            let out = run_streaming(&mw, vec![Message::text_update("Hi"), final_msg]).await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 10);
            assert_eq!(usage.completion_tokens, 20);
            assert_eq!(usage.total_tokens, 30);
            assert_eq!(usage.total_cost, Some(0.001));
            assert_eq!(usage.extra["source"], "inline");
            assert_eq!(usage.extra["is_cached"], false);
            assert_eq!(cost.calls(), 0);
        }

        #[tokio::test]
        async fn zero_token_inline_payload_is_ignored() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let final_msg = Message::assistant("done")
                .with_meta("usage", serde_json::json!({"total_tokens": 0}))
                .with_run("r1", "g1", None);

            let out = run_streaming(&mw, vec![final_msg]).await;

            // Falls through to endpoint synthesis instead.
            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 11);
            assert_eq!(cost.calls(), 1);
        }
    }

    mod enhancement {
        use super::*;

        #[tokio::test]
        async fn buffered_usage_merges_with_endpoint_values() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let provider_usage = Message::usage(Usage::new(10, 20)).with_run("r1", "g1", None);
            let out =
                run_streaming(&mw, vec![Message::assistant("hello"), provider_usage]).await;

            // The raw provider usage message is withheld; one enriched
            // message terminates the stream.
            let usages: Vec<_> = out
                .iter()
                .filter_map(Message::usage_payload)
                .collect();
            assert_eq!(usages.len(), 1);

            let usage = usages[0];
            assert_eq!(usage.prompt_tokens, 11);
            assert_eq!(usage.completion_tokens, 21);
            assert_eq!(usage.total_tokens, 32);
            assert_eq!(usage.total_cost, Some(0.002));
            assert_eq!(usage.extra["enhanced_by"], "openrouter_middleware");
            assert_eq!(usage.extra["token_discrepancies_resolved"], true);
            assert_eq!(usage.extra["resolution_strategy"], "used_openrouter_values");
        }

        #[tokio::test]
        async fn agreeing_counts_set_no_discrepancy_markers() {
            let cost = Arc::new(FakeCost::ok(GenerationCost {
                tokens_prompt: 10,
                tokens_completion: 20,
                total_cost: 0.002,
                ..GenerationCost::default()
            }));
            let mw = middleware(Arc::clone(&cost));

            let provider_usage = Message::usage(Usage::new(10, 20)).with_run("r1", "g1", None);
            let out = run_streaming(&mw, vec![provider_usage]).await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.extra["enhanced_by"], "openrouter_middleware");
            assert!(!usage.extra.contains_key("token_discrepancies_resolved"));
        }

        #[tokio::test]
        async fn already_costed_usage_passes_through_without_lookup() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let provider_usage =
                Message::usage(Usage::new(10, 20).with_cost(0.01)).with_run("r1", "g1", None);
            let out = run_streaming(&mw, vec![provider_usage]).await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.total_cost, Some(0.01));
            assert_eq!(cost.calls(), 0);
        }

        #[tokio::test]
        async fn keep_last_policy_buffers_the_last_usage() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let out = run_streaming(
                &mw,
                vec![
                    Message::usage(Usage::new(1, 1).with_cost(0.1)).with_run("r1", "g1", None),
                    Message::usage(Usage::new(9, 9).with_cost(0.9)).with_run("r1", "g1", None),
                ],
            )
            .await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 9);
        }

        #[tokio::test]
        async fn keep_first_policy_ignores_later_usage() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost)).with_policy(UsagePolicy::KeepFirst);

            let out = run_streaming(
                &mw,
                vec![
                    Message::usage(Usage::new(1, 1).with_cost(0.1)).with_run("r1", "g1", None),
                    Message::usage(Usage::new(9, 9).with_cost(0.9)).with_run("r1", "g1", None),
                ],
            )
            .await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 1);
            assert_eq!(usage.total_cost, Some(0.1));
        }

        #[tokio::test]
        async fn sum_policy_accumulates_counts_and_costs() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost)).with_policy(UsagePolicy::Sum);

            let out = run_streaming(
                &mw,
                vec![
                    Message::usage(Usage::new(1, 2).with_cost(0.1)).with_run("r1", "g1", None),
                    Message::usage(Usage::new(3, 4).with_cost(0.2)).with_run("r1", "g1", None),
                ],
            )
            .await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 4);
            assert_eq!(usage.completion_tokens, 6);
            assert_eq!(usage.total_tokens, 10);
            let cost_sum = usage.total_cost.unwrap();
            assert!((cost_sum - 0.3).abs() < 1e-9);
        }
    }

    mod fallback_and_cache {
        use super::*;

        #[tokio::test]
        async fn no_completion_id_emits_no_usage() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let out = run_streaming(&mw, vec![Message::assistant("anonymous")]).await;
            assert!(out.iter().all(|m| m.usage_payload().is_none()));
            assert_eq!(cost.calls(), 0);
        }

        #[tokio::test]
        async fn fallback_synthesizes_from_endpoint() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let out =
                run_streaming(&mw, vec![Message::assistant("done").with_run("r1", "g1", None)])
                    .await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.prompt_tokens, 11);
            assert_eq!(usage.total_cost, Some(0.002));
            assert_eq!(usage.extra["model"], "test-model");
            assert_eq!(usage.extra["is_cached"], false);
        }

        #[tokio::test]
        async fn second_lookup_within_ttl_hits_the_cache() {
            let cost = Arc::new(FakeCost::ok(sample_cost()));
            let mw = middleware(Arc::clone(&cost));

            let reply = || vec![Message::assistant("done").with_run("r1", "g1", None)];
            let first = run_streaming(&mw, reply()).await;
            let second = run_streaming(&mw, reply()).await;

            assert_eq!(cost.calls(), 1);
            assert_eq!(
                first.last().unwrap().usage_payload().unwrap().extra["is_cached"],
                false
            );
            assert_eq!(
                second.last().unwrap().usage_payload().unwrap().extra["is_cached"],
                true
            );
        }

        #[tokio::test(start_paused = true)]
        async fn exhausted_retries_emit_no_usage() {
            let cost = Arc::new(FakeCost::failing());
            let mw = UsageEnrichmentMiddleware::new(cost.clone())
                .with_cache(Arc::new(UsageCache::with_ttl(Duration::from_secs(300))));

            let out =
                run_streaming(&mw, vec![Message::assistant("done").with_run("r1", "g1", None)])
                    .await;

            assert_eq!(cost.calls(), 7);
            assert!(out.iter().all(|m| m.usage_payload().is_none()));
        }

        #[tokio::test(start_paused = true)]
        async fn enhancement_failure_keeps_provider_counts() {
            let cost = Arc::new(FakeCost::failing());
            let mw = UsageEnrichmentMiddleware::new(cost.clone())
                .with_cache(Arc::new(UsageCache::with_ttl(Duration::from_secs(300))));

            let provider_usage = Message::usage(Usage::new(10, 20)).with_run("r1", "g1", None);
            let out = run_streaming(&mw, vec![provider_usage]).await;

            let usage = out.last().unwrap().usage_payload().unwrap();
            assert_eq!(usage.total_tokens, 30);
            assert!(usage.total_cost.is_none());
            assert!(!usage.extra.contains_key("enhanced_by"));
        }
    }
}
