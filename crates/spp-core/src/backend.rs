//! Model backends.
//!
//! The evaluator only ever talks to [`LlmBackend`]. Concrete network clients
//! live outside this crate; the implementations here cover dry runs
//! ([`EchoBackend`]), tests ([`ScriptedBackend`]), cache-only replays
//! ([`OfflineBackend`]) and response caching ([`CachedBackend`]).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spp_cache::{CacheKey, CachedResponse, ResponseCache};
use tracing::debug;

use crate::chat::{ChatMessage, Role};
use crate::error::{Result, SppError};
use crate::metrics::METRICS;
use crate::obs;

/// How a request interacts with the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Serve from the cache when possible, store fresh responses.
    #[default]
    Use,
    /// Always call the backend, overwrite the cached response.
    Refresh,
    /// Neither read nor write the cache.
    Bypass,
}

/// One chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Not part of the wire form, so it never affects the cache key.
    #[serde(skip)]
    pub cache: CachePolicy,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
            seed: None,
            cache: CachePolicy::Use,
        }
    }

    /// SHA-256 of the request's canonical JSON form.
    pub fn cache_key(&self) -> Result<CacheKey> {
        Ok(CacheKey::from_bytes(&serde_json::to_vec(self)?))
    }

    /// Content of the final user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A completion returned by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    /// True when served from a response cache.
    #[serde(default)]
    pub cached: bool,
}

/// A language-model backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

/// Replies with the request's last user message. Handy for inspecting the
/// prompts a program would send.
#[derive(Debug, Default, Clone)]
pub struct EchoBackend;

#[async_trait]
impl LlmBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        Ok(CompletionResponse {
            text: request.last_user_message().unwrap_or_default().to_string(),
            model: request.model.clone(),
            cached: false,
        })
    }
}

/// Fails every request. Wrapped in a [`CachedBackend`] it replays a cache
/// without ever reaching a model.
#[derive(Debug, Default, Clone)]
pub struct OfflineBackend;

#[async_trait]
impl LlmBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let key = request.cache_key()?;
        Err(SppError::Backend(format!(
            "no live backend configured and request {} is not cached",
            key.short()
        )))
    }
}

type Handler = Arc<dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync>;
type DelayFn = Arc<dyn Fn(&CompletionRequest) -> Duration + Send + Sync>;

/// Backend driven by a closure; records every request it receives.
pub struct ScriptedBackend {
    handler: Handler,
    delay: Option<DelayFn>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep for `delay(request)` before answering.
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(delay) = &self.delay {
            tokio::time::sleep((**delay)(request)).await;
        }
        let text = (*self.handler)(request)?;
        Ok(CompletionResponse {
            text,
            model: request.model.clone(),
            cached: false,
        })
    }
}

/// Serves responses from a [`ResponseCache`], falling through to `inner` on a
/// miss and storing what comes back.
pub struct CachedBackend {
    inner: Arc<dyn LlmBackend>,
    cache: Arc<dyn ResponseCache>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn LlmBackend>, cache: Arc<dyn ResponseCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        &self.cache
    }
}

#[async_trait]
impl LlmBackend for CachedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if request.cache == CachePolicy::Bypass {
            return self.inner.complete(request).await;
        }

        let key = request.cache_key()?;
        if request.cache == CachePolicy::Use {
            if let Some(hit) = self.cache.get(&key).await? {
                METRICS.inc_cache_hits();
                obs::emit_cache_hit(key.short(), &hit.model);
                return Ok(CompletionResponse {
                    text: hit.text,
                    model: hit.model,
                    cached: true,
                });
            }
        }

        METRICS.inc_cache_misses();
        let response = self.inner.complete(request).await?;
        self.cache
            .put(key.clone(), CachedResponse::new(&response.text, &response.model))
            .await?;
        debug!(key = %key.short(), backend = %self.inner.name(), "response cached");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_cache::MemoryCache;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest::new("test-model", vec![ChatMessage::user(prompt)])
    }

    #[test]
    fn cache_key_ignores_policy_but_not_seed() {
        let a = request("hi");
        let mut b = request("hi");
        b.cache = CachePolicy::Refresh;
        assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());

        b.seed = Some(7);
        assert_ne!(a.cache_key().unwrap(), b.cache_key().unwrap());
    }

    #[tokio::test]
    async fn echo_returns_last_user_message() {
        let mut req = request("first");
        req.messages.push(ChatMessage::new(Role::Assistant, "reply"));
        req.messages.push(ChatMessage::user("second"));
        let resp = EchoBackend.complete(&req).await.unwrap();
        assert_eq!(resp.text, "second");
        assert_eq!(resp.model, "test-model");
    }

    #[tokio::test]
    async fn offline_always_fails() {
        let err = OfflineBackend.complete(&request("x")).await.unwrap_err();
        assert!(err.to_string().contains("not cached"));
    }

    #[tokio::test]
    async fn cached_backend_serves_second_call_from_cache() {
        let inner = Arc::new(ScriptedBackend::new(|req| {
            Ok(format!("echo:{}", req.last_user_message().unwrap_or_default()))
        }));
        let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new());
        let backend = CachedBackend::new(inner.clone(), Arc::clone(&cache));

        let first = backend.complete(&request("hello")).await.unwrap();
        let second = backend.complete(&request("hello")).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, "echo:hello");
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_and_bypass_policies() {
        let inner = Arc::new(ScriptedBackend::new(|_| Ok("fresh".to_string())));
        let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new());
        let backend = CachedBackend::new(inner.clone(), Arc::clone(&cache));

        backend.complete(&request("q")).await.unwrap();

        let mut refresh = request("q");
        refresh.cache = CachePolicy::Refresh;
        assert!(!backend.complete(&refresh).await.unwrap().cached);
        assert_eq!(inner.calls(), 2);

        let mut bypass = request("other");
        bypass.cache = CachePolicy::Bypass;
        backend.complete(&bypass).await.unwrap();
        assert_eq!(inner.calls(), 3);
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn offline_behind_cache_replays_hits() {
        let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new());
        let req = request("known");
        cache
            .put(req.cache_key().unwrap(), CachedResponse::new("remembered", "test-model"))
            .await
            .unwrap();

        let backend = CachedBackend::new(Arc::new(OfflineBackend), cache);
        assert_eq!(backend.complete(&req).await.unwrap().text, "remembered");
        assert!(backend.complete(&request("unknown")).await.is_err());
    }
}
