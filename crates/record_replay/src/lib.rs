//! Record/replay wrapper around a `ChatProvider`: records live responses
//! to disk keyed by a hash of the request, and replays them later for
//! deterministic lab runs and tests (§4.8/§4.9).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use halcyon_config::CacheMode;
use halcyon_llm::{ChatError, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ToolCall};

#[derive(Debug, Error)]
#[error("no cached response for request hash '{0}'")]
pub struct CacheMissError(pub String);

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u32,
    pub misses: u32,
    pub records: u32,
    pub errors: u32,
    pub total: u32,
}

/// The full cached payload, plus debug metadata kept alongside it so a
/// cache file is self-describing when inspected on disk.
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    request_hash: String,
    content: String,
    finish_reason: String,
    #[serde(default)]
    usage: HashMap<String, u64>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(rename = "_hash")]
    debug_hash: String,
    #[serde(rename = "_model")]
    debug_model: String,
    #[serde(rename = "_last_user_msg")]
    debug_last_user_msg: Option<String>,
    #[serde(rename = "_message_count")]
    debug_message_count: usize,
}

pub struct RecordReplayProvider {
    inner: std::sync::Arc<dyn ChatProvider>,
    mode: CacheMode,
    cache_dir: PathBuf,
    stats: Mutex<CacheStats>,
}

impl RecordReplayProvider {
    pub fn new(inner: std::sync::Arc<dyn ChatProvider>, mode: CacheMode, cache_dir: impl Into<PathBuf>) -> Self {
        Self { inner, mode, cache_dir: cache_dir.into(), stats: Mutex::new(CacheStats::default()) }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().expect("cache stats lock poisoned").clone()
    }

    fn cache_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}.json"))
    }

    async fn save_to_cache(&self, hash: &str, request: &ChatRequest, response: &ChatResponse) {
        let entry = CachedEntry {
            request_hash: hash.to_string(),
            content: response.content.clone(),
            finish_reason: response.finish_reason.clone(),
            usage: response.usage.clone(),
            reasoning_content: response.reasoning_content.clone(),
            tool_calls: response.tool_calls.clone(),
            debug_hash: hash.to_string(),
            debug_model: request.model.clone(),
            debug_last_user_msg: last_user_message_preview(&request.messages),
            debug_message_count: request.messages.len(),
        };
        let Ok(rendered) = serde_json::to_string_pretty(&entry) else {
            self.stats.lock().expect("cache stats lock poisoned").errors += 1;
            return;
        };
        let _ = tokio::fs::create_dir_all(&self.cache_dir).await;
        match tokio::fs::write(self.cache_path(hash), rendered).await {
            Ok(()) => self.stats.lock().expect("cache stats lock poisoned").records += 1,
            Err(err) => {
                tracing::warn!(error = %err, hash = %hash, "failed to write cache entry");
                self.stats.lock().expect("cache stats lock poisoned").errors += 1;
            }
        }
    }

    async fn load_from_cache(&self, hash: &str) -> Option<ChatResponse> {
        match tokio::fs::read_to_string(self.cache_path(hash)).await {
            Ok(raw) => match serde_json::from_str::<CachedEntry>(&raw) {
                Ok(entry) => {
                    self.stats.lock().expect("cache stats lock poisoned").hits += 1;
                    Some(ChatResponse {
                        content: entry.content,
                        finish_reason: entry.finish_reason,
                        usage: entry.usage,
                        reasoning_content: entry.reasoning_content,
                        tool_calls: entry.tool_calls,
                    })
                }
                Err(err) => {
                    tracing::warn!(error = %err, hash = %hash, "failed to parse cache entry");
                    self.stats.lock().expect("cache stats lock poisoned").errors += 1;
                    None
                }
            },
            Err(_) => {
                self.stats.lock().expect("cache stats lock poisoned").misses += 1;
                None
            }
        }
    }

    async fn call_real(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        self.inner.chat(request).await
    }

    pub fn clear_cache(&self) -> std::io::Result<()> {
        if !self.cache_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        let Ok(dir) = std::fs::read_dir(&self.cache_dir) else { return 0 };
        dir.filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .count()
    }
}

#[async_trait]
impl ChatProvider for RecordReplayProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        let hash = hash_request(request);
        self.stats.lock().expect("cache stats lock poisoned").total += 1;

        match self.mode {
            CacheMode::Passthrough => self.call_real(request).await,
            CacheMode::Record => {
                let response = self.call_real(request).await?;
                self.save_to_cache(&hash, request, &response).await;
                Ok(response)
            }
            CacheMode::Replay => self
                .load_from_cache(&hash)
                .await
                .ok_or_else(|| ChatError::Transport(CacheMissError(hash.clone()).to_string())),
            CacheMode::ReplayOrLive => {
                if let Some(cached) = self.load_from_cache(&hash).await {
                    return Ok(cached);
                }
                let response = self.call_real(request).await?;
                self.save_to_cache(&hash, request, &response).await;
                Ok(response)
            }
        }
    }
}

/// Hashes `model` plus each message's `role:content` line plus the
/// sorted tool names — explicitly excluding `temperature`/`max_tokens`,
/// since those don't change what the model is being asked.
pub fn hash_request(request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.model.as_bytes());
    hasher.update(b"\n");
    for message in &request.messages {
        hasher.update(role_key(&message.role).as_bytes());
        hasher.update(b":");
        hasher.update(message.content.as_bytes());
        hasher.update(b"\n");
    }
    let mut tool_names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
    tool_names.sort_unstable();
    hasher.update(b"tools:");
    hasher.update(tool_names.join(",").as_bytes());

    format!("{:x}", hasher.finalize())
}

fn role_key(role: &halcyon_llm::ChatRole) -> &'static str {
    match role {
        halcyon_llm::ChatRole::System => "system",
        halcyon_llm::ChatRole::User => "user",
        halcyon_llm::ChatRole::Assistant => "assistant",
        halcyon_llm::ChatRole::Tool => "tool",
    }
}

/// The last user message's content, reversed-search and truncated to 200
/// chars — useful as a one-line diagnostic label for a cache entry.
pub fn last_user_message_preview(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, halcyon_llm::ChatRole::User))
        .map(|m| m.content.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_llm::ChatRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatProvider for CountingProvider {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse { content: "live response".to_string(), finish_reason: "stop".to_string(), ..Default::default() })
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user("hello")],
            tools: Vec::new(),
            temperature: 0.5,
            max_tokens: Some(100),
        }
    }

    #[test]
    fn hash_ignores_temperature_and_max_tokens() {
        let mut a = request();
        let mut b = request();
        a.temperature = 0.1;
        b.temperature = 0.9;
        a.max_tokens = Some(10);
        b.max_tokens = Some(9999);
        assert_eq!(hash_request(&a), hash_request(&b));
    }

    #[test]
    fn hash_changes_with_message_content() {
        let a = request();
        let mut b = request();
        b.messages[0].content = "goodbye".to_string();
        assert_ne!(hash_request(&a), hash_request(&b));
    }

    #[tokio::test]
    async fn s5_record_then_replay_is_a_cache_hit_without_calling_real() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider { calls: AtomicU32::new(0) });
        let recorder = RecordReplayProvider::new(inner.clone(), CacheMode::Record, dir.path());
        let response = recorder.chat(&request()).await.unwrap();
        assert_eq!(response.content, "live response");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let replayer = RecordReplayProvider::new(inner.clone(), CacheMode::Replay, dir.path());
        let replayed = replayer.chat(&request()).await.unwrap();
        assert_eq!(replayed.content, "live response");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1, "replay must not call the real provider");
        assert_eq!(replayer.stats().hits, 1);
        assert_eq!(recorder.stats().records, 1);
        assert_eq!(recorder.cache_size(), 1);
    }

    #[tokio::test]
    async fn replay_mode_misses_return_cache_miss_error() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider { calls: AtomicU32::new(0) });
        let replayer = RecordReplayProvider::new(inner, CacheMode::Replay, dir.path());
        let err = replayer.chat(&request()).await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[tokio::test]
    async fn replay_or_live_falls_back_to_real_and_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider { calls: AtomicU32::new(0) });
        let provider = RecordReplayProvider::new(inner.clone(), CacheMode::ReplayOrLive, dir.path());
        provider.chat(&request()).await.unwrap();
        provider.chat(&request()).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1, "second call should hit the cache written by the first");
    }

    #[tokio::test]
    async fn clear_cache_removes_entries_and_resets_size() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider { calls: AtomicU32::new(0) });
        let recorder = RecordReplayProvider::new(inner, CacheMode::Record, dir.path());
        recorder.chat(&request()).await.unwrap();
        assert_eq!(recorder.cache_size(), 1);
        recorder.clear_cache().unwrap();
        assert_eq!(recorder.cache_size(), 0);
    }

    #[test]
    fn preview_takes_last_user_message_truncated() {
        let long = "x".repeat(300);
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("first"), ChatMessage::user(long.clone())];
        let preview = last_user_message_preview(&messages).unwrap();
        assert_eq!(preview.len(), 200);
    }

    #[tokio::test]
    async fn total_counts_every_call_regardless_of_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(CountingProvider { calls: AtomicU32::new(0) });
        let replayer = RecordReplayProvider::new(inner, CacheMode::Replay, dir.path());
        let _ = replayer.chat(&request()).await;
        let _ = replayer.chat(&request()).await;
        let stats = replayer.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn cached_entry_persists_full_payload_and_debug_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = RecordReplayProvider::new(Arc::new(CountingProvider { calls: AtomicU32::new(0) }), CacheMode::Record, dir.path());
        recorder.chat(&request()).await.unwrap();

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        let file = entries.next().unwrap().unwrap().path();
        let raw = std::fs::read_to_string(file).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["content"], "live response");
        assert_eq!(value["_model"], "test-model");
        assert_eq!(value["_message_count"], 1);
        assert_eq!(value["_last_user_msg"], "hello");
        assert!(value.get("usage").is_some());
        assert!(value.get("tool_calls").is_some());
    }
}
