//! Orchestrates an isolated lab instance: wires state, a record/replay
//! provider, a mock channel, and an `AgentLoopStub`, and drives scripted
//! message sequences through them (§4.9).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use halcyon_audit::AuditCollector;
use halcyon_config::CacheMode;
use halcyon_llm::ChatProvider;
use halcyon_record_replay::{CacheStats, RecordReplayProvider};
use halcyon_subconscious::Classifier;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::agent_loop::AgentLoopStub;
use crate::mock_channel::{InboundMessage, MockChannel, OutboundMessage};
use crate::state::{self, DataPaths, LabStateError};

#[derive(Debug, Error)]
pub enum LabError {
    #[error("lab already started")]
    AlreadyStarted,
    #[error("lab not started — call start() first")]
    NotStarted,
    #[error(transparent)]
    State(#[from] LabStateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct LabConfig {
    pub run_name: String,
    pub snapshot_name: Option<String>,
    pub agent_name: String,
    pub model: String,
    pub cache_mode: CacheMode,
    pub response_timeout: Duration,
    pub temperature: f32,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            run_name: "lab_run".to_string(),
            snapshot_name: None,
            agent_name: "Halcyon".to_string(),
            model: "lab/default-model".to_string(),
            cache_mode: CacheMode::ReplayOrLive,
            response_timeout: Duration::from_secs(60),
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptMessage {
    pub sender_id: String,
    pub content: String,
    pub chat_id: String,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub is_reply_to_agent: bool,
    pub expect_response: bool,
}

impl ScriptMessage {
    pub fn new(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            content: content.into(),
            chat_id: "lab_general".to_string(),
            display_name: None,
            username: None,
            reply_to_message_id: None,
            is_reply_to_agent: false,
            expect_response: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub input: ScriptMessage,
    pub response: Option<OutboundMessage>,
    pub all_responses: Vec<OutboundMessage>,
    pub elapsed_ms: f64,
}

struct Running {
    paths: DataPaths,
    channel: Arc<MockChannel>,
    agent_task: JoinHandle<()>,
    provider: Arc<RecordReplayProvider>,
}

pub struct LabHarness {
    lab_root: PathBuf,
    config: LabConfig,
    real_provider: Arc<dyn ChatProvider>,
    audit: Arc<AuditCollector>,
    running: Option<Running>,
}

impl LabHarness {
    pub fn new(lab_root: impl Into<PathBuf>, config: LabConfig, real_provider: Arc<dyn ChatProvider>) -> Self {
        Self { lab_root: lab_root.into(), config, real_provider, audit: Arc::new(AuditCollector::new()), running: None }
    }

    pub fn audit(&self) -> Arc<AuditCollector> {
        self.audit.clone()
    }

    pub fn paths(&self) -> Result<&DataPaths, LabError> {
        self.running.as_ref().map(|r| &r.paths).ok_or(LabError::NotStarted)
    }

    pub async fn start(&mut self) -> Result<(), LabError> {
        if self.running.is_some() {
            return Err(LabError::AlreadyStarted);
        }

        let paths = state::create_run(&self.lab_root, &self.config.run_name, self.config.snapshot_name.as_deref()).await?;
        let cache_dir = state::get_cache_dir(&self.lab_root).await?;
        let provider = Arc::new(RecordReplayProvider::new(self.real_provider.clone(), self.config.cache_mode, cache_dir));

        let classifier = Arc::new(Classifier::new(
            provider.clone(),
            self.config.agent_name.clone(),
            Some(self.config.model.clone()),
            Vec::new(),
            self.config.temperature,
            self.config.response_timeout,
        ));

        let (channel, inbound_rx) = MockChannel::new();
        let channel = Arc::new(channel);
        let agent = Arc::new(AgentLoopStub::new(classifier, channel.clone(), Some(self.audit.clone()), self.config.agent_name.clone()));
        let agent_task = tokio::spawn(agent.run(inbound_rx));

        tracing::info!(run = %self.config.run_name, model = %self.config.model, "lab started");
        self.running = Some(Running { paths, channel, agent_task, provider });
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), LabError> {
        let Some(running) = self.running.take() else { return Ok(()) };
        running.agent_task.abort();
        let _ = running.agent_task.await;
        tracing::info!(run = %self.config.run_name, "lab stopped");
        Ok(())
    }

    pub async fn inject(&self, content: &str, sender_id: &str, chat_id: &str) -> Result<Option<OutboundMessage>, LabError> {
        let running = self.running.as_ref().ok_or(LabError::NotStarted)?;
        running.channel.clear_responses();
        running
            .channel
            .inject_message(InboundMessage {
                content: content.to_string(),
                sender_id: sender_id.to_string(),
                chat_id: chat_id.to_string(),
                display_name: sender_id.to_string(),
                username: sender_id.to_string(),
                is_reply_to_agent: false,
                reply_to_message_id: None,
            })
            .await;
        Ok(running.channel.wait_for_response(self.config.response_timeout).await)
    }

    pub async fn run_script(&self, messages: Vec<ScriptMessage>, delay: Duration) -> Result<Vec<ScriptResult>, LabError> {
        let running = self.running.as_ref().ok_or(LabError::NotStarted)?;
        let mut results = Vec::with_capacity(messages.len());

        for script_msg in messages {
            running.channel.clear_responses();
            let start = std::time::Instant::now();

            running
                .channel
                .inject_message(InboundMessage {
                    content: script_msg.content.clone(),
                    sender_id: script_msg.sender_id.clone(),
                    chat_id: script_msg.chat_id.clone(),
                    display_name: script_msg.display_name.clone().unwrap_or_else(|| script_msg.sender_id.clone()),
                    username: script_msg.username.clone().unwrap_or_else(|| script_msg.sender_id.clone()),
                    is_reply_to_agent: script_msg.is_reply_to_agent,
                    reply_to_message_id: script_msg.reply_to_message_id.clone(),
                })
                .await;

            let response = if script_msg.expect_response { running.channel.wait_for_response(self.config.response_timeout).await } else { None };
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            let all_responses = running.channel.get_responses();

            results.push(ScriptResult { input: script_msg, response, all_responses, elapsed_ms });

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        Ok(results)
    }

    /// Snapshots the run's on-disk state for verification: core memory,
    /// diary file list, and session file line counts.
    pub async fn get_state(&self) -> Result<Value, LabError> {
        let paths = self.paths()?;
        let mut state = serde_json::Map::new();

        let core_path = paths.workspace.join("memory").join("core.json");
        if let Ok(raw) = tokio::fs::read_to_string(&core_path).await {
            state.insert("core_memory".to_string(), serde_json::from_str(&raw).unwrap_or(Value::Null));
        }

        let diary_dir = paths.workspace.join("memory").join("diary");
        if diary_dir.try_exists()? {
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&diary_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("md") {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();
            state.insert("diary_files".to_string(), json!(names));
        }

        let mut sessions = serde_json::Map::new();
        if paths.sessions.try_exists()? {
            let mut entries = tokio::fs::read_dir(&paths.sessions).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    if let Ok(raw) = tokio::fs::read_to_string(entry.path()).await {
                        let stem = entry.path().file_stem().unwrap_or_default().to_string_lossy().into_owned();
                        sessions.insert(stem, json!(raw.lines().count()));
                    }
                }
            }
        }
        state.insert("sessions".to_string(), Value::Object(sessions));

        Ok(Value::Object(state))
    }

    pub fn provider_stats(&self) -> Option<CacheStats> {
        self.running.as_ref().map(|r| r.provider.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use halcyon_llm::{ChatError, ChatRequest, ChatResponse};

    struct StaticProvider;

    #[async_trait]
    impl ChatProvider for StaticProvider {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            Ok(ChatResponse {
                content: r#"{"classification":"respond","confidence":0.9,"reason":"direct address"}"#.to_string(),
                finish_reason: "stop".to_string(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn s_lab_start_inject_stop_round_trip() {
        let lab_root = tempfile::tempdir().unwrap();
        let config = LabConfig { run_name: "t1".to_string(), response_timeout: Duration::from_secs(2), ..Default::default() };
        let mut harness = LabHarness::new(lab_root.path(), config, Arc::new(StaticProvider));

        harness.start().await.unwrap();
        let response = harness.inject("hey there", "user_1", "lab_general").await.unwrap();
        assert!(response.is_some());
        assert!(response.unwrap().content.contains("heard you"));

        let summary = harness.audit().summary();
        assert_eq!(summary.classifications.get("respond").copied().unwrap_or(0), 1);
        assert_eq!(summary.responses, 1);

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn run_script_drives_a_sequence_and_records_results() {
        let lab_root = tempfile::tempdir().unwrap();
        let config = LabConfig { run_name: "t2".to_string(), response_timeout: Duration::from_secs(2), ..Default::default() };
        let mut harness = LabHarness::new(lab_root.path(), config, Arc::new(StaticProvider));
        harness.start().await.unwrap();

        let results = harness
            .run_script(vec![ScriptMessage::new("user_1", "hello"), ScriptMessage::new("user_2", "hello again")], Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.response.is_some()));

        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let lab_root = tempfile::tempdir().unwrap();
        let config = LabConfig { run_name: "t3".to_string(), ..Default::default() };
        let mut harness = LabHarness::new(lab_root.path(), config, Arc::new(StaticProvider));
        harness.start().await.unwrap();
        let err = harness.start().await.unwrap_err();
        assert!(matches!(err, LabError::AlreadyStarted));
        harness.stop().await.unwrap();
    }
}
