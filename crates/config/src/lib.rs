//! Recognized configuration for the memory engine, split one struct per
//! component (§6 of the design spec). Every struct is `#[serde(default)]`
//! with an explicit `Default` impl so a partial TOML file still loads.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub token_budget: u32,
    pub chroma_path: String,
    pub embedding_model: String,
    pub idle_trigger_seconds: u64,
    pub diary_context_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_budget: 4000,
            chroma_path: "chroma_db".to_string(),
            embedding_model: "local-fallback".to_string(),
            idle_trigger_seconds: 300,
            diary_context_days: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubconsciousConfig {
    pub daemon_model: Option<String>,
    pub consolidation_model: Option<String>,
    pub temperature: f32,
    pub timeout_seconds: f64,
    pub fallback_models: Vec<String>,
}

impl Default for SubconsciousConfig {
    fn default() -> Self {
        Self {
            daemon_model: None,
            consolidation_model: None,
            temperature: 0.1,
            timeout_seconds: 10.0,
            fallback_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidatorConfig {
    pub model: Option<String>,
    pub temperature: f32,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Record,
    Replay,
    ReplayOrLive,
    Passthrough,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::ReplayOrLive
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordReplayConfig {
    pub mode: CacheMode,
    pub cache_dir: String,
}

impl Default for RecordReplayConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::ReplayOrLive,
            cache_dir: "cache/llm_responses".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub run_name: String,
    pub snapshot_name: Option<String>,
    pub model: String,
    pub cache_mode: CacheMode,
    pub response_timeout: f64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: u32,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            run_name: "default".to_string(),
            snapshot_name: None,
            model: "local/default".to_string(),
            cache_mode: CacheMode::ReplayOrLive,
            response_timeout: 60.0,
            temperature: 0.7,
            max_tokens: 4096,
            max_iterations: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub memory: MemoryConfig,
    pub subconscious: SubconsciousConfig,
    pub consolidator: ConsolidatorConfig,
    pub record_replay: RecordReplayConfig,
    pub lab: LabConfig,
}

impl EngineConfig {
    /// Loads from `path`, falling back to defaults for anything the file
    /// is missing or if the file itself is absent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.memory.token_budget, 4000);
        assert_eq!(cfg.memory.diary_context_days, 3);
        assert_eq!(cfg.subconscious.timeout_seconds, 10.0);
        assert_eq!(cfg.consolidator.temperature, 0.3);
        assert_eq!(cfg.lab.response_timeout, 60.0);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = EngineConfig::load_from("/nonexistent/path/halcyon.toml").unwrap();
        assert_eq!(cfg.memory.token_budget, 4000);
    }

    #[test]
    fn partial_toml_fills_remainder_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halcyon.toml");
        fs::write(&path, "[memory]\ntoken_budget = 8000\n").unwrap();
        let cfg = EngineConfig::load_from(&path).unwrap();
        assert_eq!(cfg.memory.token_budget, 8000);
        assert_eq!(cfg.memory.diary_context_days, 3);
        assert_eq!(cfg.subconscious.temperature, 0.1);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("halcyon.toml");
        let mut cfg = EngineConfig::default();
        cfg.lab.run_name = "smoke".to_string();
        cfg.save_to(&path).unwrap();
        let reloaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.lab.run_name, "smoke");
    }
}
