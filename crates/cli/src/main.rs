//! Thin operator CLI for a halcyon data root: init, manual idle/daily
//! sleep, core dump, and lab script execution. This binary drives only
//! the library's own public operations — no NLG, no tool dispatch — so it
//! is the one acceptable outer-loop surface this workspace exposes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use halcyon_config::EngineConfig;
use halcyon_consolidator::Consolidator;
use halcyon_embeddings::{EmbeddingGateway, HttpEmbedder, RemoteEmbedder};
use halcyon_lab::{LabConfig as HarnessConfig, LabHarness, ScriptMessage};
use halcyon_llm::{ChatProvider, HttpChatProvider};
use halcyon_memory::MemorySystem;

#[derive(Debug, Parser)]
#[command(name = "halcyon", version, about = "Operate a halcyon memory engine data root")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a fresh workspace and write a default config file.
    Init {
        workspace: PathBuf,
    },
    /// Run one idle consolidation pass over a conversation transcript.
    IdleSleep {
        workspace: PathBuf,
        /// Path to the conversation text to consolidate; reads stdin if omitted.
        #[arg(long)]
        conversation_file: Option<PathBuf>,
    },
    /// Run the daily consolidation pass (reflections, pruning, core review).
    DailySleep {
        workspace: PathBuf,
    },
    /// Print Core Memory's rendered context block.
    DumpCore {
        workspace: PathBuf,
    },
    /// Run a scripted message sequence through an isolated lab instance.
    LabScript {
        lab_root: PathBuf,
        script_file: PathBuf,
        #[arg(long, default_value = "lab_script_run")]
        run_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { workspace } => run_init(&workspace).await,
        Commands::IdleSleep { workspace, conversation_file } => run_idle_sleep(&workspace, conversation_file.as_deref()).await,
        Commands::DailySleep { workspace } => run_daily_sleep(&workspace).await,
        Commands::DumpCore { workspace } => run_dump_core(&workspace).await,
        Commands::LabScript { lab_root, script_file, run_name } => run_lab_script(&lab_root, &script_file, &run_name).await,
    }
}

async fn run_init(workspace: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(workspace.join("memory").join("diary")).await?;
    let config = EngineConfig::default();
    config.save_to(workspace.join("halcyon.toml")).context("writing default config")?;
    println!("Initialized workspace at {}", workspace.display());
    Ok(())
}

async fn run_idle_sleep(workspace: &std::path::Path, conversation_file: Option<&std::path::Path>) -> Result<()> {
    let config = EngineConfig::load_from(workspace.join("halcyon.toml"))?;
    let conversation_text = match conversation_file {
        Some(path) => tokio::fs::read_to_string(path).await.context("reading conversation file")?,
        None => read_stdin().await?,
    };

    let mut system = MemorySystem::initialize(workspace, config.memory.clone(), build_embedder()).await;
    let consolidator = build_consolidator(&config);
    let stats = consolidator.process_idle(&mut system, &conversation_text).await;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "facts_added": stats.facts_added,
        "entities_updated": stats.entities_updated,
    }))?);
    Ok(())
}

async fn run_daily_sleep(workspace: &std::path::Path) -> Result<()> {
    let config = EngineConfig::load_from(workspace.join("halcyon.toml"))?;
    let mut system = MemorySystem::initialize(workspace, config.memory.clone(), build_embedder()).await;
    let consolidator = build_consolidator(&config);
    let stats = consolidator.process_daily(&mut system).await;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "reflections_added": stats.reflections_added,
        "memories_pruned": stats.memories_pruned,
        "core_entries_archived": stats.core_entries_archived,
    }))?);
    Ok(())
}

async fn run_dump_core(workspace: &std::path::Path) -> Result<()> {
    let config = EngineConfig::load_from(workspace.join("halcyon.toml"))?;
    let system = MemorySystem::initialize(workspace, config.memory.clone(), build_embedder()).await;
    println!("{}", system.core.render_context());
    Ok(())
}

async fn run_lab_script(lab_root: &std::path::Path, script_file: &std::path::Path, run_name: &str) -> Result<()> {
    let raw = tokio::fs::read_to_string(script_file).await.context("reading lab script")?;
    let script: Vec<ScriptedMessage> = serde_json::from_str(&raw).context("parsing lab script JSON")?;

    let mut harness = LabHarness::new(
        lab_root,
        HarnessConfig { run_name: run_name.to_string(), ..Default::default() },
        build_chat_provider(),
    );
    harness.start().await?;

    let messages = script.into_iter().map(ScriptedMessage::into_script_message).collect();
    let results = harness.run_script(messages, Duration::from_millis(100)).await?;

    for result in &results {
        let content = result.response.as_ref().map(|r| r.content.as_str()).unwrap_or("<no response>");
        println!("{} -> {} ({:.0}ms)", result.input.content, content, result.elapsed_ms);
    }

    harness.stop().await?;
    Ok(())
}

#[derive(serde::Deserialize)]
struct ScriptedMessage {
    sender_id: String,
    content: String,
    #[serde(default = "default_chat_id")]
    chat_id: String,
    #[serde(default = "default_true")]
    expect_response: bool,
}

fn default_chat_id() -> String {
    "lab_general".to_string()
}

fn default_true() -> bool {
    true
}

impl ScriptedMessage {
    fn into_script_message(self) -> ScriptMessage {
        let mut message = ScriptMessage::new(self.sender_id, self.content);
        message.chat_id = self.chat_id;
        message.expect_response = self.expect_response;
        message
    }
}

async fn read_stdin() -> Result<String> {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    tokio::io::stdin().read_to_string(&mut buf).await?;
    Ok(buf)
}

fn build_consolidator(config: &EngineConfig) -> Consolidator {
    let model = config.consolidator.model.clone().unwrap_or_else(|| "local/default".to_string());
    Consolidator::new(build_chat_provider(), model, config.consolidator.temperature)
}

fn build_chat_provider() -> Arc<dyn ChatProvider> {
    let base_url = std::env::var("HALCYON_API_BASE").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let api_key = std::env::var("HALCYON_API_KEY").ok();
    Arc::new(HttpChatProvider::new(base_url, api_key))
}

fn build_embedder() -> EmbeddingGateway {
    match std::env::var("HALCYON_API_KEY") {
        Ok(api_key) => {
            let base_url = std::env::var("HALCYON_API_BASE").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            let embedder: Box<dyn RemoteEmbedder> = Box::new(HttpEmbedder::new(base_url, "text-embedding-3-small", Some(api_key)));
            EmbeddingGateway::new(Some(embedder))
        }
        Err(_) => EmbeddingGateway::new(None),
    }
}
