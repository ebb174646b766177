//! Memory System facade: coordinates Core + Vector + diary, builds
//! context blocks, and runs the one-time legacy migration (§4.5).

use std::path::{Path, PathBuf};

use halcyon_config::MemoryConfig;
use halcyon_embeddings::EmbeddingGateway;

use crate::core_memory::CoreMemory;
use crate::diary::Diary;
use crate::vector_memory::{MemoryType, VectorMemory};

pub struct MemorySystem {
    pub core: CoreMemory,
    pub vector: Option<VectorMemory>,
    diary: Diary,
    workspace: PathBuf,
    config: MemoryConfig,
}

impl MemorySystem {
    pub async fn initialize(workspace: impl Into<PathBuf>, config: MemoryConfig, embedder: EmbeddingGateway) -> Self {
        let workspace = workspace.into();
        let memory_dir = workspace.join("memory");
        let core = CoreMemory::open(&memory_dir, config.token_budget).await;

        // Vector init failure is non-fatal: the facade still functions
        // with Core-only context, matching `MemorySystem.initialize()`'s
        // try/except around vector-store construction.
        let vector = match VectorMemory::open(workspace.join(&config.chroma_path).join("vector.redb"), embedder) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::error!(error = %err, "vector memory unavailable, continuing with core-only context");
                None
            }
        };

        let diary = Diary::new(memory_dir.join("diary"));

        let mut system = Self {
            core,
            vector,
            diary,
            workspace,
            config,
        };
        system.maybe_migrate().await;
        system
    }

    pub fn diary(&self) -> &Diary {
        &self.diary
    }

    /// Core's rendered block plus a "Recent Diary" block (§4.5).
    pub async fn memory_context(&self) -> String {
        let mut parts = vec![self.core.render_context()];
        if let Some(diary_block) = self.diary.recent_context(self.config.diary_context_days).await {
            parts.push(format!("## Recent Diary\n\n{diary_block}"));
        }
        parts.join("\n\n")
    }

    /// "Retrieved Memories" + "Entity Context" blocks for a single inbound
    /// message (§4.5). Either sub-block is omitted when empty.
    pub async fn relevant_context(&self, message: &str) -> String {
        let Some(vector) = &self.vector else {
            return String::new();
        };

        let mut parts = Vec::new();

        match vector.search(message, None, 0, 5, 2).await {
            Ok(results) if !results.is_empty() => {
                let mut lines = vec!["## Retrieved Memories".to_string()];
                for r in &results {
                    lines.push(format!("- [{}] {}", r.record.memory_type.as_str(), r.record.content));
                }
                parts.push(lines.join("\n"));
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "relevant_context search failed, omitting retrieved memories block");
            }
        }

        let entity_block = self.entity_context(vector, message);
        if let Some(block) = entity_block {
            parts.push(block);
        }

        parts.join("\n\n")
    }

    fn entity_context(&self, vector: &VectorMemory, message: &str) -> Option<String> {
        let lower = message.to_lowercase();
        let names = vector.get_entity_names();
        let mut seen = std::collections::HashSet::new();
        let mut lines = vec!["## Entity Context".to_string()];

        for (name_or_alias, id) in names {
            if lower.contains(&name_or_alias) && seen.insert(id.clone()) {
                match vector.get_entity(&id) {
                    Ok(Some(entity)) => {
                        lines.push(format!("- **{}** ({:?}): {}", entity.name, entity.entity_type, entity.description));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "entity lookup failed during relevant_context");
                    }
                }
            }
        }

        (lines.len() > 1).then(|| lines.join("\n"))
    }

    pub async fn write_diary_entry(&self, text: &str) -> std::io::Result<()> {
        self.diary.write_entry(text).await
    }

    /// One-shot legacy migration (§4.5): if `memory/core.json` was absent
    /// at open time (i.e. Core started empty) and a legacy markdown file
    /// exists, parse it into Core sections, overflow anything that
    /// doesn't fit into Vector as `archived_core`, and rename the legacy
    /// file with a `.bak` suffix.
    async fn maybe_migrate(&mut self) {
        if self.core.get_total_tokens() != 0 {
            return;
        }

        let candidates = [
            self.workspace.join("MEMORY.md"),
            self.workspace.join("CORE.md"),
            self.workspace.join("memory").join("MEMORY.md"),
            self.workspace.join("memory").join("CORE.md"),
        ];

        let Some(legacy_path) = candidates.into_iter().find(|p| p.exists()) else {
            return;
        };

        if let Err(err) = self.run_migration(&legacy_path).await {
            tracing::error!(error = %err, path = %legacy_path.display(), "legacy migration failed, continuing with partial results");
        }

        self.index_diary_files().await;
    }

    async fn run_migration(&mut self, legacy_path: &Path) -> std::io::Result<()> {
        let raw = tokio::fs::read_to_string(legacy_path).await?;
        let mut current_section = "scratch".to_string();

        for raw_line in raw.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(heading) = line.strip_prefix('#') {
                let lower = heading.trim().to_lowercase();
                current_section = detect_section(&lower).unwrap_or(current_section);
                continue;
            }

            let content = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")).unwrap_or(line);
            if content.is_empty() {
                continue;
            }

            if self.core.add(&current_section, content, 5).await.is_err() {
                if let Some(vector) = &self.vector {
                    let _ = vector
                        .add_memory(content, MemoryType::ArchivedCore, 5, "migration", "")
                        .await;
                }
            }
        }

        let backup_path = legacy_path.with_extension("md.bak");
        tokio::fs::rename(legacy_path, backup_path).await?;
        Ok(())
    }

    async fn index_diary_files(&self) {
        let Some(vector) = &self.vector else { return };
        let Ok(names) = self.diary.file_names() else { return };
        for name in names {
            let path = self.diary.dir().join(&name);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                let truncated: String = content.chars().take(500).collect();
                let labeled = format!("{name}: {truncated}");
                let _ = vector
                    .add_memory(&labeled, MemoryType::Diary, 4, "diary_migration", "")
                    .await;
            }
        }
    }
}

fn detect_section(lower_heading: &str) -> Option<String> {
    if lower_heading.contains("identity") || lower_heading.contains("who i am") {
        Some("identity".to_string())
    } else if lower_heading.contains("people") || lower_heading.contains("person") {
        Some("people".to_string())
    } else if lower_heading.contains("preference") || lower_heading.contains("rule") {
        Some("preferences".to_string())
    } else if lower_heading.contains("context") || lower_heading.contains("current") {
        Some("context".to_string())
    } else {
        None
    }
}

/// Convenience re-export so callers don't need to reach into
/// `vector_memory` just to spell an entity/memory type at a call site.
pub use crate::vector_memory::{EntityType as FacadeEntityType, MemoryType as FacadeMemoryType};

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> EmbeddingGateway {
        EmbeddingGateway::new(None)
    }

    #[tokio::test]
    async fn memory_context_combines_core_and_diary() {
        let dir = tempfile::tempdir().unwrap();
        let mut system = MemorySystem::initialize(dir.path(), MemoryConfig::default(), gateway()).await;
        system.core.add("identity", "I'm Ene.", 5).await.unwrap();
        system.write_diary_entry("Met someone new today.").await.unwrap();
        let context = system.memory_context().await;
        assert!(context.contains("I'm Ene."));
        assert!(context.contains("Recent Diary"));
    }

    #[tokio::test]
    async fn relevant_context_empty_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let system = MemorySystem::initialize(dir.path(), MemoryConfig::default(), gateway()).await;
        let context = system.relevant_context("anything").await;
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn migration_parses_headings_and_bullets() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("MEMORY.md"),
            "# Who I Am\n- I'm Ene.\n# People\n- CCC is an artist.\n",
        )
        .await
        .unwrap();
        let system = MemorySystem::initialize(dir.path(), MemoryConfig::default(), gateway()).await;
        let rendered = system.core.render_context();
        assert!(rendered.contains("I'm Ene."));
        assert!(rendered.contains("CCC is an artist."));
        assert!(dir.path().join("MEMORY.md.bak").exists());
        assert!(!dir.path().join("MEMORY.md").exists());
    }
}
