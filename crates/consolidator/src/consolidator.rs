//! Consolidator: turns a pile of raw conversation and stored memories
//! into durable facts, entities, reflections, and a pruned, on-budget
//! memory store (§4.7). Two paths: `process_idle` runs after a short
//! quiet period, `process_daily` runs once a day and does the heavier
//! review work.

use std::sync::Arc;

use chrono::Local;
use serde::Deserialize;

use halcyon_llm::{extract_json_output, ChatMessage, ChatProvider, ChatRequest};
use halcyon_memory::{EntityType, MemorySystem, MemoryType};

use crate::prompts;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleStats {
    pub facts_added: u32,
    pub entities_updated: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyStats {
    pub reflections_added: u32,
    pub memories_pruned: u32,
    pub core_entries_archived: u32,
}

pub struct Consolidator {
    provider: Arc<dyn ChatProvider>,
    model: String,
    temperature: f32,
}

impl Consolidator {
    pub fn new(provider: Arc<dyn ChatProvider>, model: impl Into<String>, temperature: f32) -> Self {
        Self { provider, model: model.into(), temperature }
    }

    async fn call(&self, prompt: String) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            tools: Vec::new(),
            temperature: self.temperature,
            max_tokens: Some(2048),
        };
        let response = self.provider.chat(&request).await?;
        Ok(response.content)
    }

    /// 1. extract facts/entities, 2. check each fact for contradictions,
    /// 3. index new facts, 4. upsert entities, 5. write a diary entry —
    /// only when something was actually learned.
    pub async fn process_idle(&self, system: &mut MemorySystem, conversation_text: &str) -> IdleStats {
        let mut stats = IdleStats::default();

        if conversation_text.trim().is_empty() {
            tracing::debug!("no conversation text for idle processing, skipping");
            return stats;
        }

        let Some(extracted) = self.extract_facts_and_entities(conversation_text).await else {
            return stats;
        };

        let Some(vector) = &system.vector else {
            return stats;
        };

        for fact in &extracted.facts {
            let content = fact.content.trim();
            if content.is_empty() {
                continue;
            }
            let importance = fact.importance.clamp(1, 10);

            self.check_and_handle_contradiction(system, content, importance).await;

            if vector
                .add_memory(content, MemoryType::Fact, importance, "consolidator_idle", &fact.related_entities)
                .await
                .is_ok()
            {
                stats.facts_added += 1;
            }
        }

        for entity in &extracted.entities {
            let name = entity.name.trim();
            if name.is_empty() {
                continue;
            }
            let entity_type = parse_entity_type(&entity.r#type);
            if vector
                .upsert_entity(name, entity_type, &entity.description, entity.importance.clamp(1, 10), &[])
                .await
                .is_ok()
            {
                stats.entities_updated += 1;
            }
        }

        if stats.facts_added > 0 {
            let diary_entry = build_diary_entry(&extracted.facts, &extracted.entities);
            if let Err(err) = system.write_diary_entry(&diary_entry).await {
                tracing::error!(error = %err, "failed to write idle diary entry");
            }
        }

        tracing::info!(facts = stats.facts_added, entities = stats.entities_updated, "idle consolidation complete");
        stats
    }

    async fn extract_facts_and_entities(&self, text: &str) -> Option<ExtractedFacts> {
        let prompt = prompts::extract_facts_prompt(text);
        match self.call(prompt).await {
            Ok(response) => extract_json_output(&response),
            Err(err) => {
                tracing::error!(error = %err, "fact extraction call failed");
                None
            }
        }
    }

    async fn check_and_handle_contradiction(&self, system: &MemorySystem, new_fact: &str, _importance: i32) {
        let Some(vector) = &system.vector else { return };
        let similar = match vector.search(new_fact, Some(MemoryType::Fact), 0, 3, 2).await {
            Ok(results) => results,
            Err(_) => return,
        };
        let Some(top) = similar.first() else { return };
        if top.score < 0.5 {
            return;
        }

        let prompt = prompts::contradiction_check_prompt(&top.record.content, new_fact);
        let Ok(response) = self.call(prompt).await else { return };
        let Some(check) = extract_json_output::<ContradictionCheck>(&response) else { return };

        if check.contradicts && check.keep == "new" {
            if let Err(err) = vector.mark_superseded(&top.record.id, "new_fact") {
                tracing::error!(error = %err, "failed to mark contradicted memory superseded");
            } else {
                tracing::info!(old_id = %top.record.id, "contradiction resolved: superseded by newer fact");
            }
        }
    }

    /// 1. generate reflections, 2. prune weak memories, 3. review core
    /// budget, writing one diary entry summarizing all three.
    pub async fn process_daily(&self, system: &mut MemorySystem) -> DailyStats {
        let mut stats = DailyStats::default();

        if system.vector.is_some() {
            stats.reflections_added = self.generate_reflections(system).await;
            stats.memories_pruned = self.prune_weak_memories(system).await;
        }
        stats.core_entries_archived = self.review_core_budget(system).await;

        let summary = format!(
            "**{}** — Daily deep processing: {} reflections, {} pruned, {} core entries archived.",
            Local::now().format("%H:%M"),
            stats.reflections_added,
            stats.memories_pruned,
            stats.core_entries_archived
        );
        if let Err(err) = system.write_diary_entry(&summary).await {
            tracing::error!(error = %err, "failed to write daily diary entry");
        }

        tracing::info!(?stats, "daily consolidation complete");
        stats
    }

    async fn generate_reflections(&self, system: &MemorySystem) -> u32 {
        let Some(vector) = &system.vector else { return 0 };
        let results = match vector.search("recent events conversations facts", None, 0, 20, 2).await {
            Ok(r) => r,
            Err(_) => return 0,
        };
        if results.len() < 3 {
            return 0;
        }

        let memory_text = results
            .iter()
            .take(15)
            .map(|r| format!("- [{}] {}", r.record.memory_type.as_str(), r.record.content))
            .collect::<Vec<_>>()
            .join("\n");
        let source_ids: Vec<String> = results.iter().take(5).map(|r| r.record.id.clone()).collect();

        let prompt = prompts::reflection_prompt(&memory_text);
        let Ok(response) = self.call(prompt).await else { return 0 };
        let Some(parsed) = extract_json_output::<ReflectionsResponse>(&response) else { return 0 };

        let mut count = 0;
        for reflection in parsed.reflections {
            let content = reflection.content.trim();
            if content.is_empty() {
                continue;
            }
            if vector
                .add_reflection(content, reflection.importance.clamp(1, 10), source_ids.clone(), &reflection.topic)
                .is_ok()
            {
                count += 1;
            }
        }
        count
    }

    async fn prune_weak_memories(&self, system: &MemorySystem) -> u32 {
        let Some(vector) = &system.vector else { return 0 };
        let candidates = vector.get_pruning_candidates(0.1, 0.2, 4, 20).unwrap_or_default();
        if candidates.is_empty() {
            return 0;
        }

        let candidates_text = candidates
            .iter()
            .map(|c| format!("- id:{} | strength:{:.2} | content: {}", c.id, c.strength, truncate(&c.content, 100)))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::pruning_prompt(&candidates_text);
        let Ok(response) = self.call(prompt).await else { return 0 };
        let Some(parsed) = extract_json_output::<PruningResponse>(&response) else { return 0 };

        let mut pruned = 0;
        for decision in parsed.decisions {
            if decision.action == "prune" && vector.delete_memory(&decision.id).unwrap_or(false) {
                pruned += 1;
            }
        }
        pruned
    }

    async fn review_core_budget(&self, system: &mut MemorySystem) -> u32 {
        if !system.core.is_over_budget() {
            return 0;
        }
        let over_by = system.core.get_total_tokens() as i64 - system.core.token_budget() as i64;

        let entries_text = system
            .core
            .all_entries()
            .into_iter()
            .map(|(section, entry)| format!("- id:{} | section:{} | imp:{} | content: {}", entry.id, section, entry.importance, truncate(&entry.content, 100)))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompts::core_review_prompt(over_by, &entries_text);
        let Ok(response) = self.call(prompt).await else { return 0 };
        let Some(parsed) = extract_json_output::<CoreReviewResponse>(&response) else { return 0 };

        let mut archived = 0;
        for item in parsed.archive {
            let Some(deleted) = system.core.delete(&item.id).await else { continue };
            if let Some(vector) = &system.vector {
                if vector
                    .add_memory(&deleted.content, MemoryType::ArchivedCore, deleted.importance as i32, "core_budget_review", "")
                    .await
                    .is_ok()
                {
                    archived += 1;
                }
            }
        }
        archived
    }
}

fn parse_entity_type(raw: &str) -> EntityType {
    match raw.to_lowercase().as_str() {
        "person" => EntityType::Person,
        "place" => EntityType::Place,
        "project" => EntityType::Project,
        "organization" => EntityType::Organization,
        _ => EntityType::Other,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn build_diary_entry(facts: &[ExtractedFact], entities: &[ExtractedEntity]) -> String {
    let now = Local::now().format("%H:%M");
    let mut lines = vec![format!("**{now}** — Consolidator processed idle conversation.")];

    if !facts.is_empty() {
        lines.push("Facts learned:".to_string());
        for fact in facts.iter().take(5) {
            lines.push(format!("  - {} (imp:{})", fact.content, fact.importance));
        }
    }
    if !entities.is_empty() {
        lines.push("Entities seen:".to_string());
        for entity in entities.iter().take(5) {
            lines.push(format!("  - {} ({})", entity.name, entity.r#type));
        }
    }
    lines.join("\n")
}

#[derive(Debug, Deserialize, Default)]
struct ExtractedFacts {
    #[serde(default)]
    facts: Vec<ExtractedFact>,
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    content: String,
    #[serde(default = "default_importance")]
    importance: i32,
    #[serde(default)]
    related_entities: String,
}

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    name: String,
    #[serde(default = "default_entity_type", rename = "type")]
    r#type: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_importance")]
    importance: i32,
}

fn default_importance() -> i32 {
    5
}

fn default_entity_type() -> String {
    "other".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct ContradictionCheck {
    #[serde(default)]
    contradicts: bool,
    #[serde(default = "default_keep")]
    keep: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

fn default_keep() -> String {
    "existing".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct ReflectionsResponse {
    #[serde(default)]
    reflections: Vec<ReflectionItem>,
}

#[derive(Debug, Deserialize)]
struct ReflectionItem {
    content: String,
    #[serde(default)]
    topic: String,
    #[serde(default = "default_importance")]
    importance: i32,
}

#[derive(Debug, Deserialize, Default)]
struct PruningResponse {
    #[serde(default)]
    decisions: Vec<PruningDecision>,
}

#[derive(Debug, Deserialize)]
struct PruningDecision {
    id: String,
    action: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

#[derive(Debug, Deserialize, Default)]
struct CoreReviewResponse {
    #[serde(default)]
    archive: Vec<ArchiveItem>,
}

#[derive(Debug, Deserialize)]
struct ArchiveItem {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use halcyon_config::MemoryConfig;
    use halcyon_embeddings::EmbeddingGateway;
    use halcyon_llm::{ChatError, ChatResponse};
    use std::sync::Mutex;

    struct ScriptedProvider {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<&str>) -> Self {
            Self { replies: Mutex::new(replies.into_iter().map(str::to_string).rev().collect()) }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ChatError> {
            let content = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(ChatResponse { content, finish_reason: "stop".to_string(), ..Default::default() })
        }
    }

    async fn system() -> (MemorySystem, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let system = MemorySystem::initialize(dir.path(), MemoryConfig::default(), EmbeddingGateway::new(None)).await;
        (system, dir)
    }

    #[tokio::test]
    async fn s6_idle_consolidation_extracts_and_writes_diary() {
        let (mut system, _dir) = system().await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            r#"{"facts":[{"content":"CCC lives in Tokyo","importance":7,"related_entities":"CCC"}],"entities":[{"name":"CCC","type":"person","description":"an artist","importance":6}]}"#,
        ]));
        let consolidator = Consolidator::new(provider, "test-model", 0.1);

        let stats = consolidator.process_idle(&mut system, "CCC: I live in Tokyo now.").await;
        assert_eq!(stats.facts_added, 1);
        assert_eq!(stats.entities_updated, 1);

        let diary = system.diary().recent_context(1).await.unwrap();
        assert!(diary.contains("Consolidator processed idle conversation"));
    }

    #[tokio::test]
    async fn idle_processing_skips_empty_conversation() {
        let (mut system, _dir) = system().await;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let consolidator = Consolidator::new(provider, "test-model", 0.1);
        let stats = consolidator.process_idle(&mut system, "   ").await;
        assert_eq!(stats.facts_added, 0);
    }

    #[tokio::test]
    async fn daily_processing_generates_reflections_from_enough_memories() {
        let (mut system, _dir) = system().await;
        if let Some(vector) = &system.vector {
            for content in ["alpha fact", "beta fact", "gamma fact"] {
                vector.add_memory(content, MemoryType::Fact, 5, "seed", "").await.unwrap();
            }
        }
        let provider = Arc::new(ScriptedProvider::new(vec![
            r#"{"reflections":[{"content":"three separate facts were logged today","topic":"summary","importance":4}]}"#,
            r#"{"decisions":[]}"#,
        ]));
        let consolidator = Consolidator::new(provider, "test-model", 0.1);
        let stats = consolidator.process_daily(&mut system).await;
        assert_eq!(stats.reflections_added, 1);
    }
}
