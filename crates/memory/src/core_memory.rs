//! Core Memory: structured, sectioned, token-budgeted working memory.
//!
//! Persisted as a single `core.json` document (schema §6). Every
//! successful mutation recomputes the cached token count and writes the
//! whole document atomically before returning (§4.3 persistence protocol).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use halcyon_tokenizer::count as count_tokens;

pub const SECTION_NAMES: [&str; 5] = ["identity", "people", "preferences", "context", "scratch"];
pub const DEFAULT_TOKEN_BUDGET: u32 = 4000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreMemoryError {
    #[error("Unknown section '{0}'.")]
    UnknownSection(String),
    #[error(
        "Section '{section}' is full ({used}/{max} tokens, need {need} more). Delete or edit entries in this section to make room."
    )]
    SectionFull {
        section: String,
        used: u32,
        max: u32,
        need: u32,
    },
    #[error("Global budget full ({used}/{budget} tokens). Delete entries from any section to make room.")]
    GlobalFull { used: u32, budget: u32 },
    #[error("No entry found with id '{0}'.")]
    NotFound(String),
}

impl CoreMemoryError {
    /// Diagnostic string naming the binding constraint, for inclusion in a
    /// tool's reply (§4.3 error surface).
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreEntry {
    pub id: String,
    pub content: String,
    pub importance: u8,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreSection {
    pub label: String,
    pub max_tokens: u32,
    pub entries: Vec<CoreEntry>,
}

impl CoreSection {
    fn token_total(&self) -> u32 {
        self.entries
            .iter()
            .map(|e| count_tokens(&e.content) as u32)
            .sum()
    }
}

fn default_sections() -> BTreeMap<String, CoreSection> {
    let layout: [(&str, &str, u32); 5] = [
        ("identity", "Who I Am", 600),
        ("people", "People I Know", 1200),
        ("preferences", "Preferences & Rules", 800),
        ("context", "Current Context", 600),
        ("scratch", "Working Notes", 800),
    ];
    layout
        .into_iter()
        .map(|(name, label, max_tokens)| {
            (
                name.to_string(),
                CoreSection {
                    label: label.to_string(),
                    max_tokens,
                    entries: Vec::new(),
                },
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreDocument {
    pub version: u32,
    pub token_budget: u32,
    pub token_count: u32,
    pub sections: BTreeMap<String, CoreSection>,
}

impl Default for CoreDocument {
    fn default() -> Self {
        Self {
            version: 2,
            token_budget: DEFAULT_TOKEN_BUDGET,
            token_count: 0,
            sections: default_sections(),
        }
    }
}

impl CoreDocument {
    fn recount(&mut self) {
        self.token_count = self.sections.values().map(CoreSection::token_total).sum();
    }

    fn ensure_default_sections(&mut self) {
        for (name, sec) in default_sections() {
            self.sections.entry(name).or_insert(sec);
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `CoreMemory` owns the document and its on-disk path, matching
/// `core_memory.py`'s `CoreMemory` class shape (load-on-construct,
/// save-on-every-mutation, corrupt-document recovers to empty).
pub struct CoreMemory {
    path: PathBuf,
    token_budget: u32,
    doc: CoreDocument,
}

impl CoreMemory {
    pub async fn open(memory_dir: impl AsRef<Path>, token_budget: u32) -> Self {
        let path = memory_dir.as_ref().join("core.json");
        let doc = Self::load_or_init(&path, token_budget).await;
        Self { path, token_budget, doc }
    }

    async fn load_or_init(path: &Path, token_budget: u32) -> CoreDocument {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<CoreDocument>(&raw) {
                Ok(mut doc) => {
                    doc.ensure_default_sections();
                    doc.recount();
                    doc
                }
                Err(err) => {
                    tracing::error!(error = %err, path = %path.display(), "corrupt core.json, reinitializing");
                    CoreDocument {
                        token_budget,
                        ..CoreDocument::default()
                    }
                }
            },
            Err(_) => CoreDocument {
                token_budget,
                ..CoreDocument::default()
            },
        }
    }

    async fn persist(&mut self) -> std::io::Result<()> {
        self.doc.recount();
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rendered = serde_json::to_string_pretty(&self.doc).expect("CoreDocument always serializes");
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub fn document(&self) -> &CoreDocument {
        &self.doc
    }

    pub async fn add(
        &mut self,
        section: &str,
        content: &str,
        importance: i32,
    ) -> Result<String, CoreMemoryError> {
        let content = content.trim();
        let sec = self
            .doc
            .sections
            .get(section)
            .ok_or_else(|| CoreMemoryError::UnknownSection(section.to_string()))?;

        let new_tokens = count_tokens(content) as u32;
        let sec_tokens = sec.token_total();
        if sec_tokens + new_tokens > sec.max_tokens {
            return Err(CoreMemoryError::SectionFull {
                section: section.to_string(),
                used: sec_tokens,
                max: sec.max_tokens,
                need: new_tokens,
            });
        }
        if self.doc.token_count + new_tokens > self.token_budget {
            return Err(CoreMemoryError::GlobalFull {
                used: self.doc.token_count,
                budget: self.token_budget,
            });
        }

        let id = short_id();
        let now = now_iso();
        let entry = CoreEntry {
            id: id.clone(),
            content: content.to_string(),
            importance: importance.clamp(1, 10) as u8,
            created_at: now.clone(),
            updated_at: now,
        };
        self.doc
            .sections
            .get_mut(section)
            .expect("section existence checked above")
            .entries
            .push(entry);
        self.persist().await.map_err(|_| CoreMemoryError::NotFound(id.clone()))?;
        tracing::info!(id = %id, section = %section, "core memory entry added");
        Ok(id)
    }

    fn locate(&self, entry_id: &str) -> Option<(String, usize)> {
        for (name, sec) in &self.doc.sections {
            if let Some(idx) = sec.entries.iter().position(|e| e.id == entry_id) {
                return Some((name.clone(), idx));
            }
        }
        None
    }

    pub async fn edit(
        &mut self,
        entry_id: &str,
        new_content: Option<&str>,
        new_section: Option<&str>,
        importance: Option<i32>,
    ) -> Result<(), CoreMemoryError> {
        let (current_section, idx) = self
            .locate(entry_id)
            .ok_or_else(|| CoreMemoryError::NotFound(entry_id.to_string()))?;

        if let Some(target) = new_section {
            if target != current_section {
                let target_sec = self
                    .doc
                    .sections
                    .get(target)
                    .ok_or_else(|| CoreMemoryError::UnknownSection(target.to_string()))?;
                let current_entry = &self.doc.sections[&current_section].entries[idx];
                let content_to_check = new_content.unwrap_or(&current_entry.content);
                let target_tokens = target_sec.token_total();
                let needed = count_tokens(content_to_check) as u32;
                if target_tokens + needed > target_sec.max_tokens {
                    return Err(CoreMemoryError::SectionFull {
                        section: target.to_string(),
                        used: target_tokens,
                        max: target_sec.max_tokens,
                        need: needed,
                    });
                }
            }
        }

        if let Some(new_content) = new_content {
            let old_tokens = count_tokens(&self.doc.sections[&current_section].entries[idx].content) as i64;
            let new_tokens = count_tokens(new_content) as i64;
            let delta = new_tokens - old_tokens;
            let projected = self.doc.token_count as i64 + delta;
            if projected > self.token_budget as i64 {
                return Err(CoreMemoryError::GlobalFull {
                    used: self.doc.token_count,
                    budget: self.token_budget,
                });
            }
            self.doc.sections.get_mut(&current_section).unwrap().entries[idx].content =
                new_content.trim().to_string();
        }

        if let Some(importance) = importance {
            self.doc.sections.get_mut(&current_section).unwrap().entries[idx].importance =
                importance.clamp(1, 10) as u8;
        }
        self.doc.sections.get_mut(&current_section).unwrap().entries[idx].updated_at = now_iso();

        if let Some(target) = new_section {
            if target != current_section {
                let entry = self.doc.sections.get_mut(&current_section).unwrap().entries.remove(idx);
                self.doc.sections.get_mut(target).unwrap().entries.push(entry);
            }
        }

        self.persist().await.map_err(|_| CoreMemoryError::NotFound(entry_id.to_string()))?;
        tracing::info!(id = %entry_id, "core memory entry edited");
        Ok(())
    }

    pub async fn delete(&mut self, entry_id: &str) -> Option<CoreEntry> {
        let (section, idx) = self.locate(entry_id)?;
        let entry = self.doc.sections.get_mut(&section).unwrap().entries.remove(idx);
        if self.persist().await.is_err() {
            tracing::error!(id = %entry_id, "failed to persist after delete");
        }
        tracing::info!(id = %entry_id, section = %section, "core memory entry deleted");
        Some(entry)
    }

    /// Every entry paired with the name of the section that holds it, for
    /// budget-review tooling that needs to reason across all sections.
    pub fn all_entries(&self) -> Vec<(String, &CoreEntry)> {
        self.doc
            .sections
            .iter()
            .flat_map(|(name, sec)| sec.entries.iter().map(move |e| (name.clone(), e)))
            .collect()
    }

    pub fn find(&self, entry_id: &str) -> Option<&CoreEntry> {
        self.doc
            .sections
            .values()
            .flat_map(|s| s.entries.iter())
            .find(|e| e.id == entry_id)
    }

    pub fn get_total_tokens(&self) -> u32 {
        self.doc.token_count
    }

    pub fn get_section_tokens(&self, section: &str) -> u32 {
        self.doc.sections.get(section).map(CoreSection::token_total).unwrap_or(0)
    }

    pub fn is_over_budget(&self) -> bool {
        self.doc.token_count > self.token_budget
    }

    pub fn budget_remaining(&self) -> u32 {
        self.token_budget.saturating_sub(self.doc.token_count)
    }

    pub fn token_budget(&self) -> u32 {
        self.token_budget
    }

    /// Renders the markdown block injected into the system prompt (§4.3).
    pub fn render_context(&self) -> String {
        let mut lines = vec![format!(
            "## Core Memory ({}/{} tokens)\n",
            self.doc.token_count, self.token_budget
        )];

        for name in SECTION_NAMES {
            let Some(sec) = self.doc.sections.get(name) else {
                continue;
            };
            if sec.entries.is_empty() {
                continue;
            }
            if name == "context" {
                lines.push(format!("### {} (background notes, NOT current conversation)", sec.label));
            } else {
                lines.push(format!("### {}", sec.label));
            }
            for entry in &sec.entries {
                lines.push(format!("- {} [id:{}]", entry.content, entry.id));
            }
            lines.push(String::new());
        }

        lines.join("\n").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_tmp(budget: u32) -> (CoreMemory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mem = CoreMemory::open(dir.path(), budget).await;
        (mem, dir)
    }

    #[tokio::test]
    async fn s1_save_and_render() {
        let (mut mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        let id = mem.add("identity", "I'm Ene. Dad built me.", 10).await.unwrap();
        let rendered = mem.render_context();
        assert!(rendered.contains(&format!("- I'm Ene. Dad built me. [id:{id}]")));
        assert!(rendered.contains("### Who I Am"));
    }

    #[tokio::test]
    async fn s2_budget_reject_contains_budget_word() {
        let (mut mem, _dir) = open_tmp(5).await;
        let err = mem
            .add("scratch", "This is a long sentence that will surely exceed five tokens", 5)
            .await
            .unwrap_err();
        assert!(err.diagnostic().to_lowercase().contains("budget"));
    }

    #[tokio::test]
    async fn unknown_section_is_rejected() {
        let (mut mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        let err = mem.add("nonexistent", "hi", 5).await.unwrap_err();
        assert!(matches!(err, CoreMemoryError::UnknownSection(_)));
    }

    #[tokio::test]
    async fn section_full_is_distinguished_from_global_full() {
        let (mut mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        // identity budget is 600 tokens; push content far past it while
        // staying under the 4000 global budget.
        let filler = "word ".repeat(1000);
        let err = mem.add("identity", &filler, 5).await.unwrap_err();
        assert!(matches!(err, CoreMemoryError::SectionFull { .. }));
    }

    #[tokio::test]
    async fn importance_out_of_range_is_clamped_not_rejected() {
        let (mut mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        let id = mem.add("scratch", "note", 99).await.unwrap();
        assert_eq!(mem.find(&id).unwrap().importance, 10);
        let id2 = mem.add("scratch", "note2", -5).await.unwrap();
        assert_eq!(mem.find(&id2).unwrap().importance, 1);
    }

    #[tokio::test]
    async fn delete_then_find_returns_none_and_is_idempotent() {
        let (mut mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        let id = mem.add("scratch", "note", 5).await.unwrap();
        let deleted = mem.delete(&id).await;
        assert!(deleted.is_some());
        assert!(mem.find(&id).is_none());
        assert!(mem.delete(&id).await.is_none());
    }

    #[tokio::test]
    async fn save_load_round_trip_preserves_structure_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut mem = CoreMemory::open(dir.path(), DEFAULT_TOKEN_BUDGET).await;
            mem.add("identity", "hello", 5).await.unwrap();
        }
        let reloaded = CoreMemory::open(dir.path(), DEFAULT_TOKEN_BUDGET).await;
        assert_eq!(reloaded.get_total_tokens(), count_tokens("hello") as u32);
        assert_eq!(reloaded.document().sections["identity"].entries.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_document_reinitializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("core.json"), "{not valid json").await.unwrap();
        let mem = CoreMemory::open(dir.path(), DEFAULT_TOKEN_BUDGET).await;
        assert_eq!(mem.get_total_tokens(), 0);
    }

    #[tokio::test]
    async fn empty_sections_are_omitted_from_render() {
        let (mem, _dir) = open_tmp(DEFAULT_TOKEN_BUDGET).await;
        assert_eq!(mem.render_context(), format!("## Core Memory (0/{DEFAULT_TOKEN_BUDGET} tokens)"));
    }
}
