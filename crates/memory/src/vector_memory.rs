//! Vector Memory: long-term store of memories, entities, and reflections
//! with approximate nearest-neighbor search, re-ranking, access tracking,
//! and supersede/delete (§4.4).
//!
//! The retrieved corpus has no production vector-index driver to target
//! (out of scope per §1), so candidates are kept in a redb-backed table —
//! the same secondary-index shape the host codebase uses for its own
//! memory tiers — with an LRU cache of hot records in front of it, and
//! cosine similarity computed over the stored embeddings directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use lru::LruCache;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use halcyon_embeddings::{EmbeddingError, EmbeddingGateway};

const MEMORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memories");
const ENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");
const REFLECTION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("reflections");

const CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum VectorMemoryError {
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<EmbeddingError> for VectorMemoryError {
    fn from(err: EmbeddingError) -> Self {
        VectorMemoryError::EmbeddingUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Fact,
    Diary,
    Reflection,
    ArchivedCore,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Diary => "diary",
            MemoryType::Reflection => "reflection",
            MemoryType::ArchivedCore => "archived_core",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Place,
    Project,
    Organization,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub importance: u8,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub source: String,
    pub related_entities: String,
    pub superseded_by: Option<String>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub entity_type: EntityType,
    pub description: String,
    pub importance: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub interaction_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub id: String,
    pub content: String,
    pub importance: u8,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub source_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryResult {
    pub record: MemoryRecord,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct PruneCandidate {
    pub id: String,
    pub content: String,
    pub strength: f32,
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn strength(importance: u8, access_count: u32, last_accessed_at: DateTime<Utc>, decay_rate: f32) -> f32 {
    let days_since = (Utc::now() - last_accessed_at).num_seconds() as f32 / 86_400.0;
    let recency = (-decay_rate * days_since.max(0.0)).exp();
    let frequency = 0.05 * (access_count.min(10) as f32);
    let importance_term = 0.1 * (importance as f32 / 10.0);
    (recency + frequency + importance_term).clamp(0.0, 1.0)
}

fn score(similarity: f32, importance: u8, strength: f32) -> f32 {
    0.6 * similarity + 0.25 * (importance as f32 / 10.0) + 0.15 * strength
}

/// Persistent table wrapper shared by memories/entities/reflections. Hot
/// records are cached by id; the redb table is the source of truth.
struct Table<T> {
    db: Arc<Database>,
    definition: TableDefinition<'static, &'static str, &'static [u8]>,
    cache: Mutex<LruCache<String, T>>,
}

impl<T> Table<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone,
{
    fn open(db: Arc<Database>, definition: TableDefinition<'static, &'static str, &'static [u8]>) -> Result<Self, VectorMemoryError> {
        let write_txn = db.begin_write().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        {
            write_txn
                .open_table(definition)
                .map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        Ok(Self {
            db,
            definition,
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        })
    }

    fn put(&self, id: &str, value: &T) -> Result<(), VectorMemoryError> {
        let bytes = serde_json::to_vec(value).map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(self.definition)
                .map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        }
        write_txn.commit().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        self.cache.lock().expect("cache lock poisoned").put(id.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool, VectorMemoryError> {
        let write_txn = self.db.begin_write().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        let removed = {
            let mut table = write_txn
                .open_table(self.definition)
                .map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
            table.remove(id).map_err(|e| VectorMemoryError::Storage(e.to_string()))?.is_some()
        };
        write_txn.commit().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        self.cache.lock().expect("cache lock poisoned").pop(id);
        Ok(removed)
    }

    fn all(&self) -> Result<Vec<T>, VectorMemoryError> {
        let read_txn = self.db.begin_read().map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        let table = read_txn
            .open_table(self.definition)
            .map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| VectorMemoryError::Storage(e.to_string()))? {
            let (_, value) = entry.map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
            let decoded: T =
                serde_json::from_slice(value.value()).map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
            out.push(decoded);
        }
        Ok(out)
    }
}

pub struct VectorMemory {
    memories: Table<MemoryRecord>,
    entities: Table<EntityRecord>,
    reflections: Table<ReflectionRecord>,
    embedder: EmbeddingGateway,
    entity_name_cache: Mutex<HashMap<String, String>>,
}

impl VectorMemory {
    pub fn open(path: impl AsRef<Path>, embedder: EmbeddingGateway) -> Result<Self, VectorMemoryError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| VectorMemoryError::Storage(e.to_string()))?;
        }
        let db = Arc::new(Database::create(path.as_ref()).map_err(|e| VectorMemoryError::Storage(e.to_string()))?);
        let memories = Table::open(Arc::clone(&db), MEMORY_TABLE)?;
        let entities = Table::open(Arc::clone(&db), ENTITY_TABLE)?;
        let reflections = Table::open(db, REFLECTION_TABLE)?;
        let vm = Self {
            memories,
            entities,
            reflections,
            embedder,
            entity_name_cache: Mutex::new(HashMap::new()),
        };
        vm.rebuild_entity_cache()?;
        Ok(vm)
    }

    fn rebuild_entity_cache(&self) -> Result<(), VectorMemoryError> {
        let mut cache = self.entity_name_cache.lock().expect("entity cache lock poisoned");
        cache.clear();
        for entity in self.entities.all()? {
            cache.insert(entity.name.to_lowercase(), entity.id.clone());
            for alias in &entity.aliases {
                cache.insert(alias.to_lowercase(), entity.id.clone());
            }
        }
        Ok(())
    }

    pub fn invalidate_entity_cache(&self) -> Result<(), VectorMemoryError> {
        self.rebuild_entity_cache()
    }

    pub fn get_entity_names(&self) -> HashMap<String, String> {
        self.entity_name_cache.lock().expect("entity cache lock poisoned").clone()
    }

    pub async fn add_memory(
        &self,
        content: &str,
        memory_type: MemoryType,
        importance: i32,
        source: &str,
        related_entities: &str,
    ) -> Result<String, VectorMemoryError> {
        let embedding = self
            .embedder
            .embed(&[content.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();
        let id = short_id();
        let now = Utc::now();
        let record = MemoryRecord {
            id: id.clone(),
            content: content.to_string(),
            memory_type,
            importance: importance.clamp(1, 10) as u8,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            source: source.to_string(),
            related_entities: related_entities.to_string(),
            superseded_by: None,
            embedding,
        };
        self.memories.put(&id, &record)?;
        Ok(id)
    }

    pub async fn add_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        description: &str,
        importance: i32,
        aliases: &[String],
    ) -> Result<String, VectorMemoryError> {
        let id = short_id();
        let now = Utc::now();
        let record = EntityRecord {
            id: id.clone(),
            name: name.to_string(),
            aliases: aliases.to_vec(),
            entity_type,
            description: description.to_string(),
            importance: importance.clamp(1, 10) as u8,
            first_seen: now,
            last_seen: now,
            interaction_count: 1,
        };
        self.entities.put(&id, &record)?;
        self.invalidate_entity_cache()?;
        Ok(id)
    }

    /// Upsert by case-insensitive name/alias match (§4.4).
    pub async fn upsert_entity(
        &self,
        name: &str,
        entity_type: EntityType,
        description: &str,
        importance: i32,
        aliases: &[String],
    ) -> Result<String, VectorMemoryError> {
        let lname = name.to_lowercase();
        let existing_id = self.entity_name_cache.lock().expect("entity cache lock poisoned").get(&lname).cloned();

        if let Some(id) = existing_id {
            let mut all = self.entities.all()?;
            if let Some(entity) = all.iter_mut().find(|e| e.id == id) {
                if !description.is_empty() {
                    entity.description = description.to_string();
                }
                entity.importance = entity.importance.max(importance.clamp(1, 10) as u8);
                entity.interaction_count += 1;
                entity.last_seen = Utc::now();
                for alias in aliases {
                    if !entity.aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
                        entity.aliases.push(alias.clone());
                    }
                }
                let updated = entity.clone();
                self.entities.put(&id, &updated)?;
                self.invalidate_entity_cache()?;
                return Ok(id);
            }
        }
        self.add_entity(name, entity_type, description, importance, aliases).await
    }

    pub fn mark_superseded(&self, old_id: &str, reason_or_new_id: &str) -> Result<(), VectorMemoryError> {
        let mut all = self.memories.all()?;
        if let Some(record) = all.iter_mut().find(|m| m.id == old_id) {
            record.superseded_by = Some(reason_or_new_id.to_string());
            let updated = record.clone();
            self.memories.put(old_id, &updated)?;
        }
        Ok(())
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool, VectorMemoryError> {
        self.memories.remove(id)
    }

    pub async fn search(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        min_importance: u8,
        limit: usize,
        overfetch_factor: usize,
    ) -> Result<Vec<MemoryResult>, VectorMemoryError> {
        let query_embedding = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut v) => v.pop().unwrap_or_default(),
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed during search, returning empty results");
                return Ok(Vec::new());
            }
        };

        let candidate_cap = limit.saturating_mul(overfetch_factor).max(limit);
        let all = self.memories.all()?;

        let mut scored: Vec<(f32, MemoryRecord)> = all
            .into_iter()
            .filter(|m| m.superseded_by.is_none())
            .filter(|m| memory_type.map(|t| t.as_str() == m.memory_type.as_str()).unwrap_or(true))
            .filter(|m| m.importance >= min_importance)
            .map(|m| {
                let similarity = cosine_similarity(&query_embedding, &m.embedding);
                (similarity, m)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(candidate_cap);

        let mut ranked: Vec<MemoryResult> = scored
            .into_iter()
            .map(|(similarity, record)| {
                let st = strength(record.importance, record.access_count, record.last_accessed_at, 0.1);
                let final_score = score(similarity, record.importance, st);
                MemoryResult { record, score: final_score }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.importance.cmp(&a.record.importance))
                .then_with(|| b.record.last_accessed_at.cmp(&a.record.last_accessed_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        ranked.truncate(limit);

        for result in &ranked {
            self.update_access(&result.record.id)?;
        }

        Ok(ranked)
    }

    fn update_access(&self, id: &str) -> Result<(), VectorMemoryError> {
        let mut all = self.memories.all()?;
        if let Some(record) = all.iter_mut().find(|m| m.id == id) {
            record.access_count += 1;
            record.last_accessed_at = Utc::now();
            let updated = record.clone();
            self.memories.put(id, &updated)?;
        }
        Ok(())
    }

    pub fn search_entities(&self, query: &str, limit: usize) -> Result<Vec<EntityRecord>, VectorMemoryError> {
        let lq = query.to_lowercase();
        let mut matches: Vec<EntityRecord> = self
            .entities
            .all()?
            .into_iter()
            .filter(|e| e.name.to_lowercase().contains(&lq) || e.aliases.iter().any(|a| a.to_lowercase().contains(&lq)))
            .collect();
        matches.sort_by(|a, b| b.importance.cmp(&a.importance));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>, VectorMemoryError> {
        Ok(self.entities.all()?.into_iter().find(|e| e.id == id))
    }

    pub fn add_reflection(
        &self,
        content: &str,
        importance: i32,
        source_ids: Vec<String>,
        topic: &str,
    ) -> Result<String, VectorMemoryError> {
        let id = short_id();
        let record = ReflectionRecord {
            id: id.clone(),
            content: content.to_string(),
            importance: importance.clamp(1, 10) as u8,
            topic: topic.to_string(),
            created_at: Utc::now(),
            source_ids,
        };
        self.reflections.put(&id, &record)?;
        Ok(id)
    }

    pub fn get_pruning_candidates(
        &self,
        decay_rate: f32,
        prune_threshold: f32,
        max_importance: u8,
        limit: usize,
    ) -> Result<Vec<PruneCandidate>, VectorMemoryError> {
        let mut candidates: Vec<PruneCandidate> = self
            .memories
            .all()?
            .into_iter()
            .filter(|m| m.superseded_by.is_none() && m.importance <= max_importance)
            .filter_map(|m| {
                let st = strength(m.importance, m.access_count, m.last_accessed_at, decay_rate);
                (st < prune_threshold).then_some(PruneCandidate {
                    id: m.id,
                    content: m.content,
                    strength: st,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.strength.partial_cmp(&b.strength).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(limit);
        Ok(candidates)
    }

    pub fn timestamp_now() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_embeddings::EmbeddingGateway;

    fn gateway() -> EmbeddingGateway {
        EmbeddingGateway::new(None)
    }

    fn open_tmp() -> (VectorMemory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let vm = VectorMemory::open(dir.path().join("vector.redb"), gateway()).unwrap();
        (vm, dir)
    }

    #[tokio::test]
    async fn s3_supersede_hides_from_search() {
        let (vm, _dir) = open_tmp();
        let m1 = vm.add_memory("CCC lives in Tokyo", MemoryType::Fact, 7, "test", "").await.unwrap();
        let m2 = vm.add_memory("CCC moved to Osaka", MemoryType::Fact, 7, "test", "").await.unwrap();
        vm.mark_superseded(&m1, &m2).unwrap();
        let results = vm.search("Where does CCC live?", None, 0, 10, 2).await.unwrap();
        assert!(!results.iter().any(|r| r.record.id == m1));
    }

    #[tokio::test]
    async fn search_results_are_sorted_by_score_desc() {
        let (vm, _dir) = open_tmp();
        vm.add_memory("alpha", MemoryType::Fact, 9, "t", "").await.unwrap();
        vm.add_memory("beta", MemoryType::Fact, 1, "t", "").await.unwrap();
        let results = vm.search("alpha beta", None, 0, 10, 2).await.unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn upsert_entity_idempotent_on_identical_fields_except_counters() {
        let (vm, _dir) = open_tmp();
        let id1 = vm
            .upsert_entity("CCC", EntityType::Person, "an artist", 5, &[])
            .await
            .unwrap();
        let id2 = vm
            .upsert_entity("CCC", EntityType::Person, "an artist", 5, &[])
            .await
            .unwrap();
        assert_eq!(id1, id2);
        let entity = vm.get_entity(&id1).unwrap().unwrap();
        assert_eq!(entity.interaction_count, 2);
    }

    #[tokio::test]
    async fn entity_lookup_is_case_insensitive() {
        let (vm, _dir) = open_tmp();
        vm.add_entity("CCC", EntityType::Person, "an artist", 5, &[]).await.unwrap();
        let names = vm.get_entity_names();
        assert!(names.contains_key("ccc"));
    }

    #[tokio::test]
    async fn delete_memory_reports_removal() {
        let (vm, _dir) = open_tmp();
        let id = vm.add_memory("note", MemoryType::Fact, 5, "t", "").await.unwrap();
        assert!(vm.delete_memory(&id).unwrap());
        assert!(!vm.delete_memory(&id).unwrap());
    }

    #[tokio::test]
    async fn pruning_candidates_exclude_high_importance() {
        let (vm, _dir) = open_tmp();
        vm.add_memory("trivial note", MemoryType::Fact, 1, "t", "").await.unwrap();
        vm.add_memory("critical fact", MemoryType::Fact, 10, "t", "").await.unwrap();
        let candidates = vm.get_pruning_candidates(5.0, 1.1, 4, 20).unwrap();
        assert!(candidates.iter().all(|c| c.content != "critical fact"));
    }
}
