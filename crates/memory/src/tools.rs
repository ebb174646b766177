//! Memory tools: plain async functions over a `MemorySystem`, not a
//! dynamic dispatch registry (§4.11). Each returns the reply string an
//! agent would surface to a caller.

use crate::facade::MemorySystem;
use crate::vector_memory::{EntityType, MemoryType};

/// Writes a fact (or diary/reflection entry) to Vector Memory. Returns a
/// short confirmation string, or an error message if Vector Memory is
/// unavailable.
pub async fn save_memory(
    system: &MemorySystem,
    content: &str,
    memory_type: MemoryType,
    importance: i32,
    related_entities: &str,
) -> String {
    let Some(vector) = &system.vector else {
        return "Memory not saved: vector memory is unavailable.".to_string();
    };

    match vector
        .add_memory(content, memory_type, importance, "tool", related_entities)
        .await
    {
        Ok(id) => format!("Saved memory [id:{id}]."),
        Err(err) => format!("Failed to save memory: {err}"),
    }
}

/// Upserts an entity by case-insensitive name/alias match.
pub async fn save_entity(
    system: &MemorySystem,
    name: &str,
    entity_type: EntityType,
    description: &str,
    importance: i32,
    aliases: &[String],
) -> String {
    let Some(vector) = &system.vector else {
        return "Entity not saved: vector memory is unavailable.".to_string();
    };

    match vector.upsert_entity(name, entity_type, description, importance, aliases).await {
        Ok(id) => format!("Saved entity '{name}' [id:{id}]."),
        Err(err) => format!("Failed to save entity: {err}"),
    }
}

/// Edits an existing memory's content and/or importance. A memory that
/// isn't found is reported, not silently ignored.
pub async fn edit_memory(
    system: &MemorySystem,
    id: &str,
    new_content: Option<&str>,
    new_importance: Option<i32>,
) -> String {
    let Some(vector) = &system.vector else {
        return "Memory not edited: vector memory is unavailable.".to_string();
    };

    let Ok(Some(existing)) = vector.get_entity(id) else {
        // Not an entity id; fall through to the memory path below.
        return edit_plain_memory(vector, id, new_content, new_importance).await;
    };
    format!("'{id}' is an entity ('{}'), not a memory; use save_entity to edit it.", existing.name)
}

async fn edit_plain_memory(
    vector: &crate::vector_memory::VectorMemory,
    id: &str,
    new_content: Option<&str>,
    new_importance: Option<i32>,
) -> String {
    // Vector Memory has no in-place content edit (entries are immutable
    // once embedded); an edit is a supersede: add the new content, mark
    // the old id superseded by the new one.
    let Some(content) = new_content else {
        return "Nothing to edit: no new content provided.".to_string();
    };

    match vector
        .add_memory(content, MemoryType::Fact, new_importance.unwrap_or(5), "tool_edit", "")
        .await
    {
        Ok(new_id) => {
            if let Err(err) = vector.mark_superseded(id, &new_id) {
                return format!("Saved revised memory [id:{new_id}], but failed to mark '{id}' superseded: {err}");
            }
            format!("Memory '{id}' superseded by revised memory [id:{new_id}].")
        }
        Err(err) => format!("Failed to save revision: {err}"),
    }
}

/// Removes a memory. `archive` requests a soft-delete (supersede with a
/// tombstone marker) before falling back to a hard delete, matching the
/// archive-then-permanent-delete reply shape of the tool this is
/// grounded on.
pub async fn delete_memory(system: &MemorySystem, id: &str, archive: bool) -> String {
    let Some(vector) = &system.vector else {
        return "Memory not deleted: vector memory is unavailable.".to_string();
    };

    if archive {
        match vector.mark_superseded(id, "archived") {
            Ok(()) => return format!("Memory '{id}' archived."),
            Err(err) => return format!("Failed to archive memory '{id}': {err}"),
        }
    }

    match vector.delete_memory(id) {
        Ok(true) => format!("Memory '{id}' permanently deleted."),
        Ok(false) => format!("No memory found with id '{id}'."),
        Err(err) => format!("Failed to delete memory '{id}': {err}"),
    }
}

/// Searches Vector Memory and renders the result list plus an optional
/// "Related entities" block, matching `SearchMemoryTool`'s reply shape.
/// The entities block is only included when no `memory_type` filter was
/// given, since a type-filtered search is presumed to be about a single
/// kind of record.
pub async fn search_memory(
    system: &MemorySystem,
    query: &str,
    memory_type: Option<MemoryType>,
    limit: usize,
) -> String {
    let Some(vector) = &system.vector else {
        return "Search unavailable: vector memory is unavailable.".to_string();
    };

    let results = match vector.search(query, memory_type, 0, limit, 2).await {
        Ok(results) => results,
        Err(err) => return format!("Search failed: {err}"),
    };

    if results.is_empty() {
        return "Found 0 memories.".to_string();
    }

    let mut lines = vec![format!("Found {} memories:", results.len())];
    for (i, result) in results.iter().enumerate() {
        let pct = (result.score * 100.0).round() as i32;
        lines.push(format!(
            "{}. [{}] (score:{pct}%, importance:{}) {}",
            i + 1,
            result.record.memory_type.as_str(),
            result.record.importance,
            result.record.content
        ));
    }

    if memory_type.is_none() {
        let entities = vector.search_entities(query, 5).unwrap_or_default();
        if !entities.is_empty() {
            lines.push("Related entities:".to_string());
            for entity in entities {
                lines.push(format!("- {} ({:?})", entity.name, entity.entity_type));
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_config::MemoryConfig;
    use halcyon_embeddings::EmbeddingGateway;

    async fn system() -> (MemorySystem, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let system = MemorySystem::initialize(dir.path(), MemoryConfig::default(), EmbeddingGateway::new(None)).await;
        (system, dir)
    }

    #[tokio::test]
    async fn save_then_search_finds_it() {
        let (system, _dir) = system().await;
        let reply = save_memory(&system, "CCC likes ramen", MemoryType::Fact, 6, "").await;
        assert!(reply.starts_with("Saved memory"));
        let found = search_memory(&system, "ramen", None, 5).await;
        assert!(found.contains("Found 1 memories:"));
        assert!(found.contains("CCC likes ramen"));
    }

    #[tokio::test]
    async fn edit_supersedes_old_entry() {
        let (system, _dir) = system().await;
        let reply = save_memory(&system, "CCC lives in Tokyo", MemoryType::Fact, 6, "").await;
        let id = reply
            .strip_prefix("Saved memory [id:")
            .and_then(|s| s.strip_suffix("].").or(Some(s)))
            .unwrap()
            .trim_end_matches(']')
            .to_string();
        let edit_reply = edit_memory(&system, &id, Some("CCC lives in Osaka"), None).await;
        assert!(edit_reply.contains("superseded by"));
        let found = search_memory(&system, "Where does CCC live", None, 5).await;
        assert!(found.contains("Osaka"));
        assert!(!found.contains("Tokyo"));
    }

    #[tokio::test]
    async fn delete_reports_missing_id() {
        let (system, _dir) = system().await;
        let reply = delete_memory(&system, "nonexistent", false).await;
        assert!(reply.contains("No memory found"));
    }

    #[tokio::test]
    async fn search_includes_entities_unless_type_filtered() {
        let (system, _dir) = system().await;
        save_entity(&system, "CCC", EntityType::Person, "an artist", 6, &[]).await;
        save_memory(&system, "CCC finished a painting", MemoryType::Fact, 6, "CCC").await;
        let unfiltered = search_memory(&system, "CCC", None, 5).await;
        assert!(unfiltered.contains("Related entities:"));
        let filtered = search_memory(&system, "CCC", Some(MemoryType::Fact), 5).await;
        assert!(!filtered.contains("Related entities:"));
    }
}
