use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::events::AuditEvent;

/// Collects every event emitted during a lab run (or a live session, if
/// wired in) for later replay and comparison. There is no tracer to
/// monkey-patch here — callers record directly through this collector
/// instead of through a wrapped `emit()`.
#[derive(Default)]
pub struct AuditCollector {
    events: Mutex<Vec<AuditEvent>>,
    prompts: Mutex<Vec<AuditEvent>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total_events: usize,
    pub total_prompts: usize,
    pub event_types: HashMap<String, u32>,
    pub classifications: HashMap<String, u32>,
    pub errors: usize,
    pub responses: usize,
}

impl AuditCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, event_type: impl Into<String>, channel_key: impl Into<String>, data: Map<String, Value>) {
        self.events.lock().expect("audit events lock poisoned").push(AuditEvent::new(event_type, channel_key, data));
    }

    pub fn record_prompt(&self, prompt_type: impl Into<String>, channel_key: impl Into<String>, data: Map<String, Value>) {
        self.prompts.lock().expect("audit prompts lock poisoned").push(AuditEvent::new(prompt_type, channel_key, data));
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut rendered = String::new();
        for event in self.events.lock().expect("audit events lock poisoned").iter() {
            rendered.push_str(&serde_json::to_string(event).expect("AuditEvent always serializes"));
            rendered.push('\n');
        }
        for prompt in self.prompts.lock().expect("audit prompts lock poisoned").iter() {
            rendered.push_str(&serde_json::to_string(prompt).expect("AuditEvent always serializes"));
            rendered.push('\n');
        }
        tokio::fs::write(path, rendered).await?;
        tracing::debug!(path = %path.display(), "audit trail saved");
        Ok(path.to_path_buf())
    }

    pub async fn load(path: &Path) -> std::io::Result<Vec<Value>> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(raw.lines().filter(|line| !line.trim().is_empty()).filter_map(|line| serde_json::from_str(line).ok()).collect())
    }

    pub fn get_events(&self, event_type: Option<&str>) -> Vec<AuditEvent> {
        let events = self.events.lock().expect("audit events lock poisoned");
        match event_type {
            Some(t) => events.iter().filter(|e| e.event_type == t).cloned().collect(),
            None => events.clone(),
        }
    }

    pub fn get_classifications(&self) -> Vec<AuditEvent> {
        self.get_events(Some("classification"))
    }

    pub fn get_prompts(&self) -> Vec<AuditEvent> {
        self.prompts.lock().expect("audit prompts lock poisoned").clone()
    }

    pub fn get_responses(&self) -> Vec<AuditEvent> {
        self.get_events(Some("response_sent"))
    }

    pub fn get_errors(&self) -> Vec<AuditEvent> {
        self.get_events(Some("error"))
    }

    pub fn summary(&self) -> AuditSummary {
        let events = self.events.lock().expect("audit events lock poisoned");
        let mut event_types: HashMap<String, u32> = HashMap::new();
        for event in events.iter() {
            *event_types.entry(event.event_type.clone()).or_default() += 1;
        }

        let mut classifications: HashMap<String, u32> = HashMap::new();
        for event in events.iter().filter(|e| e.event_type == "classification") {
            let label = event.field_str("classification").unwrap_or("unknown").to_string();
            *classifications.entry(label).or_default() += 1;
        }

        let errors = events.iter().filter(|e| e.event_type == "error").count();
        let responses = events.iter().filter(|e| e.event_type == "response_sent").count();

        AuditSummary {
            total_events: events.len(),
            total_prompts: self.prompts.lock().expect("audit prompts lock poisoned").len(),
            event_types,
            classifications,
            errors,
            responses,
        }
    }

    pub fn clear(&self) {
        self.events.lock().expect("audit events lock poisoned").clear();
        self.prompts.lock().expect("audit prompts lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_events_and_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");

        let collector = AuditCollector::new();
        collector.record_event("classification", "chan_1", obj(json!({"classification": "respond"})));
        collector.record_prompt("system_prompt", "chan_1", obj(json!({"text": "hi"})));
        collector.save(&path).await.unwrap();

        let loaded = AuditCollector::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["type"], "classification");
        assert_eq!(loaded[1]["type"], "system_prompt");
    }

    #[test]
    fn summary_counts_event_types_and_classifications() {
        let collector = AuditCollector::new();
        collector.record_event("classification", "a", obj(json!({"classification": "respond"})));
        collector.record_event("classification", "a", obj(json!({"classification": "drop"})));
        collector.record_event("error", "a", obj(json!({"message": "boom"})));

        let summary = collector.summary();
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.event_types["classification"], 2);
        assert_eq!(summary.classifications["respond"], 1);
        assert_eq!(summary.errors, 1);
    }

    #[test]
    fn clear_empties_both_buffers() {
        let collector = AuditCollector::new();
        collector.record_event("response_sent", "a", Map::new());
        collector.record_prompt("p", "a", Map::new());
        collector.clear();
        assert_eq!(collector.get_events(None).len(), 0);
        assert_eq!(collector.get_prompts().len(), 0);
    }
}
