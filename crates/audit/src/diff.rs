use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::collector::AuditCollector;

#[derive(Debug, Clone, Serialize)]
pub struct CountDelta {
    pub a: u32,
    pub b: u32,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationChange {
    pub index: usize,
    pub channel_key: String,
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseDiff {
    pub index: usize,
    pub channel_key: String,
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffSummary {
    pub events_a: usize,
    pub events_b: usize,
    pub event_delta: i64,
    pub classification_changes_count: usize,
    pub response_changes_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub event_count_diff: BTreeMap<String, CountDelta>,
    pub classification_changes: Vec<ClassificationChange>,
    pub response_diffs: Vec<ResponseDiff>,
    pub summary: DiffSummary,
}

pub struct AuditDiff;

impl AuditDiff {
    pub async fn compare(audit_a: &Path, audit_b: &Path) -> std::io::Result<DiffResult> {
        let events_a = AuditCollector::load(audit_a).await?;
        let events_b = AuditCollector::load(audit_b).await?;

        let event_count_diff = count_diff(&events_a, &events_b);
        let classification_changes = classification_diff(&events_a, &events_b);
        let response_diffs = response_diff(&events_a, &events_b);

        let summary = DiffSummary {
            events_a: events_a.len(),
            events_b: events_b.len(),
            event_delta: events_b.len() as i64 - events_a.len() as i64,
            classification_changes_count: classification_changes.len(),
            response_changes_count: response_diffs.len(),
        };

        Ok(DiffResult { event_count_diff, classification_changes, response_diffs, summary })
    }
}

fn event_type_of(event: &Value) -> &str {
    event.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

fn count_diff(events_a: &[Value], events_b: &[Value]) -> BTreeMap<String, CountDelta> {
    let mut counts_a: BTreeMap<&str, u32> = BTreeMap::new();
    let mut counts_b: BTreeMap<&str, u32> = BTreeMap::new();
    for e in events_a {
        *counts_a.entry(event_type_of(e)).or_default() += 1;
    }
    for e in events_b {
        *counts_b.entry(event_type_of(e)).or_default() += 1;
    }

    let all_types: BTreeSet<&str> = counts_a.keys().chain(counts_b.keys()).copied().collect();
    let mut diff = BTreeMap::new();
    for t in all_types {
        let a = counts_a.get(t).copied().unwrap_or(0);
        let b = counts_b.get(t).copied().unwrap_or(0);
        if a != b {
            diff.insert(t.to_string(), CountDelta { a, b, delta: b as i64 - a as i64 });
        }
    }
    diff
}

fn classification_diff(events_a: &[Value], events_b: &[Value]) -> Vec<ClassificationChange> {
    let cls_a: Vec<&Value> = events_a.iter().filter(|e| event_type_of(e) == "classification").collect();
    let cls_b: Vec<&Value> = events_b.iter().filter(|e| event_type_of(e) == "classification").collect();

    cls_a
        .iter()
        .zip(cls_b.iter())
        .enumerate()
        .filter_map(|(index, (a, b))| {
            let class_a = a.get("classification").and_then(Value::as_str).unwrap_or("unknown");
            let class_b = b.get("classification").and_then(Value::as_str).unwrap_or("unknown");
            (class_a != class_b).then(|| ClassificationChange {
                index,
                channel_key: a.get("channel_key").and_then(Value::as_str).unwrap_or("").to_string(),
                a: class_a.to_string(),
                b: class_b.to_string(),
            })
        })
        .collect()
}

fn response_diff(events_a: &[Value], events_b: &[Value]) -> Vec<ResponseDiff> {
    let resp_a: Vec<&Value> = events_a.iter().filter(|e| event_type_of(e) == "response_sent").collect();
    let resp_b: Vec<&Value> = events_b.iter().filter(|e| event_type_of(e) == "response_sent").collect();

    resp_a
        .iter()
        .zip(resp_b.iter())
        .enumerate()
        .filter_map(|(index, (a, b))| {
            let content_a = response_content(a);
            let content_b = response_content(b);
            (content_a != content_b).then(|| ResponseDiff {
                index,
                channel_key: a.get("channel_key").and_then(Value::as_str).unwrap_or("").to_string(),
                a: truncate(&content_a, 200),
                b: truncate(&content_b, 200),
            })
        })
        .collect()
}

fn response_content(event: &Value) -> String {
    event
        .get("content")
        .or_else(|| event.get("content_preview"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::AuditCollector;
    use serde_json::{json, Map};

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn compare_detects_classification_and_response_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.jsonl");
        let path_b = dir.path().join("b.jsonl");

        let a = AuditCollector::new();
        a.record_event("classification", "chan", obj(json!({"classification": "respond"})));
        a.record_event("response_sent", "chan", obj(json!({"content": "hello there"})));
        a.save(&path_a).await.unwrap();

        let b = AuditCollector::new();
        b.record_event("classification", "chan", obj(json!({"classification": "drop"})));
        b.record_event("response_sent", "chan", obj(json!({"content": "hi"})));
        b.record_event("error", "chan", obj(json!({"message": "boom"})));
        b.save(&path_b).await.unwrap();

        let diff = AuditDiff::compare(&path_a, &path_b).await.unwrap();
        assert_eq!(diff.classification_changes.len(), 1);
        assert_eq!(diff.classification_changes[0].a, "respond");
        assert_eq!(diff.classification_changes[0].b, "drop");
        assert_eq!(diff.response_diffs.len(), 1);
        assert_eq!(diff.summary.event_delta, 1);
        assert!(diff.event_count_diff.contains_key("error"));
    }
}
