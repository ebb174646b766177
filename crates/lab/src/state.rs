//! Snapshots, runs, and explicit data-path construction for isolated lab
//! instances (§4.9, §4.9a).
//!
//! Unlike the source this is grounded on, there is no process-wide "current
//! lab root" or "current data path" global to rebind. Every function here
//! takes the paths it needs as an argument, and `DataPaths` is built once
//! per run and threaded through the harness and everything it constructs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabStateError {
    #[error("snapshot '{0}' already exists")]
    SnapshotExists(String),
    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),
    #[error("run '{0}' already exists")]
    RunExists(String),
    #[error("run '{0}' not found")]
    RunNotFound(String),
    #[error("source workspace not found: {0}")]
    SourceWorkspaceNotFound(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// All paths for one isolated lab instance. Built once by [`create_run`]
/// and passed by reference into every constructor that would otherwise
/// have read a global (`MemorySystem::initialize`, the classifier's
/// provider wiring, the harness's session bookkeeping).
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub workspace: PathBuf,
    pub sessions: PathBuf,
    pub data_dir: PathBuf,
    pub vector_index_path: PathBuf,
    pub audit_dir: PathBuf,
}

impl DataPaths {
    fn under(run_dir: PathBuf) -> Self {
        let workspace = run_dir.join("workspace");
        Self {
            vector_index_path: workspace.join("vector.redb"),
            sessions: run_dir.join("sessions"),
            audit_dir: run_dir.join("audit"),
            workspace,
            data_dir: run_dir,
        }
    }
}

/// Where to copy a new snapshot's contents from.
pub enum SnapshotSource<'a> {
    /// An explicit workspace/sessions pair — the caller's live state, or
    /// any other `DataPaths` they already have in hand.
    Paths { workspace: &'a Path, sessions: &'a Path },
    /// An existing run under the same lab root, by name.
    Run(&'a str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub file_count: u64,
    pub total_size_mb: f64,
    pub core_memory: bool,
    pub diary_entries: u64,
    pub session_files: u64,
}

fn snapshots_dir(lab_root: &Path) -> PathBuf {
    lab_root.join("_snapshots")
}

fn runs_dir(lab_root: &Path) -> PathBuf {
    lab_root.join("runs")
}

pub fn cache_dir(lab_root: &Path) -> PathBuf {
    lab_root.join("cache").join("llm_responses")
}

pub async fn create_snapshot(lab_root: &Path, name: &str, source: SnapshotSource<'_>) -> Result<PathBuf, LabStateError> {
    let snap_dir = snapshots_dir(lab_root).join(name);
    if snap_dir.try_exists()? {
        return Err(LabStateError::SnapshotExists(name.to_string()));
    }

    let (src_workspace, src_sessions, source_label) = match source {
        SnapshotSource::Paths { workspace, sessions } => (workspace.to_path_buf(), sessions.to_path_buf(), "paths".to_string()),
        SnapshotSource::Run(run_name) => {
            let run_dir = runs_dir(lab_root).join(run_name);
            if !run_dir.try_exists()? {
                return Err(LabStateError::RunNotFound(run_name.to_string()));
            }
            (run_dir.join("workspace"), run_dir.join("sessions"), format!("run:{run_name}"))
        }
    };

    if !src_workspace.try_exists()? {
        return Err(LabStateError::SourceWorkspaceNotFound(src_workspace));
    }

    tokio::fs::create_dir_all(&snap_dir).await?;
    let dst_workspace = snap_dir.join("workspace");
    copy_dir_recursive(&src_workspace, &dst_workspace).await?;

    let dst_sessions = snap_dir.join("sessions");
    if src_sessions.try_exists()? {
        copy_dir_recursive(&src_sessions, &dst_sessions).await?;
    } else {
        tokio::fs::create_dir_all(&dst_sessions).await?;
    }

    let manifest = build_manifest(name, &source_label, &dst_workspace, &dst_sessions).await?;
    let rendered = serde_json::to_string_pretty(&manifest).expect("SnapshotManifest always serializes");
    tokio::fs::write(snap_dir.join("manifest.json"), rendered).await?;

    tracing::info!(snapshot = %name, source = %source_label, files = manifest.file_count, "snapshot created");
    Ok(snap_dir)
}

pub async fn list_snapshots(lab_root: &Path) -> std::io::Result<Vec<SnapshotManifest>> {
    let root = snapshots_dir(lab_root);
    if !root.try_exists()? {
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    let mut entries = tokio::fs::read_dir(&root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let manifest_path = entry.path().join("manifest.json");
        if let Ok(raw) = tokio::fs::read_to_string(&manifest_path).await {
            if let Ok(manifest) = serde_json::from_str(&raw) {
                results.push(manifest);
            }
        }
    }
    results.sort_by(|a: &SnapshotManifest, b: &SnapshotManifest| a.name.cmp(&b.name));
    Ok(results)
}

pub async fn delete_snapshot(lab_root: &Path, name: &str) -> Result<(), LabStateError> {
    let snap_dir = snapshots_dir(lab_root).join(name);
    if !snap_dir.try_exists()? {
        return Err(LabStateError::SnapshotNotFound(name.to_string()));
    }
    tokio::fs::remove_dir_all(&snap_dir).await?;
    tracing::info!(snapshot = %name, "snapshot deleted");
    Ok(())
}

pub async fn create_run(lab_root: &Path, run_name: &str, snapshot_name: Option<&str>) -> Result<DataPaths, LabStateError> {
    let run_dir = runs_dir(lab_root).join(run_name);
    if run_dir.try_exists()? {
        return Err(LabStateError::RunExists(run_name.to_string()));
    }
    tokio::fs::create_dir_all(&run_dir).await?;
    let paths = DataPaths::under(run_dir);

    if let Some(snapshot_name) = snapshot_name {
        let snap_dir = snapshots_dir(lab_root).join(snapshot_name);
        if !snap_dir.try_exists()? {
            return Err(LabStateError::SnapshotNotFound(snapshot_name.to_string()));
        }
        let snap_workspace = snap_dir.join("workspace");
        let snap_sessions = snap_dir.join("sessions");
        if snap_workspace.try_exists()? {
            copy_dir_recursive(&snap_workspace, &paths.workspace).await?;
        }
        if snap_sessions.try_exists()? {
            copy_dir_recursive(&snap_sessions, &paths.sessions).await?;
        }
        tracing::info!(run = %run_name, snapshot = %snapshot_name, "run created from snapshot");
    } else {
        tokio::fs::create_dir_all(&paths.workspace).await?;
        tokio::fs::create_dir_all(&paths.sessions).await?;
        tokio::fs::create_dir_all(paths.workspace.join("memory").join("diary")).await?;
        tracing::info!(run = %run_name, "run created (fresh)");
    }

    tokio::fs::create_dir_all(&paths.audit_dir).await?;
    Ok(paths)
}

pub async fn list_runs(lab_root: &Path) -> std::io::Result<Vec<String>> {
    let root = runs_dir(lab_root);
    if !root.try_exists()? {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

pub async fn delete_run(lab_root: &Path, run_name: &str) -> Result<(), LabStateError> {
    let run_dir = runs_dir(lab_root).join(run_name);
    if !run_dir.try_exists()? {
        return Err(LabStateError::RunNotFound(run_name.to_string()));
    }
    tokio::fs::remove_dir_all(&run_dir).await?;
    tracing::info!(run = %run_name, "run deleted");
    Ok(())
}

/// Creates `count` isolated copies of an existing run, named
/// `{source_run}_fork_{i}`, for parallel testing from the same state.
pub async fn fork_run(lab_root: &Path, source_run: &str, count: u32) -> Result<Vec<DataPaths>, LabStateError> {
    let source_dir = runs_dir(lab_root).join(source_run);
    if !source_dir.try_exists()? {
        return Err(LabStateError::RunNotFound(source_run.to_string()));
    }

    let mut results = Vec::new();
    for i in 0..count {
        let fork_name = format!("{source_run}_fork_{i}");
        let fork_dir = runs_dir(lab_root).join(&fork_name);
        if fork_dir.try_exists()? {
            tokio::fs::remove_dir_all(&fork_dir).await?;
        }
        copy_dir_recursive(&source_dir, &fork_dir).await?;
        let paths = DataPaths::under(fork_dir);
        tokio::fs::create_dir_all(&paths.audit_dir).await?;
        results.push(paths);
    }

    tracing::info!(source = %source_run, count, "run forked");
    Ok(results)
}

/// Writes identity files into a workspace, for fresh runs or to override
/// identity for a scenario under test. Only writes files that are given.
pub async fn seed_identity_files(
    workspace: &Path,
    agent_profile: Option<&str>,
    owner_profile: Option<&str>,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workspace).await?;
    if let Some(agent_profile) = agent_profile {
        tokio::fs::write(workspace.join("AGENT.md"), agent_profile).await?;
    }
    if let Some(owner_profile) = owner_profile {
        tokio::fs::write(workspace.join("OWNER.md"), owner_profile).await?;
    }
    Ok(())
}

pub async fn get_cache_dir(lab_root: &Path) -> std::io::Result<PathBuf> {
    let dir = cache_dir(lab_root);
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

async fn build_manifest(name: &str, source: &str, workspace: &Path, sessions: &Path) -> std::io::Result<SnapshotManifest> {
    let (mut file_count, mut total_size) = (0u64, 0u64);
    count_dir(workspace, &mut file_count, &mut total_size).await?;
    if sessions.try_exists()? {
        count_dir(sessions, &mut file_count, &mut total_size).await?;
    }

    let core_memory = workspace.join("memory").join("core.json").try_exists()?;
    let diary_entries = count_glob(&workspace.join("memory").join("diary"), "md").await?;
    let session_files = count_glob(sessions, "jsonl").await?;

    Ok(SnapshotManifest {
        name: name.to_string(),
        created_at: Utc::now(),
        source: source.to_string(),
        file_count,
        total_size_mb: (total_size as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0,
        core_memory,
        diary_entries,
        session_files,
    })
}

async fn count_dir(dir: &Path, file_count: &mut u64, total_size: &mut u64) -> std::io::Result<()> {
    if !dir.try_exists()? {
        return Ok(());
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                *file_count += 1;
                *total_size += entry.metadata().await?.len();
            }
        }
    }
    Ok(())
}

async fn count_glob(dir: &Path, extension: &str) -> std::io::Result<u64> {
    if !dir.try_exists()? {
        return Ok(0);
    }
    let mut count = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) == Some(extension) {
            count += 1;
        }
    }
    Ok(count)
}

async fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            Box::pin(copy_dir_recursive(&entry.path(), &dst_path)).await?;
        } else if file_type.is_file() {
            tokio::fs::copy(entry.path(), &dst_path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_run_then_fork_produces_isolated_copies() {
        let lab_root = tempfile::tempdir().unwrap();
        let paths = create_run(lab_root.path(), "base", None).await.unwrap();
        tokio::fs::write(paths.workspace.join("marker.txt"), "hello").await.unwrap();

        let forks = fork_run(lab_root.path(), "base", 2).await.unwrap();
        assert_eq!(forks.len(), 2);
        for fork in &forks {
            let content = tokio::fs::read_to_string(fork.workspace.join("marker.txt")).await.unwrap();
            assert_eq!(content, "hello");
        }
    }

    #[tokio::test]
    async fn snapshot_round_trips_into_a_new_run() {
        let lab_root = tempfile::tempdir().unwrap();
        let live_workspace = tempfile::tempdir().unwrap();
        let live_sessions = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(live_workspace.path().join("memory")).await.unwrap();
        tokio::fs::write(live_workspace.path().join("memory").join("core.json"), "{}").await.unwrap();

        create_snapshot(
            lab_root.path(),
            "snap_a",
            SnapshotSource::Paths { workspace: live_workspace.path(), sessions: live_sessions.path() },
        )
        .await
        .unwrap();

        let manifests = list_snapshots(lab_root.path()).await.unwrap();
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].core_memory);

        let paths = create_run(lab_root.path(), "from_snap", Some("snap_a")).await.unwrap();
        assert!(paths.workspace.join("memory").join("core.json").try_exists().unwrap());
    }

    #[tokio::test]
    async fn creating_an_existing_run_is_rejected() {
        let lab_root = tempfile::tempdir().unwrap();
        create_run(lab_root.path(), "dup", None).await.unwrap();
        let err = create_run(lab_root.path(), "dup", None).await.unwrap_err();
        assert!(matches!(err, LabStateError::RunExists(_)));
    }
}
