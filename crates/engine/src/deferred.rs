//! Deferred moves.
//!
//! A move that runs out of retries is written to a JSON sidecar and replayed
//! at the start of the next run. Sidecars are the only state that survives
//! between runs; each one is locked while written and while claimed so two
//! overlapping runs never replay the same move.

use crate::fsops::{lock_exclusive, try_lock_exclusive, FileOps};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

const SIDECAR_SUFFIX: &str = ".move.json";

#[derive(Debug, Error)]
pub enum DeferredError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid deferred move {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Parameters of one postponed move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredMove {
    #[serde(rename = "LiteralPath")]
    pub source: PathBuf,
    #[serde(rename = "Destination")]
    pub destination: PathBuf,
    /// Rename to carry out once the move has gone through.
    #[serde(rename = "ThenRename", default, skip_serializing_if = "Option::is_none")]
    pub then_rename: Option<PendingRename>,
    /// Other move options; kept as written.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl DeferredMove {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            then_rename: None,
            options: serde_json::Map::new(),
        }
    }

    /// Queues `from -> to` behind the move, for an output that can only take
    /// its final name once the original has left it.
    pub fn with_rename(mut self, from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        self.then_rename = Some(PendingRename {
            from: from.into(),
            to: to.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRename {
    #[serde(rename = "LiteralPath")]
    pub from: PathBuf,
    #[serde(rename = "NewName")]
    pub to: PathBuf,
}

/// `<dir>/<source file name>.<path hash>.move.json`
///
/// The hash covers the full source path, so files sharing a name in
/// different folders get separate sidecars.
pub fn sidecar_path(dir: &Path, source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unnamed".into());
    name.push(".");
    name.push(path_hash(source));
    name.push(SIDECAR_SUFFIX);
    dir.join(name)
}

/// First 16 hex characters of the SHA-256 of the path.
fn path_hash(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Writes the sidecar for `mv` under an exclusive lock and returns its path.
pub fn persist(dir: &Path, mv: &DeferredMove) -> Result<PathBuf, DeferredError> {
    fs::create_dir_all(dir)?;
    let path = sidecar_path(dir, &mv.source);
    let json = serde_json::to_string_pretty(mv).map_err(|source| DeferredError::Json {
        path: path.clone(),
        source,
    })?;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    let mut locked = lock_exclusive(file)?;
    let file = locked.file();
    file.set_len(0)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(path)
}

/// Sidecar files in `dir`, sorted by name. A missing directory has none.
pub fn find_sidecars(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_sidecar = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX));
        if is_sidecar && path.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Takes ownership of a sidecar: lock, read, parse, delete.
///
/// Returns `None` when another run holds the lock. A sidecar that does not
/// parse is left in place.
pub fn claim(path: &Path) -> Result<Option<DeferredMove>, DeferredError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let Some(mut locked) = try_lock_exclusive(file)? else {
        return Ok(None);
    };

    let mut content = String::new();
    let file = locked.file();
    file.rewind()?;
    file.read_to_string(&mut content)?;
    let mv: DeferredMove =
        serde_json::from_str(&content).map_err(|source| DeferredError::Json {
            path: path.to_path_buf(),
            source,
        })?;

    fs::remove_file(path)?;
    Ok(Some(mv))
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub moved: usize,
    /// Queued output renames carried out after their move.
    pub renamed: usize,
    pub failed: usize,
    /// Locked by another run.
    pub busy: usize,
    pub unreadable: usize,
}

impl ReplaySummary {
    pub fn attempted(&self) -> usize {
        self.moved + self.failed
    }
}

/// Replays every sidecar in `dir` with exactly one move attempt each.
///
/// The sidecar is gone once claimed, whatever the move's outcome; a failed
/// replay is logged, not re-queued. A queued rename runs only after its move
/// succeeds.
pub async fn replay(dir: &Path, ops: &dyn FileOps) -> Result<ReplaySummary, DeferredError> {
    let mut summary = ReplaySummary::default();

    for sidecar in find_sidecars(dir)? {
        let mv = match claim(&sidecar) {
            Ok(Some(mv)) => mv,
            Ok(None) => {
                info!(sidecar = %sidecar.display(), "Deferred move is held by another run");
                summary.busy += 1;
                continue;
            }
            Err(e) => {
                warn!(sidecar = %sidecar.display(), "Skipping deferred move: {}", e);
                summary.unreadable += 1;
                continue;
            }
        };

        match ops.move_file(&mv.source, &mv.destination).await {
            Ok(()) => {
                info!(
                    from = %mv.source.display(),
                    to = %mv.destination.display(),
                    "Replayed deferred move"
                );
                summary.moved += 1;
                if let Some(pending) = &mv.then_rename {
                    if finish_rename(pending, ops).await {
                        summary.renamed += 1;
                    }
                }
            }
            Err(e) => {
                error!(
                    from = %mv.source.display(),
                    to = %mv.destination.display(),
                    "Deferred move failed again: {}",
                    e
                );
                if let Some(pending) = &mv.then_rename {
                    error!(
                        output = %pending.from.display(),
                        "Output stays under its working name"
                    );
                }
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn finish_rename(pending: &PendingRename, ops: &dyn FileOps) -> bool {
    if tokio::fs::try_exists(&pending.to).await.unwrap_or(true) {
        warn!(
            output = %pending.from.display(),
            target = %pending.to.display(),
            "Final name is taken, leaving output under its working name"
        );
        return false;
    }
    match ops.rename(&pending.from, &pending.to).await {
        Ok(()) => {
            info!(to = %pending.to.display(), "Renamed output into place");
            true
        }
        Err(e) => {
            error!(
                output = %pending.from.display(),
                target = %pending.to.display(),
                "Renaming output failed: {}",
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsops::LocalFileOps;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records move calls and fails them all.
    #[derive(Default)]
    struct RecordingOps {
        moves: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl FileOps for RecordingOps {
        async fn rename(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Ok(())
        }

        async fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.moves
                .lock()
                .unwrap()
                .push((from.to_path_buf(), to.to_path_buf()));
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "still in use"))
        }

        async fn remove(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sidecar_name_keeps_basename_and_separates_folders() {
        let first = sidecar_path(Path::new("/state"), Path::new("/lib/Show A/ep1.mkv"));
        let second = sidecar_path(Path::new("/state"), Path::new("/lib/Show B/ep1.mkv"));

        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("ep1.mkv."));
        assert!(name.ends_with(".move.json"));
        assert_eq!(name.len(), "ep1.mkv.".len() + 16 + ".move.json".len());
        assert_ne!(first, second);
        assert_eq!(first, sidecar_path(Path::new("/state"), Path::new("/lib/Show A/ep1.mkv")));
    }

    #[tokio::test]
    async fn test_same_name_in_two_folders_keeps_both_moves() {
        let dir = TempDir::new().unwrap();
        persist(dir.path(), &DeferredMove::new("/lib/Show A/ep1.mkv", "/done/Show A/ep1.mkv")).unwrap();
        persist(dir.path(), &DeferredMove::new("/lib/Show B/ep1.mkv", "/done/Show B/ep1.mkv")).unwrap();
        assert_eq!(find_sidecars(dir.path()).unwrap().len(), 2);

        let ops = RecordingOps::default();
        let summary = replay(dir.path(), &ops).await.unwrap();
        assert_eq!(summary.attempted(), 2);
    }

    #[test]
    fn test_persisted_json_uses_wire_names() {
        let dir = TempDir::new().unwrap();
        let path = persist(dir.path(), &DeferredMove::new("/lib/a.mkv", "/done/a.mkv")).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["LiteralPath"], "/lib/a.mkv");
        assert_eq!(value["Destination"], "/done/a.mkv");
    }

    #[test]
    fn test_extra_options_are_optional_and_preserved() {
        let minimal: DeferredMove =
            serde_json::from_str(r#"{"LiteralPath":"/a","Destination":"/b"}"#).unwrap();
        assert!(minimal.options.is_empty());

        let extended: DeferredMove =
            serde_json::from_str(r#"{"LiteralPath":"/a","Destination":"/b","Force":true}"#).unwrap();
        assert_eq!(extended.options.get("Force"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn test_persist_overwrites_longer_content() {
        let dir = TempDir::new().unwrap();
        let mut long = DeferredMove::new("/lib/a.mkv", "/a/very/long/destination/path/a.mkv");
        long.options
            .insert("Comment".to_string(), serde_json::Value::String("x".repeat(200)));
        persist(dir.path(), &long).unwrap();
        let path = persist(dir.path(), &DeferredMove::new("/lib/a.mkv", "/d/a.mkv")).unwrap();

        let mv = claim(&path).unwrap().unwrap();
        assert_eq!(mv.destination, PathBuf::from("/d/a.mkv"));
        assert!(mv.options.is_empty());
    }

    #[tokio::test]
    async fn test_replay_moves_file_and_deletes_sidecar() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("deferred");
        let source = dir.path().join("lib/a.mkv");
        let destination = dir.path().join("processed/lib/a.mkv");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"original").unwrap();

        let sidecar = persist(&state, &DeferredMove::new(&source, &destination)).unwrap();
        let summary = replay(&state, &LocalFileOps).await.unwrap();

        assert_eq!(summary.moved, 1);
        assert!(!sidecar.exists());
        assert!(!source.exists());
        assert_eq!(fs::read(&destination).unwrap(), b"original");
    }

    #[test]
    fn test_queued_rename_round_trips() {
        let mv = DeferredMove::new("/lib/Film.mkv", "/done/Film.mkv")
            .with_rename("/lib/Film.encoding.mkv", "/lib/Film.mkv");
        let json = serde_json::to_value(&mv).unwrap();
        assert_eq!(json["ThenRename"]["LiteralPath"], "/lib/Film.encoding.mkv");
        assert_eq!(json["ThenRename"]["NewName"], "/lib/Film.mkv");

        let plain = serde_json::to_value(DeferredMove::new("/a", "/b")).unwrap();
        assert!(plain.get("ThenRename").is_none());
    }

    #[tokio::test]
    async fn test_replay_renames_output_after_move() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("deferred");
        let original = dir.path().join("lib/Film.mkv");
        let working = dir.path().join("lib/Film.encoding.mkv");
        let destination = dir.path().join("processed/Film.mkv");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, b"original").unwrap();
        fs::write(&working, b"converted").unwrap();

        let mv = DeferredMove::new(&original, &destination).with_rename(&working, &original);
        persist(&state, &mv).unwrap();
        let summary = replay(&state, &LocalFileOps).await.unwrap();

        assert_eq!(summary.moved, 1);
        assert_eq!(summary.renamed, 1);
        assert_eq!(fs::read(&destination).unwrap(), b"original");
        assert_eq!(fs::read(&original).unwrap(), b"converted");
        assert!(!working.exists());
    }

    #[tokio::test]
    async fn test_failed_move_skips_queued_rename() {
        let dir = TempDir::new().unwrap();
        let mv = DeferredMove::new("/lib/Film.mkv", "/done/Film.mkv")
            .with_rename("/lib/Film.encoding.mkv", "/lib/Film.mkv");
        persist(dir.path(), &mv).unwrap();

        let summary = replay(dir.path(), &RecordingOps::default()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.renamed, 0);
    }

    #[tokio::test]
    async fn test_replay_failure_attempts_once_and_still_deletes_sidecar() {
        let dir = TempDir::new().unwrap();
        let sidecar = persist(dir.path(), &DeferredMove::new("/lib/a.mkv", "/done/a.mkv")).unwrap();

        let ops = RecordingOps::default();
        let summary = replay(dir.path(), &ops).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.attempted(), 1);
        assert_eq!(ops.moves.lock().unwrap().len(), 1);
        assert!(!sidecar.exists());
        // Not re-queued
        assert!(find_sidecars(dir.path()).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replay_skips_sidecar_locked_by_another_run() {
        let dir = TempDir::new().unwrap();
        let sidecar = persist(dir.path(), &DeferredMove::new("/lib/a.mkv", "/done/a.mkv")).unwrap();
        let held = lock_exclusive(fs::File::open(&sidecar).unwrap()).unwrap();

        let ops = RecordingOps::default();
        let summary = replay(dir.path(), &ops).await.unwrap();

        assert_eq!(summary.busy, 1);
        assert!(ops.moves.lock().unwrap().is_empty());
        assert!(sidecar.exists());
        drop(held);
    }

    #[tokio::test]
    async fn test_unparsable_sidecar_is_left_in_place() {
        let dir = TempDir::new().unwrap();
        let sidecar = dir.path().join("broken.mkv.move.json");
        fs::write(&sidecar, "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let ops = RecordingOps::default();
        let summary = replay(dir.path(), &ops).await.unwrap();
        assert_eq!(summary.unreadable, 1);
        assert!(sidecar.exists());
        assert!(ops.moves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_without_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let summary = replay(&dir.path().join("missing"), &LocalFileOps).await.unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }
}
