use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File-name prefix shared by every per-execution artifact
pub const ARTIFACT_PREFIX: &str = "agent-shell-";

/// Capture and sentinel files of one execution attempt
#[derive(Debug, Clone)]
pub struct ExecutionArtifacts {
    pub capture: PathBuf,
    pub sentinel: PathBuf,
}

impl ExecutionArtifacts {
    pub fn new(dir: &Path, key: &str) -> Self {
        Self {
            capture: dir.join(format!("{}{}.out", ARTIFACT_PREFIX, key)),
            sentinel: dir.join(format!("{}{}.done", ARTIFACT_PREFIX, key)),
        }
    }

    /// Completion is signalled only by the sentinel's existence
    pub async fn completed(&self) -> bool {
        tokio::fs::try_exists(&self.sentinel).await.unwrap_or(false)
    }

    pub async fn read_capture(&self) -> io::Result<String> {
        let bytes = tokio::fs::read(&self.capture).await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Remove both files, tolerating ones that are already gone
    pub async fn remove(&self) {
        for path in [&self.capture, &self.sentinel] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!(path = %path.display(), error = %e, "artifact removal failed"),
            }
        }
    }
}

pub async fn ensure_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

/// Delete artifacts older than `max_age` left behind by abandoned executions.
/// Returns the number of files removed.
pub fn sweep_orphans(dir: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().starts_with(ARTIFACT_PREFIX) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|modified| now.duration_since(modified).unwrap_or_default());
        let Some(age) = age else {
            continue;
        };
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %entry.path().display(), error = %e, "orphan removal failed"),
        }
    }

    removed
}
