//! File-backed checkpoint store.
//!
//! Layout: `<dir>/<run_id>.checkpoint.json` plus `<run_id>.checkpoint.json.bak`
//! holding the last version that validated. Run ids must be plain file names.

use crate::checkpoint::schema::{self, CheckpointSchema};
use crate::error::CheckpointError;
use crate::pipeline::{PipelineRun, RunStatus};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const CHECKPOINT_SUFFIX: &str = ".checkpoint.json";
const BACKUP_SUFFIX: &str = ".checkpoint.json.bak";

/// Outcome of [`CheckpointStore::recover`].
#[derive(Debug)]
pub enum Recovery {
    Primary(PipelineRun),
    /// The primary was unusable; the previous version was loaded instead.
    Backup {
        run: PipelineRun,
        primary_error: String,
    },
    /// Neither copy was usable; the caller starts over.
    Fresh { reason: String },
}

/// Listing entry for one stored run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub updated_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    dir: PathBuf,
    schema: CheckpointSchema,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, schema: CheckpointSchema) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, schema })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schema(&self) -> &CheckpointSchema {
        &self.schema
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", run_id, CHECKPOINT_SUFFIX))
    }

    pub fn backup_path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", run_id, BACKUP_SUFFIX))
    }

    /// Atomically replace the run's checkpoint, keeping the previous one as backup.
    ///
    /// A previous primary that fails validation is not rotated, so the backup always
    /// holds the last good version.
    pub fn save(&self, run: &PipelineRun) -> Result<PathBuf, CheckpointError> {
        check_run_id(&run.id)?;
        if let Some(stage) = run.stages.iter().find(|s| s.status.is_in_flight()) {
            return Err(CheckpointError::MidStage {
                run_id: run.id.clone(),
                stage: stage.name.clone(),
            });
        }
        let bytes = schema::encode(run)?;

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;

        let path = self.path_for(&run.id);
        if path.exists() {
            self.rotate_backup(&path, &run.id)?;
        }
        temp.persist(&path).map_err(|e| e.error)?;

        debug!(run_id = %run.id, path = %path.display(), bytes = bytes.len(), "Checkpoint saved");
        Ok(path)
    }

    fn rotate_backup(&self, path: &Path, run_id: &str) -> Result<(), CheckpointError> {
        let previous = fs::read(path)?;
        match self.schema.decode(path, &previous) {
            Ok(stored) if stored.id == run_id => {
                let mut backup = NamedTempFile::new_in(&self.dir)?;
                backup.write_all(&previous)?;
                backup.as_file().sync_all()?;
                backup
                    .persist(self.backup_path_for(run_id))
                    .map_err(|e| e.error)?;
            }
            Ok(stored) => warn!(
                run_id,
                found = %stored.id,
                "Previous checkpoint belongs to another run, keeping existing backup"
            ),
            Err(err) => warn!(
                run_id,
                error = %err,
                "Previous checkpoint invalid, keeping existing backup"
            ),
        }
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<PipelineRun, CheckpointError> {
        self.load_path(&self.path_for(run_id), run_id)
    }

    pub fn load_backup(&self, run_id: &str) -> Result<PipelineRun, CheckpointError> {
        self.load_path(&self.backup_path_for(run_id), run_id)
    }

    /// Validate any checkpoint file, whatever its name.
    pub fn validate_file(&self, path: &Path) -> Result<PipelineRun, CheckpointError> {
        let bytes = fs::read(path)?;
        self.schema.decode(path, &bytes)
    }

    fn load_path(&self, path: &Path, run_id: &str) -> Result<PipelineRun, CheckpointError> {
        check_run_id(run_id)?;
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let run = self.schema.decode(path, &bytes)?;
        if run.id != run_id {
            return Err(CheckpointError::Corruption {
                path: path.to_path_buf(),
                reason: format!("file holds run '{}', expected '{}'", run.id, run_id),
            });
        }
        Ok(run)
    }

    /// Primary, then backup, then a fresh start.
    pub fn recover(&self, run_id: &str) -> Result<Recovery, CheckpointError> {
        check_run_id(run_id)?;
        let primary_error = match self.load(run_id) {
            Ok(run) => return Ok(Recovery::Primary(run)),
            Err(CheckpointError::IoError(e)) => return Err(CheckpointError::IoError(e)),
            Err(err) => err.to_string(),
        };
        warn!(run_id, error = %primary_error, "Primary checkpoint unusable, trying backup");
        match self.load_backup(run_id) {
            Ok(run) => {
                info!(run_id, "Recovered run from backup checkpoint");
                Ok(Recovery::Backup { run, primary_error })
            }
            Err(CheckpointError::IoError(e)) => Err(CheckpointError::IoError(e)),
            Err(backup_error) => {
                warn!(run_id, error = %backup_error, "Backup checkpoint unusable, starting fresh");
                Ok(Recovery::Fresh {
                    reason: format!("primary: {}; backup: {}", primary_error, backup_error),
                })
            }
        }
    }

    /// Stored runs, most recently updated first. Unreadable checkpoints are skipped.
    pub fn list(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(run_id) = name.to_str().and_then(|n| n.strip_suffix(CHECKPOINT_SUFFIX)) else {
                continue;
            };
            match self.load(run_id) {
                Ok(run) => summaries.push(RunSummary {
                    run_id: run.id.clone(),
                    status: run.status,
                    completed_stages: run.completed_stages(),
                    total_stages: run.stages.len(),
                    updated_at: run.updated_at,
                }),
                Err(err) => warn!(run_id, error = %err, "Skipping unreadable checkpoint"),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    /// Delete checkpoint and backup. Returns whether anything was removed.
    pub fn remove(&self, run_id: &str) -> Result<bool, CheckpointError> {
        check_run_id(run_id)?;
        let mut removed = false;
        for path in [self.path_for(run_id), self.backup_path_for(run_id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

fn check_run_id(run_id: &str) -> Result<(), CheckpointError> {
    let plain = !run_id.is_empty()
        && run_id != "."
        && !run_id.contains("..")
        && !run_id.contains(['/', '\\'])
        && Path::new(run_id).file_name().is_some_and(|name| name == run_id);
    if plain {
        Ok(())
    } else {
        Err(CheckpointError::InvalidRunId(run_id.to_string()))
    }
}
