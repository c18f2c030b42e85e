//! Per-package run records and the workspace lock.
//!
//! Each build attempt that gets past its preconditions owns a run directory:
//!
//! ```text
//! <work_dir>/.package-build/runs/<package>/<run_id>/run-manifest.json
//! ```
//!
//! The record is written once as `building` before any side effect and
//! rewritten as `success` or `failed` when the build ends. Older runs are
//! pruned after each finished build.

use std::cmp::Reverse;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BuildError;
use crate::patches::AppliedPatch;
use crate::state::StateTracker;

pub const STATE_DIR_NAME: &str = ".package-build";
pub const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";
pub const DEFAULT_KEEP_RUNS: usize = 5;

pub const STATUS_BUILDING: &str = "building";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

const RUN_ID_SALT_BITS: u32 = 32;
static RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `<work_dir>/.package-build`
pub fn state_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(STATE_DIR_NAME)
}

/// Directory holding every run of `package`.
pub fn package_runs_dir(work_dir: &Path, package: &str) -> PathBuf {
    state_dir(work_dir).join("runs").join(package)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Persisted outcome of one build attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub package: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub state: StateTracker,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub patches: Vec<AppliedPatch>,
    #[serde(default)]
    pub patch_set_digest: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub tarball: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: String, package: &str, created_at_utc: String) -> Self {
        Self {
            run_id,
            package: package.to_string(),
            status: STATUS_BUILDING.to_string(),
            created_at_utc,
            finished_at_utc: None,
            state: StateTracker::new(),
            version: None,
            patches: Vec::new(),
            patch_set_digest: None,
            artifacts: Vec::new(),
            tarball: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    fn sort_key(&self) -> (String, String) {
        (
            self.finished_at_utc
                .clone()
                .unwrap_or_else(|| self.created_at_utc.clone()),
            self.run_id.clone(),
        )
    }
}

/// Sortable, collision-resistant run identifier.
pub fn generate_run_id() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before UNIX_EPOCH while generating run id")?
        .as_nanos();
    let pid_component = (std::process::id() as u128) << (RUN_ID_SALT_BITS - 16);
    let seq_component = (RUN_ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u128) & 0xFFFF;
    let entropy = (nanos << RUN_ID_SALT_BITS) | pid_component | seq_component;
    let id = base62_encode_u128(entropy);
    if id.len() > 20 {
        bail!("run id overflow while generating run identifier")
    }
    Ok(id)
}

fn base62_encode_u128(mut value: u128) -> String {
    const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    bytes.iter().rev().collect()
}

/// UTC timestamp as `YYYYMMDDTHHMMSSZ`.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Write `record` into its run directory, replacing any previous version.
pub fn write_run_record(runs_dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    let path = manifest_path(&runs_dir.join(&record.run_id));
    write_json_atomic(&path, record)
        .with_context(|| format!("writing run record '{}'", path.display()))?;
    Ok(path)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path without parent '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let payload = serde_json::to_vec_pretty(value).context("serializing run record")?;
    fs::write(&tmp, payload).with_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Every readable run record under `runs_dir`, newest first.
pub fn load_runs(runs_dir: &Path) -> Result<Vec<RunRecord>> {
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("reading runs directory '{}'", runs_dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", runs_dir.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading run record '{}'", path.display()))?;
        let parsed: RunRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run record '{}'", path.display()))?;
        runs.push(parsed);
    }
    runs.sort_by_key(|run| Reverse(run.sort_key()));
    Ok(runs)
}

pub fn latest_run(runs_dir: &Path) -> Result<Option<RunRecord>> {
    Ok(load_runs(runs_dir)?.into_iter().next())
}

pub fn latest_successful_run_id(runs_dir: &Path) -> Result<Option<String>> {
    Ok(load_runs(runs_dir)?
        .into_iter()
        .find(RunRecord::is_success)
        .map(|run| run.run_id))
}

/// Keep the newest `keep` runs, delete the rest. Returns how many were removed.
pub fn prune_old_runs(runs_dir: &Path, keep: usize) -> Result<usize> {
    let runs = load_runs(runs_dir)?;
    let mut removed = 0;
    for run in runs.into_iter().skip(keep) {
        let path = runs_dir.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Exclusive lock over a work directory, held for the life of the guard.
///
/// The lock file is never unlinked: removing a file another process still
/// holds would let a third process lock a fresh inode at the same path.
#[derive(Debug)]
pub struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(work_dir: &Path) -> Result<Self> {
        let dir = state_dir(work_dir);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory '{}'", dir.display()))?;
        let path = dir.join("lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::WorkspaceLocked {
                path: work_dir.to_path_buf(),
            }
            .into());
        }
        tracing::debug!("[lock] acquired {}", path.display());
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
