//! Generation publishing: write aside, then repoint `current` atomically.
//!
//! Layout under the output root:
//! - `current`            symlink to the published generation
//! - `generations/<name>` one directory per promoted generation
//! - `.pending/`          the generation being written
//! - `.current.tmp`       the replacement link during a swap
//!
//! A promote renames `.pending/` into `generations/`, points a fresh
//! `.current.tmp` link at it and renames that link over `current`. The final
//! rename is the only step readers can observe, so `current` always names a
//! complete generation. `manifest.json` is written last. Superseded
//! generations are removed after the swap on a best-effort basis, and
//! leftovers of interrupted runs are cleared by [`Publisher::recover`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const CURRENT_LINK: &str = "current";
pub const GENERATIONS_DIR: &str = "generations";
pub const PENDING_DIR: &str = ".pending";
pub const CURRENT_TMP_LINK: &str = ".current.tmp";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to write outside the generation: {0}")]
    InvalidPath(String),

    #[error("failed to serialize manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> PublishError + 'a {
    move |source| PublishError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Summary of a published generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub generation_id: String,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub staging: Vec<String>,
    pub curated: Vec<String>,
    pub api: Vec<String>,
}

/// What [`Publisher::recover`] found and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// An abandoned pending generation.
    RemovedPending,
    /// A replacement link left by a swap that never happened.
    RemovedStaleLink,
    /// A generation directory `current` does not point at.
    RemovedOrphan,
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Whether anything, including a dangling link, exists at `path`.
fn occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_link(path: &Path) -> io::Result<()> {
    fs::remove_file(path).or_else(|_| fs::remove_dir(path))
}

/// Leading sequence number of a generation directory name.
fn sequence_of(name: &str) -> Option<u64> {
    name.split('-').next()?.parse().ok()
}

pub struct Publisher {
    root: PathBuf,
}

impl Publisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable path of the published generation.
    pub fn current_dir(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join(PENDING_DIR)
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join(GENERATIONS_DIR)
    }

    /// Directory name under `generations/` that `current` points at.
    pub fn current_generation(&self) -> Option<String> {
        let target = fs::read_link(self.current_dir()).ok()?;
        Some(target.file_name()?.to_string_lossy().into_owned())
    }

    fn generation_names(&self) -> Result<Vec<String>, PublishError> {
        let dir = self.generations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err("list", &dir))? {
            let entry = entry.map_err(io_err("list", &dir))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Read the published manifest, if any.
    pub fn current_manifest(&self) -> Result<Option<Manifest>, PublishError> {
        let path = self.current_dir().join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(io_err("read", &path))?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Clear whatever an interrupted run left behind. `current` is never
    /// touched.
    pub fn recover(&self) -> Result<Vec<RecoveryAction>, PublishError> {
        let mut actions = Vec::new();

        let pending = self.pending_dir();
        if pending.exists() {
            fs::remove_dir_all(&pending).map_err(io_err("remove", &pending))?;
            actions.push(RecoveryAction::RemovedPending);
        }
        let tmp_link = self.root.join(CURRENT_TMP_LINK);
        if occupied(&tmp_link) {
            remove_link(&tmp_link).map_err(io_err("remove", &tmp_link))?;
            actions.push(RecoveryAction::RemovedStaleLink);
        }
        let live = self.current_generation();
        for name in self.generation_names()? {
            if live.as_deref() != Some(name.as_str()) {
                let path = self.generations_dir().join(&name);
                fs::remove_dir_all(&path).map_err(io_err("remove", &path))?;
                actions.push(RecoveryAction::RemovedOrphan);
            }
        }

        for action in &actions {
            warn!(root = %self.root.display(), ?action, "recovered interrupted publish");
        }
        Ok(actions)
    }

    /// Start a fresh pending generation.
    pub fn begin(&self) -> Result<PendingGeneration, PublishError> {
        let dir = self.pending_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(io_err("remove", &dir))?;
        }
        fs::create_dir_all(&dir).map_err(io_err("create", &dir))?;
        Ok(PendingGeneration { dir })
    }

    /// Write the manifest, move the pending generation under `generations/`
    /// and repoint `current` at it.
    ///
    /// Any error before the link rename leaves the previous generation
    /// published.
    pub fn promote(
        &self,
        pending: PendingGeneration,
        manifest: &Manifest,
    ) -> Result<PathBuf, PublishError> {
        pending.write(MANIFEST_FILE, &serde_json::to_vec_pretty(manifest)?)?;

        let generations = self.generations_dir();
        fs::create_dir_all(&generations).map_err(io_err("create", &generations))?;
        let sequence = self
            .generation_names()?
            .iter()
            .filter_map(|n| sequence_of(n))
            .max()
            .map_or(1, |s| s + 1);
        let short: String = manifest.generation_id.chars().take(12).collect();
        let name = format!("{sequence:06}-{short}");
        let target = generations.join(&name);
        fs::rename(&pending.dir, &target).map_err(io_err("promote", &pending.dir))?;

        let tmp_link = self.root.join(CURRENT_TMP_LINK);
        if occupied(&tmp_link) {
            remove_link(&tmp_link).map_err(io_err("remove", &tmp_link))?;
        }
        symlink_dir(&Path::new(GENERATIONS_DIR).join(&name), &tmp_link)
            .map_err(io_err("link", &tmp_link))?;
        let current = self.current_dir();
        fs::rename(&tmp_link, &current).map_err(io_err("swap", &current))?;

        info!(
            generation = %manifest.generation_id,
            path = %target.display(),
            "generation published"
        );
        self.prune(&name);
        Ok(current)
    }

    /// Remove every generation but `live`. Failures are logged; the new
    /// generation is already published.
    fn prune(&self, live: &str) {
        let names = match self.generation_names() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "could not list superseded generations");
                return;
            }
        };
        for name in names.iter().filter(|n| n.as_str() != live) {
            let path = self.generations_dir().join(name);
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "could not remove superseded generation");
            }
        }
    }
}

/// A generation being written under `.pending/`.
#[derive(Debug)]
pub struct PendingGeneration {
    dir: PathBuf,
}

impl PendingGeneration {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` at a relative path inside the generation.
    pub fn write(&self, relative: &str, bytes: &[u8]) -> Result<(), PublishError> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(PublishError::InvalidPath(relative.to_string()));
        }
        let path = self.dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("create", parent))?;
        }
        fs::write(&path, bytes).map_err(io_err("write", &path))
    }
}
