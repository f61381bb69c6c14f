//! Connector over a local directory of monthly files.
//!
//! Serves manual exports (exchange reference, web portal) and offline
//! mirrors of the regulator tree. A missing file means the month was not
//! published; anything else that prevents reading it is an I/O error.

use super::connector::{ConnectorError, RawPayload, SourceConnector};
use crate::domain::{DatasetKind, YearMonth};
use std::io;
use std::path::{Path, PathBuf};

/// How files are laid out below the root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLayout {
    /// `{root}/{file_name}`.
    Flat,
    /// `{root}/{remote_path}`, the regulator's own tree.
    Mirror,
}

pub struct DirectoryConnector {
    name: String,
    kind: DatasetKind,
    root: PathBuf,
    layout: DirectoryLayout,
}

impl DirectoryConnector {
    pub fn new(kind: DatasetKind, root: impl Into<PathBuf>, layout: DirectoryLayout) -> Self {
        Self {
            name: format!("dir:{kind}"),
            kind,
            root: root.into(),
            layout,
        }
    }

    /// Flat directory of `{prefix}_YYYYMM` exports.
    pub fn flat(kind: DatasetKind, root: impl Into<PathBuf>) -> Self {
        Self::new(kind, root, DirectoryLayout::Flat)
    }

    /// Offline copy of the regulator tree.
    pub fn mirror(kind: DatasetKind, root: impl Into<PathBuf>) -> Self {
        Self::new(kind, root, DirectoryLayout::Mirror)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, month: YearMonth) -> PathBuf {
        match (self.layout, self.kind.remote_path(month)) {
            (DirectoryLayout::Mirror, Some(remote)) => self.root.join(remote),
            _ => self.root.join(self.kind.file_name(month)),
        }
    }
}

impl SourceConnector for DirectoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DatasetKind {
        self.kind
    }

    fn fetch(&self, month: YearMonth) -> Result<RawPayload, ConnectorError> {
        let path = self.path_for(month);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(RawPayload {
                kind: self.kind,
                month,
                origin: path.display().to_string(),
                format: self.kind.format(),
                bytes,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ConnectorError::NotPublished {
                kind: self.kind,
                month,
            }),
            Err(e) => Err(ConnectorError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }
}
