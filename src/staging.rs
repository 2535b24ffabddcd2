//! Server-side staging of uploaded objects.
//!
//! Staged files live under `<repo>/tmp/ostree-publish/<xx>/<rest>`, shadowing
//! the live `objects/` fan-out. Keeping the staging tree inside the
//! repository guarantees promotion is a same-filesystem `rename`, which is
//! both atomic and cheap. The store ignores its `tmp/` subtree, so staged
//! objects are invisible until promoted.

use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio::io::AsyncWriteExt;

use crate::api::ObjectName;
use crate::checksum::file_sha256;

/// Where staged objects live, relative to the repository root.
pub const STAGING_SUBDIR: &str = "tmp/ostree-publish";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Exclusive-create lost: either a concurrent upload of the same object
    /// or a client that did not consult the missing-objects list.
    #[error("object \"{0}\" is already staged")]
    AlreadyStaged(ObjectName),
    /// Promotion found the object in neither the staging area nor the live
    /// store; the closure was never completely uploaded.
    #[error("object \"{0}\" was never staged")]
    Missing(ObjectName),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Handle to the staging tree of one repository.
#[derive(Clone, Debug)]
pub struct StagingDir {
    objects_root: Utf8PathBuf,
    staging_root: Utf8PathBuf,
}

fn make_dir_all(path: &Utf8Path) -> std::io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}

impl StagingDir {
    /// Open (creating if necessary) the staging tree inside `repo_root`.
    #[context("Creating staging directory")]
    pub fn open(repo_root: &Utf8Path) -> Result<Self> {
        let staging_root = repo_root.join(STAGING_SUBDIR);
        make_dir_all(&staging_root).with_context(|| format!("Creating {staging_root}"))?;
        Ok(Self {
            objects_root: repo_root.join("objects"),
            staging_root,
        })
    }

    pub fn staged_path(&self, name: &ObjectName) -> Utf8PathBuf {
        name.path_in(&self.staging_root)
    }

    pub fn live_path(&self, name: &ObjectName) -> Utf8PathBuf {
        name.path_in(&self.objects_root)
    }

    /// The subset of `objects` present in neither the staging area nor the
    /// live store, in input order. Safe to call any number of times.
    pub fn missing_objects<'a>(
        &self,
        objects: impl IntoIterator<Item = &'a ObjectName>,
    ) -> Vec<ObjectName> {
        objects
            .into_iter()
            .filter(|name| !self.staged_path(name).exists() && !self.live_path(name).exists())
            .cloned()
            .collect()
    }

    /// Start staging one object. Fails with [`StageError::AlreadyStaged`]
    /// when a staged file for the name exists.
    pub async fn begin(&self, name: &ObjectName) -> Result<StagedWrite, StageError> {
        let path = self.staged_path(name);
        let parent = path.parent().expect("staged path has a parent");
        make_dir_all(parent)
            .with_context(|| format!("Creating {parent}"))
            .map_err(StageError::Other)?;
        let file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StageError::AlreadyStaged(name.clone()))
            }
            Err(e) => {
                return Err(StageError::Other(
                    anyhow::Error::new(e).context(format!("Creating {path}")),
                ))
            }
        };
        Ok(StagedWrite { file, path })
    }

    /// Remove a staged file, e.g. after a checksum mismatch. Missing files
    /// are fine (a concurrent finalize may already have promoted it).
    pub fn discard(&self, name: &ObjectName) -> Result<()> {
        let path = self.staged_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Removing {path}"))),
        }
    }

    /// Move every staged object into the live store. Objects already in the
    /// live store are skipped (identical name implies identical content);
    /// objects found in neither tree fail the whole promotion.
    ///
    /// Refs must only be advanced after this returns successfully: a failure
    /// here leaves at worst orphan objects in the live store, never a ref
    /// pointing at an incomplete closure.
    pub fn promote<'a>(
        &self,
        objects: impl IntoIterator<Item = &'a ObjectName>,
    ) -> Result<(), StageError> {
        for name in objects {
            let live = self.live_path(name);
            let parent = live.parent().expect("object path has a parent");
            make_dir_all(parent)
                .with_context(|| format!("Creating {parent}"))
                .map_err(StageError::Other)?;
            if live.exists() {
                continue;
            }
            let staged = self.staged_path(name);
            match std::fs::rename(&staged, &live) {
                Ok(()) => tracing::debug!("Published {name}"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StageError::Missing(name.clone()))
                }
                Err(e) => {
                    return Err(StageError::Other(
                        anyhow::Error::new(e).context(format!("Renaming {staged} to {live}")),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// An in-progress staged object.
#[derive(Debug)]
pub struct StagedWrite {
    file: tokio::fs::File,
    path: Utf8PathBuf,
}

impl StagedWrite {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    /// Close the file and hash what actually landed on disk, returning the
    /// hex SHA-256.
    pub async fn finish(mut self) -> Result<String> {
        self.file.flush().await?;
        drop(self.file);
        let path = self.path;
        tokio::task::spawn_blocking(move || file_sha256(&path)).await?
    }
}
