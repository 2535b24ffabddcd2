//! Thin facade over the `ostree` crate.
//!
//! Everything the rest of this crate needs from the content-addressed store
//! goes through here: repository mode, ref listing and resolution, commit
//! parent lookup, closure traversal, object path derivation and atomic ref
//! updates. Other modules hold only opaque strings (revisions, object names)
//! plus a clone of this handle.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use fn_error_context::context;
use io_lifetimes::AsFd;
use ostree::gio;

use crate::api::ObjectName;

/// Statistics returned by [`Repo::prune`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub total: u32,
    pub pruned: u32,
    pub bytes_freed: u64,
}

/// An opened ostree repository plus its filesystem location.
#[derive(Clone)]
pub struct Repo {
    repo: ostree::Repo,
    path: Utf8PathBuf,
}

impl Repo {
    /// Open the repository at `path`.
    #[context("Opening ostree repository at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let repofd = cap_std::fs::Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("Opening directory at '{path}'"))?;
        let repo = ostree::Repo::open_at_dir(repofd.as_fd(), ".")?;
        Ok(Self {
            repo,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_archive(&self) -> bool {
        self.repo.mode() == ostree::RepoMode::Archive
    }

    /// The repository mode as it appears on the wire.
    pub fn mode_name(&self) -> Result<&'static str> {
        let name = match self.repo.mode() {
            ostree::RepoMode::Bare => "bare",
            ostree::RepoMode::Archive => "archive",
            ostree::RepoMode::BareUser => "bare-user",
            ostree::RepoMode::BareUserOnly => "bare-user-only",
            m => return Err(anyhow!("Unhandled repository mode {m:?}")),
        };
        Ok(name)
    }

    /// All refs with their current revisions.
    #[context("Listing refs")]
    pub fn list_revisions(&self) -> Result<BTreeMap<String, String>> {
        let mut revs = BTreeMap::new();
        for (r, rev) in self.repo.list_refs(None, gio::Cancellable::NONE)? {
            revs.insert(r.to_string(), rev.to_string());
        }
        Ok(revs)
    }

    /// Resolve a branch to its current revision; errors if the branch is unknown.
    #[context("Resolving rev for {branch}")]
    pub fn resolve_rev(&self, branch: &str) -> Result<String> {
        self.repo
            .resolve_rev(branch, true)?
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("No such branch: {branch}"))
    }

    /// The parent revision of `commit`, or `None` for root commits.
    #[context("Looking up parent of {commit}")]
    pub fn parent_of(&self, commit: &str) -> Result<Option<String>> {
        let variant = self
            .repo
            .load_variant(ostree::ObjectType::Commit, commit)
            .with_context(|| format!("Commit {commit} not found in local repository"))?;
        Ok(ostree::commit_get_parent(&variant).map(|s| s.to_string()))
    }

    /// The transitive object closure of `commit`, traversing `max_depth`
    /// parent commits (0 traverses only `commit` itself).
    ///
    /// Content objects are named `filez` in archive mode and `file` otherwise.
    #[context("Traversing commit {commit}")]
    pub fn traverse_commit(&self, commit: &str, max_depth: i32) -> Result<Vec<ObjectName>> {
        let archive = self.is_archive();
        let cancellable = gio::Cancellable::NONE;
        let reachable = self.repo.traverse_commit(commit, max_depth, cancellable)?;
        let mut objects = Vec::with_capacity(reachable.len());
        for object in reachable {
            let suffix = match object.object_type() {
                ostree::ObjectType::Commit => "commit",
                ostree::ObjectType::DirTree => "dirtree",
                ostree::ObjectType::DirMeta => "dirmeta",
                ostree::ObjectType::File => {
                    if archive {
                        "filez"
                    } else {
                        "file"
                    }
                }
                // Detached metadata and other auxiliary objects are not part
                // of the publishable closure.
                _ => continue,
            };
            let name = format!("{}.{}", object.checksum(), suffix);
            objects.push(ObjectName::parse(&name)?);
        }
        Ok(objects)
    }

    /// The path an object occupies in the live store. Purely syntactic; the
    /// object may not exist.
    pub fn object_path(&self, name: &ObjectName) -> Utf8PathBuf {
        name.path_in(&self.path.join("objects"))
    }

    /// Atomically point `branch` at `checksum`.
    #[context("Setting ref {branch} to {checksum}")]
    pub fn set_ref(&self, branch: &str, checksum: &str) -> Result<()> {
        self.repo
            .set_ref_immediate(None, branch, Some(checksum), gio::Cancellable::NONE)?;
        Ok(())
    }

    /// Remove unreachable objects; with `dry_run` only report what would go.
    #[context("Pruning repository")]
    pub fn prune(&self, dry_run: bool) -> Result<PruneStats> {
        let flags = if dry_run {
            ostree::RepoPruneFlags::NO_PRUNE
        } else {
            ostree::RepoPruneFlags::NONE
        };
        let (total, pruned, bytes_freed) =
            self.repo.prune(flags, -1, gio::Cancellable::NONE)?;
        Ok(PruneStats {
            total: total.try_into().unwrap_or_default(),
            pruned: pruned.try_into().unwrap_or_default(),
            bytes_freed,
        })
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo").field("path", &self.path).finish()
    }
}
