//! Client side of a publish: determine which branches are behind, walk the
//! commit graph until it converges with the server, expand the commits into
//! their object closure, then drive the four protocol phases.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

use crate::api::{ObjectName, RevisionPair};
use crate::checksum::file_sha256;
use crate::client::Client;
use crate::repo::Repo;

/// Objects in one upload request are bounded by this many bytes of payload;
/// a single larger object still goes alone in its own request.
const UPLOAD_BATCH_LIMIT: u64 = 32 * 1024 * 1024;

/// Where an object lives locally and what it hashes to.
#[derive(Clone, Debug)]
pub struct ObjectSource {
    pub path: Utf8PathBuf,
    pub checksum: String,
    pub size: u64,
}

/// Everything the wire layer needs to run one publish.
#[derive(Debug, Default)]
pub struct PushPlan {
    pub update_refs: BTreeMap<String, RevisionPair>,
    pub objects: BTreeMap<ObjectName, ObjectSource>,
}

/// Options for [`run`].
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub address: String,
    pub repo: Utf8PathBuf,
    pub token: String,
    /// Branches to publish; empty means every local branch.
    pub branches: Vec<String>,
    /// Prune the local repository before enumerating objects.
    pub prune: bool,
}

/// Resolve the branches being published to their local revisions.
#[context("Resolving local branches")]
fn local_revisions(repo: &Repo, branches: &[String]) -> Result<BTreeMap<String, String>> {
    if branches.is_empty() {
        return repo.list_revisions();
    }
    branches
        .iter()
        .map(|b| Ok((b.clone(), repo.resolve_rev(b)?)))
        .collect()
}

/// Branches whose local revision differs from the server's. The `server`
/// side of a pair is empty when the server does not have the branch at all.
pub(crate) fn compute_update_refs(
    local: &BTreeMap<String, String>,
    remote: &BTreeMap<String, String>,
) -> BTreeMap<String, RevisionPair> {
    local
        .iter()
        .filter(|(branch, rev)| remote.get(*branch) != Some(*rev))
        .map(|(branch, rev)| {
            let server = remote.get(branch).cloned().unwrap_or_default();
            (
                branch.clone(),
                RevisionPair {
                    server,
                    client: rev.clone(),
                },
            )
        })
        .collect()
}

/// Walk parents from the client revision until the server revision is
/// reached, collecting the commits in between (client revision first).
/// `parent_of` resolves a commit to its parent revision.
///
/// A branch whose history terminates without passing through the server's
/// commit does not extend the server branch and cannot be published.
#[context("Collecting commits for branch {branch}")]
fn needed_commits(
    parent_of: impl Fn(&str) -> Result<Option<String>>,
    branch: &str,
    pair: &RevisionPair,
) -> Result<Vec<String>> {
    let server_rev = (!pair.server.is_empty()).then_some(pair.server.as_str());
    let mut commits = Vec::new();
    let mut rev = pair.client.clone();
    loop {
        tracing::debug!("Adding commit {rev}");
        commits.push(rev.clone());
        match parent_of(&rev)? {
            Some(parent) if Some(parent.as_str()) == server_rev => return Ok(commits),
            Some(parent) => rev = parent,
            None => break,
        }
    }
    if let Some(server_rev) = server_rev {
        bail!(
            "Local commit {} on branch {branch} does not descend from the server's commit {server_rev}",
            pair.client
        );
    }
    Ok(commits)
}

/// Expand `commits` into their union closure, hashing every object file.
#[context("Enumerating objects to send")]
fn needed_objects(repo: &Repo, commits: &[String]) -> Result<BTreeMap<ObjectName, ObjectSource>> {
    let mut objects = BTreeMap::new();
    for commit in commits {
        for name in repo.traverse_commit(commit, 0)? {
            if objects.contains_key(&name) {
                continue;
            }
            let path = repo.object_path(&name);
            let meta = std::fs::metadata(&path).with_context(|| {
                format!("Repository corrupt: object {name} of commit {commit} is missing")
            })?;
            let checksum = file_sha256(&path)?;
            objects.insert(
                name,
                ObjectSource {
                    path,
                    checksum,
                    size: meta.len(),
                },
            );
        }
    }
    Ok(objects)
}

/// Build the publish plan, or `None` when the server is already current.
pub fn build_plan(
    repo: &Repo,
    branches: &[String],
    remote_refs: &BTreeMap<String, String>,
) -> Result<Option<PushPlan>> {
    let local = local_revisions(repo, branches)?;
    let update_refs = compute_update_refs(&local, remote_refs);
    if update_refs.is_empty() {
        return Ok(None);
    }
    for (branch, pair) in &update_refs {
        if pair.server.is_empty() {
            tracing::info!("New branch {branch} at {}", pair.client);
        } else {
            tracing::info!("Branch {branch}: {} -> {}", pair.server, pair.client);
        }
    }
    let mut commits = Vec::new();
    for (branch, pair) in &update_refs {
        commits.extend(needed_commits(|rev| repo.parent_of(rev), branch, pair)?);
    }
    let objects = needed_objects(repo, &commits)?;
    Ok(Some(PushPlan {
        update_refs,
        objects,
    }))
}

/// Group the objects the server still wants into byte-bounded upload batches,
/// preserving the server's order.
fn batch_objects<'p>(
    missing: &[ObjectName],
    plan: &'p PushPlan,
) -> Result<Vec<Vec<(&'p ObjectName, &'p ObjectSource)>>> {
    let mut batches = Vec::new();
    let mut batch: Vec<(&ObjectName, &ObjectSource)> = Vec::new();
    let mut batch_size = 0u64;
    for name in missing {
        let (name, source) = plan
            .objects
            .get_key_value(name)
            .with_context(|| format!("Server requested object {name} not part of this publish"))?;
        if !batch.is_empty() && batch_size + source.size > UPLOAD_BATCH_LIMIT {
            batches.push(std::mem::take(&mut batch));
            batch_size = 0;
        }
        batch_size += source.size;
        batch.push((name, source));
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    Ok(batches)
}

async fn publish(client: &Client, id: &str, plan: &PushPlan) -> Result<()> {
    let missing = client.missing_objects(id).await?;
    tracing::info!("Uploading {} objects", missing.len());
    let start = Instant::now();
    for batch in batch_objects(&missing, plan)? {
        client.upload(id, &batch).await?;
    }
    tracing::info!("Upload took {:?}", start.elapsed());
    client.done(id).await?;
    Ok(())
}

/// Run a complete publish against a receiver.
pub async fn run(config: PushConfig) -> Result<()> {
    let repo = Repo::open(&config.repo)?;
    let client = Client::new(&config.address, &config.token)?;

    tracing::info!("Receiving repository information...");
    let info = client.info().await?;

    let plan = {
        let repo = repo.clone();
        let branches = config.branches.clone();
        let prune = config.prune;
        tokio::task::spawn_blocking(move || -> Result<_> {
            if prune {
                let stats = repo.prune(false)?;
                tracing::info!(
                    "Pruned {}/{} objects, {} bytes freed",
                    stats.pruned,
                    stats.total,
                    stats.bytes_freed
                );
            }
            build_plan(&repo, &branches, &info.revs)
        })
        .await??
    };
    let Some(plan) = plan else {
        tracing::info!("Nothing to update.");
        return Ok(());
    };

    let id = client
        .create_queue(&plan.update_refs, plan.objects.keys().cloned().collect())
        .await?;
    tracing::debug!("Opened queue entry {id}");

    if let Err(e) = publish(&client, &id, &plan).await {
        if let Err(delete_err) = client.delete_queue(&id).await {
            tracing::warn!("Failed to delete queue entry {id}: {delete_err:#}");
        }
        return Err(e);
    }
    tracing::info!("Done.");
    Ok(())
}
