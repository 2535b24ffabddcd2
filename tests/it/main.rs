//! End-to-end tests driving a live receiver over loopback HTTP.

use std::collections::{BTreeMap, BTreeSet};
use std::future::IntoFuture;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

use ostree_publish::api::{ObjectName, RevisionPair};
use ostree_publish::checksum::file_sha256;
use ostree_publish::client::Client;
use ostree_publish::ostree::prelude::Cast;
use ostree_publish::ostree::{self, gio};
use ostree_publish::push::{self, build_plan, ObjectSource, PushConfig};
use ostree_publish::repo::Repo;
use ostree_publish::server::{self, AppState};
use ostree_publish::staging::STAGING_SUBDIR;
use ostree_publish::token::{Token, TokenConfig};

#[track_caller]
fn assert_err_contains<T>(r: Result<T>, s: impl AsRef<str>) {
    let s = s.as_ref();
    let msg = format!("{:#}", r.err().expect("Expecting an error"));
    if !msg.contains(s) {
        panic!(r#"Error message "{}" did not contain "{}""#, msg, s);
    }
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write one commit holding the given regular files (all in the root
/// directory) and point `branch` at it.
fn commit_files(
    repo: &ostree::Repo,
    branch: &str,
    parent: Option<&str>,
    files: &[(&str, &str)],
) -> Result<String> {
    let cancellable = gio::Cancellable::NONE;
    let tx = repo.auto_transaction(cancellable)?;

    // root/root 0755 directory metadata
    let finfo = gio::FileInfo::new();
    finfo.set_attribute_uint32("unix::uid", 0);
    finfo.set_attribute_uint32("unix::gid", 0);
    finfo.set_attribute_uint32("unix::mode", libc::S_IFDIR | 0o755);
    let dirmeta = ostree::create_directory_metadata(&finfo, None);
    let dirmeta = repo
        .write_metadata(ostree::ObjectType::DirMeta, None, &dirmeta, cancellable)?
        .to_hex();

    let root = ostree::MutableTree::new();
    root.set_metadata_checksum(dirmeta.as_str());
    for (name, contents) in files {
        let checksum = repo.write_regfile_inline(
            None,
            0,
            0,
            libc::S_IFREG | 0o644,
            None,
            contents.as_bytes(),
            cancellable,
        )?;
        root.replace_file(name, checksum.as_str())?;
    }
    let root = repo.write_mtree(&root, cancellable)?;
    let root = root.downcast_ref::<ostree::RepoFile>().unwrap();
    let commit = repo.write_commit(parent, None, None, None, root, cancellable)?;
    repo.transaction_set_ref(None, branch, Some(commit.as_str()));
    tx.commit(cancellable)?;
    Ok(commit.to_string())
}

/// A live receiver on an ephemeral loopback port, plus a client-side source
/// repository and a scratch directory for hand-built object files.
struct Fixture {
    _tempdir: tempfile::TempDir,
    repo_path: Utf8PathBuf,
    src_repo: Utf8PathBuf,
    srcdir: Utf8PathBuf,
    token: String,
    addr: SocketAddr,
    client: Client,
}

impl Fixture {
    async fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path = Utf8Path::from_path(tempdir.path()).context("tempdir is not UTF-8")?;
        let repo_path = path.join("repo");
        let srcdir = path.join("src");
        std::fs::create_dir(&srcdir)?;

        let repo = ostree::Repo::new_for_path(repo_path.as_std_path());
        repo.create(ostree::RepoMode::Bare, gio::Cancellable::NONE)?;

        // The client side works against its own repository; bare-user keeps
        // content objects plain files without requiring privileges.
        let src_repo = path.join("src-repo");
        let srcrepo = ostree::Repo::new_for_path(src_repo.as_std_path());
        srcrepo.create(ostree::RepoMode::BareUser, gio::Cancellable::NONE)?;

        let token = Token::generate();
        let tokens = TokenConfig {
            tokens: vec![token.clone()],
        };
        let state = AppState::new(Repo::open(&repo_path)?, tokens)?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(
            axum::serve(
                listener,
                server::router(state).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .into_future(),
        );

        let client = Client::new(&format!("http://{addr}/"), &token.token)?;
        Ok(Self {
            _tempdir: tempdir,
            repo_path,
            src_repo,
            srcdir,
            token: token.token,
            addr,
            client,
        })
    }

    /// Commit files into the client-side repository, advancing `branch`.
    fn write_src_commit(
        &self,
        branch: &str,
        parent: Option<&str>,
        files: &[(&str, &str)],
    ) -> Result<String> {
        let repo = ostree::Repo::new_for_path(self.src_repo.as_std_path());
        repo.open(gio::Cancellable::NONE)?;
        commit_files(&repo, branch, parent, files)
    }

    fn push_config(&self, branches: &[&str]) -> PushConfig {
        PushConfig {
            address: format!("http://{}/", self.addr),
            repo: self.src_repo.clone(),
            token: self.token.clone(),
            branches: branches.iter().map(ToString::to_string).collect(),
            prune: false,
        }
    }

    /// Fabricate a client-side object file whose name checksum is the SHA-256
    /// of its content, as in a real store.
    fn object(&self, suffix: &str, content: &[u8]) -> Result<(ObjectName, ObjectSource)> {
        let digest = sha256_hex(content);
        let name = ObjectName::parse(&format!("{digest}.{suffix}"))?;
        let path = self.srcdir.join(name.as_str());
        std::fs::write(&path, content)?;
        Ok((
            name,
            ObjectSource {
                path,
                checksum: digest,
                size: content.len() as u64,
            },
        ))
    }

    fn live_path(&self, name: &ObjectName) -> Utf8PathBuf {
        name.path_in(&self.repo_path.join("objects"))
    }

    fn staged_path(&self, name: &ObjectName) -> Utf8PathBuf {
        name.path_in(&self.repo_path.join(STAGING_SUBDIR))
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

fn refs_for(branch: &str, server: &str, client: &str) -> BTreeMap<String, RevisionPair> {
    let mut m = BTreeMap::new();
    m.insert(
        branch.to_string(),
        RevisionPair {
            server: server.to_string(),
            client: client.to_string(),
        },
    );
    m
}

/// A fresh branch: every object uploaded, refs advance, objects land live.
#[tokio::test]
async fn test_publish_fresh_branch() -> Result<()> {
    let fx = Fixture::new().await?;

    let info = fx.client.info().await?;
    assert_eq!(info.mode, "bare");
    assert!(info.revs.is_empty());

    let commit = fx.object("commit", b"commit object")?;
    let dirtree = fx.object("dirtree", b"dirtree object")?;
    let dirmeta = fx.object("dirmeta", b"dirmeta object")?;
    let f1 = fx.object("file", b"first file")?;
    let f2 = fx.object("file", b"second file")?;
    let objects = [&commit, &dirtree, &dirmeta, &f1, &f2];
    let rev = commit.0.checksum().to_string();

    let id = fx
        .client
        .create_queue(
            &refs_for("stable", "", &rev),
            objects.iter().map(|o| o.0.clone()).collect(),
        )
        .await?;

    let missing = fx.client.missing_objects(&id).await?;
    assert_eq!(
        missing,
        objects.iter().map(|o| o.0.clone()).collect::<Vec<_>>()
    );

    let batch: Vec<(&ObjectName, &ObjectSource)> =
        objects.iter().map(|o| (&o.0, &o.1)).collect();
    fx.client.upload(&id, &batch).await?;

    // Everything staged, nothing missing, nothing live yet
    assert!(fx.client.missing_objects(&id).await?.is_empty());
    let info = fx.client.info().await?;
    assert!(info.revs.is_empty());

    fx.client.done(&id).await?;

    let info = fx.client.info().await?;
    assert_eq!(info.revs.get("stable"), Some(&rev));
    for (name, source) in objects {
        let live = fx.live_path(name);
        let content = std::fs::read(&live).with_context(|| format!("Reading {live}"))?;
        assert_eq!(sha256_hex(&content), source.checksum);
    }

    // The entry is gone
    assert_err_contains(fx.client.missing_objects(&id).await, "404");
    Ok(())
}

/// A second publish of a busy branch is refused.
#[tokio::test]
async fn test_branch_conflict() -> Result<()> {
    let fx = Fixture::new().await?;
    let (name, _) = fx.object("commit", b"conflicted commit")?;
    let rev = name.checksum().to_string();

    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), vec![name.clone()])
        .await?;
    let r = fx
        .client
        .create_queue(&refs_for("stable", "", &"7".repeat(64)), vec![])
        .await;
    assert_err_contains(r, r#"branch "stable" is already being updated"#);

    // Another branch is admitted concurrently
    let other = fx
        .client
        .create_queue(&refs_for("testing", "", &"8".repeat(64)), vec![])
        .await?;
    assert_ne!(id, other);
    Ok(())
}

/// A corrupted upload is rejected, the staged file is removed, and the
/// object can be re-uploaded.
#[tokio::test]
async fn test_bad_checksum_then_retry() -> Result<()> {
    let fx = Fixture::new().await?;
    let (name, source) = fx.object("commit", b"good content")?;
    let rev = name.checksum().to_string();

    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), vec![name.clone()])
        .await?;

    // Tamper with the on-disk bytes after the checksum was computed,
    // keeping the length so only the digest changes
    std::fs::write(&source.path, b"evil content")?;
    let r = fx.client.upload(&id, &[(&name, &source)]).await;
    assert_err_contains(r, "bad checksum");
    assert!(!fx.staged_path(&name).exists());

    // The server still wants the object; an honest retry succeeds
    assert_eq!(fx.client.missing_objects(&id).await?, vec![name.clone()]);
    std::fs::write(&source.path, b"good content")?;
    fx.client.upload(&id, &[(&name, &source)]).await?;
    fx.client.done(&id).await?;

    let info = fx.client.info().await?;
    assert_eq!(info.revs.get("stable"), Some(&rev));
    Ok(())
}

/// Aborting mid-upload leaves refs untouched; a later publish of the same
/// branch succeeds and reuses what was already staged.
#[tokio::test]
async fn test_abort_and_republish() -> Result<()> {
    let fx = Fixture::new().await?;
    let a = fx.object("commit", b"abort commit")?;
    let b = fx.object("file", b"abort file")?;
    let rev = a.0.checksum().to_string();
    let names = vec![a.0.clone(), b.0.clone()];

    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), names.clone())
        .await?;
    fx.client.upload(&id, &[(&a.0, &a.1)]).await?;
    fx.client.delete_queue(&id).await?;

    assert!(fx.client.info().await?.revs.is_empty());
    assert_err_contains(fx.client.missing_objects(&id).await, "404");
    // Deleting again is NotFound, per the entry lifecycle
    assert_err_contains(fx.client.delete_queue(&id).await, "404");

    // Staged files survive the abort, so the retry only needs the rest
    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), names)
        .await?;
    assert_eq!(fx.client.missing_objects(&id).await?, vec![b.0.clone()]);
    fx.client.upload(&id, &[(&b.0, &b.1)]).await?;
    fx.client.done(&id).await?;
    assert_eq!(fx.client.info().await?.revs.get("stable"), Some(&rev));
    Ok(())
}

/// An incremental publish of real commit history: the first commit goes up
/// through the full pusher, then a child commit is published and the server
/// asks for exactly the delta even though the client submitted the whole
/// closure.
#[tokio::test]
async fn test_incremental_publish() -> Result<()> {
    let fx = Fixture::new().await?;

    let c1 = fx.write_src_commit("stable", None, &[("f1", "first"), ("f2", "second")])?;
    push::run(fx.push_config(&["stable"])).await?;
    assert_eq!(fx.client.info().await?.revs.get("stable"), Some(&c1));

    // A child commit keeping f1/f2 and adding f3
    let c2 = fx.write_src_commit(
        "stable",
        Some(&c1),
        &[("f1", "first"), ("f2", "second"), ("f3", "third")],
    )?;

    let adapter = Repo::open(&fx.src_repo)?;
    assert_eq!(adapter.resolve_rev("stable")?, c2);
    assert_eq!(adapter.parent_of(&c2)?, Some(c1.clone()));
    assert_eq!(adapter.parent_of(&c1)?, None);

    let c1_closure: BTreeSet<ObjectName> = adapter.traverse_commit(&c1, 0)?.into_iter().collect();
    let c2_closure: BTreeSet<ObjectName> = adapter.traverse_commit(&c2, 0)?.into_iter().collect();
    assert!(c1_closure.contains(&ObjectName::parse(&format!("{c1}.commit"))?));
    // The dirmeta and the unchanged content objects are shared, so the delta
    // is the new commit, the new root dirtree and the new content object
    let delta: BTreeSet<ObjectName> = c2_closure.difference(&c1_closure).cloned().collect();
    assert!(delta.contains(&ObjectName::parse(&format!("{c2}.commit"))?));
    assert_eq!(delta.len(), 3);

    // Submit the whole closure; the server filters it down to the delta
    let union: Vec<ObjectName> = c1_closure.union(&c2_closure).cloned().collect();
    let id = fx
        .client
        .create_queue(&refs_for("stable", &c1, &c2), union)
        .await?;
    let mut missing = fx.client.missing_objects(&id).await?;
    missing.sort();
    let expected: Vec<ObjectName> = delta.iter().cloned().collect();
    assert_eq!(missing, expected);

    let mut sources = Vec::new();
    for name in &missing {
        let path = adapter.object_path(name);
        let size = std::fs::metadata(&path)?.len();
        let checksum = file_sha256(&path)?;
        sources.push((
            name.clone(),
            ObjectSource {
                path,
                checksum,
                size,
            },
        ));
    }
    let batch: Vec<(&ObjectName, &ObjectSource)> = sources.iter().map(|(n, s)| (n, s)).collect();
    fx.client.upload(&id, &batch).await?;
    fx.client.done(&id).await?;

    let info = fx.client.info().await?;
    assert_eq!(info.revs.get("stable"), Some(&c2));
    // The pusher now agrees the server is current
    assert!(build_plan(&adapter, &["stable".to_string()], &info.revs)?.is_none());
    Ok(())
}

/// A local branch whose history does not contain the server's commit is
/// rejected on the client side, before any transaction is opened.
#[tokio::test]
async fn test_non_descendant_rejected() -> Result<()> {
    let fx = Fixture::new().await?;
    let c1 = fx.write_src_commit("stable", None, &[("f1", "one")])?;
    push::run(fx.push_config(&["stable"])).await?;
    assert_eq!(fx.client.info().await?.revs.get("stable"), Some(&c1));

    // Rewrite local history: a root commit unrelated to what the server has
    let c2 = fx.write_src_commit("stable", None, &[("f1", "rewritten")])?;
    assert_ne!(c1, c2);
    let err = push::run(fx.push_config(&["stable"])).await.unwrap_err();
    assert!(format!("{err:#}").contains("does not descend"));

    // The push failed before opening a transaction, so the branch is not
    // held by any queue entry and the server still serves the old commit
    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &"a".repeat(64)), vec![])
        .await?;
    fx.client.delete_queue(&id).await?;
    assert_eq!(fx.client.info().await?.revs.get("stable"), Some(&c1));
    Ok(())
}

/// Finalizing an incomplete closure fails without touching refs and leaves
/// the entry stuck until it is deleted.
#[tokio::test]
async fn test_done_with_missing_objects() -> Result<()> {
    let fx = Fixture::new().await?;
    let (name, source) = fx.object("commit", b"never uploaded")?;
    let rev = name.checksum().to_string();

    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), vec![name.clone()])
        .await?;
    assert_err_contains(fx.client.done(&id).await, "was never staged");
    assert!(fx.client.info().await?.revs.is_empty());

    // The entry is now finalizing: no more uploads, no second finalize
    assert_err_contains(
        fx.client.upload(&id, &[(&name, &source)]).await,
        "finalized",
    );
    assert_err_contains(fx.client.done(&id).await, "already finalizing");

    // Operator intervention: drop the entry
    fx.client.delete_queue(&id).await?;
    Ok(())
}

/// Requests without a valid token are rejected; `/ping` is public.
#[tokio::test]
async fn test_auth() -> Result<()> {
    let fx = Fixture::new().await?;
    let http = reqwest::Client::new();

    for token in ["", "wrong"] {
        let mut req = http.get(fx.url("/api/v1/info"));
        if !token.is_empty() {
            req = req.header("Authorization", format!("BEARER {token}"));
        }
        let resp = req.send().await?;
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    let resp = http.get(fx.url("/ping")).send().await?;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await?, "{}");
    Ok(())
}

/// Objects must match the repository mode, and unknown multipart fields are
/// refused.
#[tokio::test]
async fn test_request_validation() -> Result<()> {
    let fx = Fixture::new().await?;

    // filez objects are only valid for archive repositories
    let (name, _) = fx.object("filez", b"compressed")?;
    let r = fx
        .client
        .create_queue(&refs_for("stable", "", &"9".repeat(64)), vec![name])
        .await;
    assert_err_contains(r, "does not match the repository mode");

    // Identical client and server revisions make no sense
    let r = fx
        .client
        .create_queue(&refs_for("stable", &"9".repeat(64), &"9".repeat(64)), vec![])
        .await;
    assert_err_contains(r, "already at");

    // Unknown multipart field
    let (name, _) = fx.object("commit", b"field test")?;
    let rev = name.checksum().to_string();
    let id = fx
        .client
        .create_queue(&refs_for("stable", "", &rev), vec![name])
        .await?;
    let form = reqwest::multipart::Form::new().text("bogus", "x");
    let resp = reqwest::Client::new()
        .put(fx.url(&format!("/api/v1/queue/{id}")))
        .header("Authorization", format!("BEARER {}", fx.token))
        .multipart(form)
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    assert!(resp.text().await?.contains("unsupported form field"));
    Ok(())
}
