//! Pull coordination: fetching commits and their transitive object
//! closure from a remote (or sideload) into a local store.
//!
//! Transport and signature verification live behind [`RepoBackend`];
//! the engine only sees one suspension point per pull.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::{hash, MessageDigest};
use tokio_util::sync::CancellationToken;

use super::{Commit, ObjectId, ObjectKind, ObjectStore, StaticDelta};
use crate::utils::check_cancel;
use crate::Error;

/// Abstraction over one remote repository: transport plus trust.
pub trait RepoBackend: std::fmt::Debug {
    /// Fetch the raw summary blob and its detached signature.
    fn fetch_summary(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)>;

    /// Fetch one object's raw bytes; `None` when the remote does not
    /// have it.
    fn fetch_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>>;

    /// Fetch a static delta, `None` when the remote does not publish
    /// one for this pair.
    fn fetch_delta(&self, from: Option<&ObjectId>, to: &ObjectId) -> Result<Option<StaticDelta>>;

    /// Verify a detached signature over a payload against this
    /// backend's trust anchors.
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Compute the detached signature for a payload under a key. This is
/// the stand-in trust scheme used by file-backed repositories; real
/// transports bring their own verifier.
pub fn sign_payload(key: &[u8], payload: &[u8]) -> Result<String> {
    let mut buf = Vec::with_capacity(key.len() + payload.len());
    buf.extend_from_slice(key);
    buf.extend_from_slice(payload);
    let d = hash(MessageDigest::sha256(), &buf).context("Signing payload")?;
    Ok(hex::encode(d))
}

/// A backend serving a repository laid out on the local filesystem
/// (`file://` remotes, sideload media, fixtures).
#[derive(Debug)]
pub struct FileBackend {
    store: ObjectStore,
    trusted_key: Option<Vec<u8>>,
}

impl FileBackend {
    /// Open a repository directory.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            store: ObjectStore::open(path)?,
            trusted_key: None,
        })
    }

    /// Attach the client-side trust anchor used by [`RepoBackend::verify`].
    pub fn with_trusted_key(mut self, key: &[u8]) -> Self {
        self.trusted_key = Some(key.to_vec());
        self
    }
}

impl RepoBackend for FileBackend {
    fn fetch_summary(&self) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let payload = match self.store.dir().read("summary") {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NetworkError("remote has no summary".into()).into())
            }
            Err(e) => return Err(e).context("Reading summary"),
        };
        let sig = match self.store.dir().read("summary.sig") {
            Ok(r) => Some(r),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("Reading summary.sig"),
        };
        Ok((payload, sig))
    }

    fn fetch_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.store.read_object_optional(kind, id)
    }

    fn fetch_delta(&self, from: Option<&ObjectId>, to: &ObjectId) -> Result<Option<StaticDelta>> {
        StaticDelta::load_from(&self.store, from, to)
    }

    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let Some(key) = &self.trusted_key else {
            return Ok(false);
        };
        let expected = sign_payload(key, payload)?;
        Ok(expected.as_bytes() == signature)
    }
}

const NETWORK_RETRIES: u32 = 3;

/// Run a backend call, retrying transient network failures with
/// exponential backoff. Everything else escalates immediately.
pub(crate) fn with_retries<T>(what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = Duration::from_millis(100);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) => {
                attempt += 1;
                let transient = matches!(e.downcast_ref::<Error>(), Some(Error::NetworkError(_)));
                if !transient || attempt >= NETWORK_RETRIES {
                    return Err(e);
                }
                tracing::debug!("{what}: transient failure (attempt {attempt}): {e:#}");
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
    }
}

/// Options for one ref pull.
#[derive(Debug, Default, Clone)]
pub struct PullOptions {
    /// Restrict the fetched file subtree; non-empty leaves the commit
    /// in the partial state.
    pub subpaths: Vec<String>,
    /// Never use static deltas, even when the remote publishes one.
    pub disable_static_deltas: bool,
    /// Re-hash objects already present and refetch any that fail;
    /// reinstalls set this so a damaged closure heals.
    pub verify_existing: bool,
}

/// Progress snapshot streamed to the frontend during a pull.
#[derive(Debug, Default, Clone)]
pub struct PullProgress {
    /// Objects actually transferred so far.
    pub fetched_objects: u64,
    /// Objects discovered so far (grows as trees are opened).
    pub total_objects: u64,
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
}

fn trim_path(p: &str) -> &str {
    p.trim_matches('/')
}

pub(crate) fn subpath_selects_dir(subpaths: &[String], dir: &str) -> bool {
    if subpaths.is_empty() {
        return true;
    }
    let dir = trim_path(dir);
    if dir.is_empty() {
        return true;
    }
    subpaths.iter().any(|s| {
        let s = trim_path(s);
        s == dir || s.starts_with(&format!("{dir}/")) || dir.starts_with(&format!("{s}/"))
    })
}

pub(crate) fn subpath_selects_file(subpaths: &[String], dir: &str) -> bool {
    if subpaths.is_empty() {
        return true;
    }
    let dir = trim_path(dir);
    subpaths.iter().any(|s| {
        let s = trim_path(s);
        s == dir || dir.starts_with(&format!("{s}/"))
    })
}

/// Pull one ref at a pinned commit into the store and update the
/// remote ref entry. Sideload stores are consulted before the backend
/// for every object.
#[context("Pulling {refname}")]
#[allow(clippy::too_many_arguments)]
pub fn pull_ref(
    store: &ObjectStore,
    remote: &str,
    collection: Option<&str>,
    backend: &dyn RepoBackend,
    sideloads: &[&ObjectStore],
    refname: &str,
    target: &ObjectId,
    opts: &PullOptions,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(&PullProgress),
) -> Result<()> {
    check_cancel(cancel)?;
    let mut prog = PullProgress::default();

    // Fast path: the commit closure is already complete locally.
    if !opts.verify_existing
        && store.has_object(ObjectKind::Commit, target)?
        && !store.commit_is_partial(target)?
    {
        store.set_ref(Some(remote), refname, Some(target))?;
        progress(&prog);
        return Ok(());
    }

    let mut sideload_used = false;
    let mut fetch = |kind: ObjectKind, id: &ObjectId| -> Result<Option<Vec<u8>>> {
        for sl in sideloads {
            if let Some(d) = sl.read_object_optional(kind, id)? {
                sideload_used = true;
                return Ok(Some(d));
            }
        }
        with_retries("fetching object", || backend.fetch_object(kind, id))
    };

    // Prefer a static delta for full pulls when one is published.
    // Verification walks object by object, so deltas are out then.
    if !opts.disable_static_deltas && !opts.verify_existing && opts.subpaths.is_empty() {
        let from = store
            .resolve_ref(Some(remote), refname)?
            .filter(|f| f != target)
            .filter(|f| store.has_object(ObjectKind::Commit, f).unwrap_or(false));
        let delta = with_retries("fetching delta", || {
            backend.fetch_delta(from.as_ref(), target)
        })?;
        if let Some(delta) = delta {
            check_cancel(cancel)?;
            let n = delta.apply(store)?;
            store.set_commit_partial(target, false)?;
            store.set_ref(Some(remote), refname, Some(target))?;
            prog.fetched_objects = n;
            prog.total_objects = n;
            progress(&prog);
            tracing::debug!("pulled {refname} via static delta ({n} objects)");
            return Ok(());
        }
    }

    // Per-object walk. The partial marker guards against a torn pull
    // being mistaken for a complete commit.
    if opts.verify_existing
        && store.has_object(ObjectKind::Commit, target)?
        && store.fsck_object(ObjectKind::Commit, target)? != super::ObjectStatus::Ok
    {
        store.delete_object(ObjectKind::Commit, target)?;
    }
    let commit_data = match store.read_object_optional(ObjectKind::Commit, target)? {
        Some(d) => d,
        None => {
            let d = fetch(ObjectKind::Commit, target)?.ok_or_else(|| {
                Error::NetworkError(format!("remote {remote} has no commit {target}"))
            })?;
            store.write_object_checked(ObjectKind::Commit, target, &d)?;
            prog.fetched_objects += 1;
            prog.bytes_transferred += d.len() as u64;
            d
        }
    };
    store.set_commit_partial(target, true)?;
    let commit = Commit::from_bytes(&commit_data)?;

    let mut queue: VecDeque<(ObjectKind, ObjectId, String)> = VecDeque::new();
    queue.push_back((ObjectKind::DirMeta, commit.dirmeta.clone(), String::new()));
    queue.push_back((ObjectKind::DirTree, commit.tree.clone(), String::new()));
    prog.total_objects = queue.len() as u64 + 1;

    while let Some((kind, id, path)) = queue.pop_front() {
        check_cancel(cancel)?;
        let mut present = store.has_object(kind, &id)?;
        if present && opts.verify_existing && store.fsck_object(kind, &id)? != super::ObjectStatus::Ok
        {
            store.delete_object(kind, &id)?;
            present = false;
        }
        if !present {
            let data = fetch(kind, &id)?.ok_or_else(|| {
                Error::NetworkError(format!("remote {remote} is missing {kind} object {id}"))
            })?;
            store.write_object_checked(kind, &id, &data)?;
            prog.fetched_objects += 1;
            prog.bytes_transferred += data.len() as u64;
            progress(&prog);
        }
        if kind == ObjectKind::DirTree {
            let tree = store.load_dirtree(&id)?;
            for d in &tree.dirs {
                let child = if path.is_empty() {
                    d.name.clone()
                } else {
                    format!("{path}/{}", d.name)
                };
                if subpath_selects_dir(&opts.subpaths, &child) {
                    queue.push_back((ObjectKind::DirMeta, d.meta.clone(), child.clone()));
                    queue.push_back((ObjectKind::DirTree, d.tree.clone(), child));
                    prog.total_objects += 2;
                }
            }
            if subpath_selects_file(&opts.subpaths, &path) {
                for f in &tree.files {
                    queue.push_back((ObjectKind::File, f.object.clone(), path.clone()));
                    prog.total_objects += 1;
                }
            }
        }
    }

    if opts.subpaths.is_empty() {
        store.set_commit_partial(target, false)?;
    }
    store.set_ref(Some(remote), refname, Some(target))?;
    if sideload_used {
        if let Some(collection) = collection {
            store.set_mirror_ref(collection, refname, Some(target))?;
        }
    }
    progress(&prog);
    tracing::debug!(
        "pulled {refname}: {} objects, {} bytes",
        prog.fetched_objects,
        prog.bytes_transferred
    );
    Ok(())
}
