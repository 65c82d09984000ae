//! Content-addressed object store.
//!
//! On-disk layout:
//!
//! ```text
//! objects/<2-hex>/<62-hex>.<ext>   ext in {commit, dirtree, dirmeta, filez, file}
//! refs/heads/<ref-name>
//! refs/remotes/<remote>/<ref-name>
//! refs/mirrors/<collection>/<ref-name>
//! state/<commit>.commitpartial
//! deltas/...
//! ```
//!
//! All mutation is tmp-file-plus-rename; callers serialize through the
//! owning installation's lock.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

mod delta;
mod object;
pub mod pull;
pub use delta::{DeltaEntry, StaticDelta};
pub use object::*;

const OBJECTS: &str = "objects";
const REFS_HEADS: &str = "refs/heads";
const REFS_REMOTES: &str = "refs/remotes";
const REFS_MIRRORS: &str = "refs/mirrors";
const STATE: &str = "state";
const DELTAS: &str = "deltas";

/// Statistics from a prune pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    /// Objects examined.
    pub total: u64,
    /// Objects deleted.
    pub pruned: u64,
    /// Bytes reclaimed.
    pub bytes_pruned: u64,
}

/// A content-addressed object store rooted at one directory.
#[derive(Debug)]
pub struct ObjectStore {
    path: Utf8PathBuf,
    dir: Dir,
}

impl ObjectStore {
    /// Open an existing store.
    #[context("Opening object store {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())?;
        Ok(Self {
            path: path.to_owned(),
            dir,
        })
    }

    /// Open, creating the directory skeleton if required.
    #[context("Initializing object store {path}")]
    pub fn ensure(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path.as_std_path())
            .with_context(|| format!("Creating {path}"))?;
        let r = Self::open(path)?;
        for d in [OBJECTS, REFS_HEADS, REFS_REMOTES, REFS_MIRRORS, STATE, DELTAS] {
            r.dir.create_dir_all(d)?;
        }
        Ok(r)
    }

    /// The store root path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Capability handle on the store root.
    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    fn object_relpath(kind: ObjectKind, id: &ObjectId) -> Utf8PathBuf {
        let (pfx, rest) = id.fanout();
        format!("{OBJECTS}/{pfx}/{rest}.{}", kind.ext()).into()
    }

    /// Whether the object is present.
    pub fn has_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        Ok(self.dir.try_exists(Self::object_relpath(kind, id))?)
    }

    /// Read an object's raw bytes.
    pub fn read_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Vec<u8>> {
        self.read_object_optional(kind, id)?
            .ok_or_else(|| anyhow!("Missing {kind} object {id}"))
    }

    /// Read an object's raw bytes, `None` when absent.
    pub fn read_object_optional(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        let p = Self::object_relpath(kind, id);
        match self.dir.read(&p) {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {p}")),
        }
    }

    /// Add an object, returning its computed id. Idempotent.
    #[context("Writing {kind} object")]
    pub fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::digest(data)?;
        self.write_object_at(kind, &id, data)?;
        Ok(id)
    }

    /// Add an object that must hash to `expected`; rejects corrupt
    /// transfers before they reach the store.
    pub fn write_object_checked(
        &self,
        kind: ObjectKind,
        expected: &ObjectId,
        data: &[u8],
    ) -> Result<()> {
        let actual = ObjectId::digest(data)?;
        if actual != *expected {
            return Err(anyhow!(
                "Checksum mismatch for {kind} object: expected {expected}, got {actual}"
            ));
        }
        self.write_object_at(kind, expected, data)
    }

    fn write_object_at(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> Result<()> {
        let p = Self::object_relpath(kind, id);
        if self.dir.try_exists(&p)? {
            return Ok(());
        }
        let (pfx, _) = id.fanout();
        self.dir.create_dir_all(format!("{OBJECTS}/{pfx}"))?;
        self.dir
            .atomic_write(&p, data)
            .with_context(|| format!("Writing {p}"))?;
        Ok(())
    }

    /// Remove an object. Idempotent; also clears any partial marker.
    pub fn delete_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<()> {
        let p = Self::object_relpath(kind, id);
        match self.dir.remove_file(&p) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
        }
        if kind == ObjectKind::Commit {
            self.set_commit_partial(id, false)?;
        }
        Ok(())
    }

    /// Size in bytes of a stored object.
    pub fn object_size(&self, kind: ObjectKind, id: &ObjectId) -> Result<u64> {
        Ok(self.dir.metadata(Self::object_relpath(kind, id))?.len())
    }

    // Commit helpers

    /// Write a commit object, optionally flagging it partial.
    pub fn write_commit(&self, commit: &Commit, partial: bool) -> Result<ObjectId> {
        let id = self.write_object(ObjectKind::Commit, &commit.to_bytes()?)?;
        self.set_commit_partial(&id, partial)?;
        Ok(id)
    }

    /// Load a commit and its mutable state.
    pub fn load_commit(&self, id: &ObjectId) -> Result<(Commit, CommitState)> {
        let data = self.read_object(ObjectKind::Commit, id)?;
        let commit = Commit::from_bytes(&data)?;
        let state = CommitState {
            partial: self.commit_is_partial(id)?,
        };
        Ok((commit, state))
    }

    /// Load a commit, `None` when the object is absent.
    pub fn load_commit_optional(&self, id: &ObjectId) -> Result<Option<(Commit, CommitState)>> {
        match self.read_object_optional(ObjectKind::Commit, id)? {
            Some(data) => {
                let commit = Commit::from_bytes(&data)?;
                let state = CommitState {
                    partial: self.commit_is_partial(id)?,
                };
                Ok(Some((commit, state)))
            }
            None => Ok(None),
        }
    }

    /// Load a dirtree object.
    pub fn load_dirtree(&self, id: &ObjectId) -> Result<DirTree> {
        DirTree::from_bytes(&self.read_object(ObjectKind::DirTree, id)?)
    }

    /// Load a dirmeta object.
    pub fn load_dirmeta(&self, id: &ObjectId) -> Result<DirMeta> {
        DirMeta::from_bytes(&self.read_object(ObjectKind::DirMeta, id)?)
    }

    fn partial_marker(id: &ObjectId) -> Utf8PathBuf {
        format!("{STATE}/{id}.commitpartial").into()
    }

    /// Whether the commit is flagged partial.
    pub fn commit_is_partial(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.dir.try_exists(Self::partial_marker(id))?)
    }

    /// Set or clear the partial flag on a commit.
    pub fn set_commit_partial(&self, id: &ObjectId, partial: bool) -> Result<()> {
        let p = Self::partial_marker(id);
        if partial {
            self.dir.create_dir_all(STATE)?;
            self.dir.atomic_write(&p, b"")?;
        } else {
            match self.dir.remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
            }
        }
        Ok(())
    }

    // Refs

    fn ref_relpath(remote: Option<&str>, refname: &str) -> Utf8PathBuf {
        match remote {
            Some(r) => format!("{REFS_REMOTES}/{r}/{refname}").into(),
            None => format!("{REFS_HEADS}/{refname}").into(),
        }
    }

    /// Atomically point `(remote, ref)` at a commit; `None` deletes the
    /// ref entry.
    #[context("Updating ref {refname}")]
    pub fn set_ref(
        &self,
        remote: Option<&str>,
        refname: &str,
        commit: Option<&ObjectId>,
    ) -> Result<()> {
        let p = Self::ref_relpath(remote, refname);
        match commit {
            Some(id) => {
                if let Some(parent) = p.parent() {
                    self.dir.create_dir_all(parent)?;
                }
                self.dir.atomic_write(&p, format!("{id}\n").as_bytes())?;
            }
            None => match self.dir.remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
            },
        }
        Ok(())
    }

    /// Resolve `(remote, ref)` to a commit id, `None` when unset.
    pub fn resolve_ref(&self, remote: Option<&str>, refname: &str) -> Result<Option<ObjectId>> {
        let p = Self::ref_relpath(remote, refname);
        match self.dir.read_to_string(&p) {
            Ok(s) => Ok(Some(ObjectId::parse(s.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {p}")),
        }
    }

    fn collect_refs(
        dir: &Dir,
        prefix: &mut Vec<String>,
        out: &mut BTreeMap<String, ObjectId>,
    ) -> Result<()> {
        for ent in dir.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| anyhow!("Invalid ref path component {name:?}"))?
                .to_string();
            if ent.file_type()?.is_dir() {
                prefix.push(name);
                Self::collect_refs(&ent.open_dir()?, prefix, out)?;
                prefix.pop();
            } else {
                let mut full = prefix.join("/");
                if !full.is_empty() {
                    full.push('/');
                }
                full.push_str(&name);
                let data = dir.read_to_string(&name)?;
                out.insert(full, ObjectId::parse(data.trim())?);
            }
        }
        Ok(())
    }

    /// Enumerate refs. Local refs are keyed by bare ref name, remote
    /// refs by `remote:refname`. An optional prefix filters the keys.
    #[context("Listing refs")]
    pub fn list_refs(&self, prefix: Option<&str>) -> Result<BTreeMap<String, ObjectId>> {
        let mut out = BTreeMap::new();
        if self.dir.try_exists(REFS_HEADS)? {
            let mut acc = BTreeMap::new();
            Self::collect_refs(&self.dir.open_dir(REFS_HEADS)?, &mut Vec::new(), &mut acc)?;
            out.extend(acc);
        }
        if self.dir.try_exists(REFS_REMOTES)? {
            for ent in self.dir.open_dir(REFS_REMOTES)?.entries()? {
                let ent = ent?;
                if !ent.file_type()?.is_dir() {
                    continue;
                }
                let remote = ent.file_name();
                let remote = remote
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid remote name {remote:?}"))?
                    .to_string();
                let mut acc = BTreeMap::new();
                Self::collect_refs(&ent.open_dir()?, &mut Vec::new(), &mut acc)?;
                for (r, id) in acc {
                    out.insert(format!("{remote}:{r}"), id);
                }
            }
        }
        if let Some(prefix) = prefix {
            out.retain(|k, _| k.starts_with(prefix));
        }
        Ok(out)
    }

    /// Point a mirror ref (sideload bookkeeping) at a commit.
    pub fn set_mirror_ref(
        &self,
        collection: &str,
        refname: &str,
        commit: Option<&ObjectId>,
    ) -> Result<()> {
        let p: Utf8PathBuf = format!("{REFS_MIRRORS}/{collection}/{refname}").into();
        match commit {
            Some(id) => {
                if let Some(parent) = p.parent() {
                    self.dir.create_dir_all(parent)?;
                }
                self.dir.atomic_write(&p, format!("{id}\n").as_bytes())?;
            }
            None => match self.dir.remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
            },
        }
        Ok(())
    }

    /// Enumerate mirror refs as `(collection, refname) -> commit`.
    pub fn list_mirror_refs(&self) -> Result<BTreeMap<(String, String), ObjectId>> {
        let mut out = BTreeMap::new();
        if !self.dir.try_exists(REFS_MIRRORS)? {
            return Ok(out);
        }
        for ent in self.dir.open_dir(REFS_MIRRORS)?.entries()? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let collection = ent.file_name();
            let collection = collection
                .to_str()
                .ok_or_else(|| anyhow!("Invalid collection {collection:?}"))?
                .to_string();
            let mut acc = BTreeMap::new();
            Self::collect_refs(&ent.open_dir()?, &mut Vec::new(), &mut acc)?;
            for (r, id) in acc {
                out.insert((collection.clone(), r), id);
            }
        }
        Ok(out)
    }

    // Graph traversal

    /// Visit every `(kind, id)` reachable from a commit, the commit
    /// itself included. Recursion only descends into objects that are
    /// actually present, so partial commits walk cleanly. The visitor
    /// returns `false` to short-circuit.
    pub fn walk(
        &self,
        root: &ObjectId,
        visitor: &mut dyn FnMut(ObjectKind, &ObjectId) -> Result<bool>,
    ) -> Result<()> {
        let mut seen: HashSet<(ObjectKind, ObjectId)> = HashSet::new();
        let mut stack = vec![(ObjectKind::Commit, root.clone())];
        while let Some((kind, id)) = stack.pop() {
            if !seen.insert((kind, id.clone())) {
                continue;
            }
            if !visitor(kind, &id)? {
                return Ok(());
            }
            match kind {
                ObjectKind::Commit => {
                    if let Some(data) = self.read_object_optional(kind, &id)? {
                        if let Ok(commit) = Commit::from_bytes(&data) {
                            stack.push((ObjectKind::DirMeta, commit.dirmeta));
                            stack.push((ObjectKind::DirTree, commit.tree));
                        }
                    }
                }
                ObjectKind::DirTree => {
                    if let Some(data) = self.read_object_optional(kind, &id)? {
                        if let Ok(tree) = DirTree::from_bytes(&data) {
                            for f in tree.files {
                                stack.push((ObjectKind::File, f.object));
                            }
                            for d in tree.dirs {
                                stack.push((ObjectKind::DirTree, d.tree));
                                stack.push((ObjectKind::DirMeta, d.meta));
                            }
                        }
                    }
                }
                ObjectKind::DirMeta | ObjectKind::File => {}
            }
        }
        Ok(())
    }

    /// Re-hash one object and compare to its id.
    pub fn fsck_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<ObjectStatus> {
        let Some(data) = self.read_object_optional(kind, id)? else {
            return Ok(ObjectStatus::Missing);
        };
        if ObjectId::digest(&data)? != *id {
            return Ok(ObjectStatus::Invalid);
        }
        // Metadata objects must additionally parse
        let parses = match kind {
            ObjectKind::Commit => Commit::from_bytes(&data).is_ok(),
            ObjectKind::DirTree => DirTree::from_bytes(&data).is_ok(),
            ObjectKind::DirMeta => DirMeta::from_bytes(&data).is_ok(),
            ObjectKind::File => true,
        };
        Ok(if parses {
            ObjectStatus::Ok
        } else {
            ObjectStatus::Invalid
        })
    }

    /// Enumerate all stored objects.
    pub fn list_objects(&self) -> Result<Vec<(ObjectKind, ObjectId)>> {
        let mut out = Vec::new();
        let objects = self.dir.open_dir(OBJECTS)?;
        for ent in objects.entries()? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let pfx = ent.file_name();
            let Some(pfx) = pfx.to_str() else { continue };
            if pfx.len() != 2 {
                continue;
            }
            let sub = ent.open_dir()?;
            for child in sub.entries()? {
                let child = child?;
                let name = child.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some((rest, ext)) = name.split_once('.') else {
                    continue;
                };
                let Some(kind) = ObjectKind::from_ext(ext) else {
                    continue;
                };
                if let Ok(id) = ObjectId::parse(&format!("{pfx}{rest}")) {
                    out.push((kind, id));
                }
            }
        }
        Ok(out)
    }

    /// Mark-and-sweep: delete every object unreachable from any ref.
    /// `depth` controls how many parent commits of each ref are also
    /// kept (0 keeps only the referenced commits). Never touches ref
    /// entries; a healthy store prunes to nothing.
    #[context("Pruning object store")]
    pub fn prune(&self, depth: u32) -> Result<PruneStats> {
        let mut roots: Vec<ObjectId> = self.list_refs(None)?.into_values().collect();
        roots.extend(self.list_mirror_refs()?.into_values());

        let mut mark: HashSet<(ObjectKind, ObjectId)> = HashSet::new();
        for root in roots {
            // Follow the parent chain to the configured depth
            let mut chain = vec![root.clone()];
            let mut cur = root;
            for _ in 0..depth {
                match self.load_commit_optional(&cur)? {
                    Some((commit, _)) => match commit.parent {
                        Some(p) => {
                            chain.push(p.clone());
                            cur = p;
                        }
                        None => break,
                    },
                    None => break,
                }
            }
            for c in chain {
                self.walk(&c, &mut |kind, id| {
                    mark.insert((kind, id.clone()));
                    Ok(true)
                })?;
            }
        }

        let mut stats = PruneStats::default();
        for (kind, id) in self.list_objects()? {
            stats.total += 1;
            if !mark.contains(&(kind, id.clone())) {
                stats.bytes_pruned += self.object_size(kind, &id).unwrap_or(0);
                self.delete_object(kind, &id)?;
                stats.pruned += 1;
            }
        }
        tracing::debug!(
            "prune: {} of {} objects removed ({} bytes)",
            stats.pruned,
            stats.total,
            stats.bytes_pruned
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scratch() -> (tempfile::TempDir, ObjectStore) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("repo");
        let store = ObjectStore::ensure(&path).unwrap();
        (td, store)
    }

    fn commit_tree(store: &ObjectStore, files: &[(&str, &[u8])]) -> ObjectId {
        let meta = store
            .write_object(ObjectKind::DirMeta, &DirMeta::default_dir().to_bytes().unwrap())
            .unwrap();
        let mut tree = DirTree::default();
        for (name, data) in files {
            let obj = store.write_object(ObjectKind::File, data).unwrap();
            tree.files.push(FileEntry {
                name: name.to_string(),
                object: obj,
                mode: 0o644,
            });
        }
        tree.sort();
        let tree_id = store
            .write_object(ObjectKind::DirTree, &tree.to_bytes().unwrap())
            .unwrap();
        let commit = Commit {
            tree: tree_id,
            dirmeta: meta,
            parent: None,
            timestamp: 1,
            subject: "test".into(),
            body: String::new(),
            metadata: BTreeMap::new(),
        };
        store.write_commit(&commit, false).unwrap()
    }

    #[test]
    fn test_object_roundtrip() {
        let (_td, store) = scratch();
        let id = store.write_object(ObjectKind::File, b"content").unwrap();
        assert!(store.has_object(ObjectKind::File, &id).unwrap());
        assert_eq!(store.read_object(ObjectKind::File, &id).unwrap(), b"content");
        assert_eq!(store.fsck_object(ObjectKind::File, &id).unwrap(), ObjectStatus::Ok);
        store.delete_object(ObjectKind::File, &id).unwrap();
        // Idempotent
        store.delete_object(ObjectKind::File, &id).unwrap();
        assert_eq!(
            store.fsck_object(ObjectKind::File, &id).unwrap(),
            ObjectStatus::Missing
        );
    }

    #[test]
    fn test_refs() {
        let (_td, store) = scratch();
        let c = commit_tree(&store, &[("data", b"x")]);
        store.set_ref(Some("origin"), "app/org.a.B/x86_64/stable", Some(&c)).unwrap();
        store.set_ref(None, "app/org.a.B/x86_64/stable", Some(&c)).unwrap();
        assert_eq!(
            store.resolve_ref(Some("origin"), "app/org.a.B/x86_64/stable").unwrap(),
            Some(c.clone())
        );
        let refs = store.list_refs(None).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains_key("origin:app/org.a.B/x86_64/stable"));
        assert!(refs.contains_key("app/org.a.B/x86_64/stable"));
        let filtered = store.list_refs(Some("origin:")).unwrap();
        assert_eq!(filtered.len(), 1);
        store.set_ref(None, "app/org.a.B/x86_64/stable", None).unwrap();
        // Deleting twice is fine
        store.set_ref(None, "app/org.a.B/x86_64/stable", None).unwrap();
        assert_eq!(store.list_refs(None).unwrap().len(), 1);
    }

    #[test]
    fn test_walk_and_prune() {
        let (_td, store) = scratch();
        let kept = commit_tree(&store, &[("a", b"aaa"), ("b", b"bbb")]);
        let doomed = commit_tree(&store, &[("c", b"ccc")]);
        store.set_ref(Some("origin"), "app/org.k.K/x86_64/stable", Some(&kept)).unwrap();

        let mut visited = Vec::new();
        store
            .walk(&kept, &mut |kind, id| {
                visited.push((kind, id.clone()));
                Ok(true)
            })
            .unwrap();
        // commit + tree + meta + 2 files
        assert_eq!(visited.len(), 5);

        let stats = store.prune(0).unwrap();
        assert!(stats.pruned >= 3); // doomed commit, its tree, its file
        assert!(store.has_object(ObjectKind::Commit, &kept).unwrap());
        assert!(!store.has_object(ObjectKind::Commit, &doomed).unwrap());

        // A healthy store prunes to nothing
        let stats = store.prune(0).unwrap();
        assert_eq!(stats.pruned, 0);
    }

    #[test]
    fn test_partial_marker() {
        let (_td, store) = scratch();
        let c = commit_tree(&store, &[("a", b"1")]);
        assert!(!store.commit_is_partial(&c).unwrap());
        store.set_commit_partial(&c, true).unwrap();
        let (_, state) = store.load_commit(&c).unwrap();
        assert!(state.partial);
        store.set_commit_partial(&c, false).unwrap();
        assert!(!store.load_commit(&c).unwrap().1.partial);
    }

    #[test]
    fn test_fsck_detects_corruption() {
        let (_td, store) = scratch();
        let id = store.write_object(ObjectKind::File, b"good bytes").unwrap();
        // Truncate the object in place
        let (pfx, rest) = id.fanout();
        let p = format!("objects/{pfx}/{rest}.file");
        store.dir().write(&p, b"bad").unwrap();
        assert_eq!(
            store.fsck_object(ObjectKind::File, &id).unwrap(),
            ObjectStatus::Invalid
        );
    }
}
