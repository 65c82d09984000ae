//! Named installation roots.
//!
//! An installation owns an object store, a set of deployments, remote
//! configuration, a pinned-refs list and a file lock. Layout:
//!
//! ```text
//! <root>/repo/                          object store
//! <root>/<kind>/<id>/<arch>/<branch>/<commit>/   one deployment
//! <root>/<kind>/<id>/<arch>/<branch>/active      active symlink
//! <root>/removed/                       retired deployments staging
//! <root>/remotes.d/<name>.conf          one remote per file
//! <root>/config                         languages etc.
//! <root>/pins                           pinned refs, one per line
//! <root>/lock                           flock target
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::{AtFlags, Mode};
use serde::{Deserialize, Serialize};

use crate::refname::{Ref, RefKind};
use crate::remote::RemoteConfig;
use crate::store::pull::{subpath_selects_dir, subpath_selects_file};
use crate::store::{DirMeta, ObjectId, ObjectKind, ObjectStore};
use crate::Error;

const REPO: &str = "repo";
const REMOVED: &str = "removed";
const REMOTES_D: &str = "remotes.d";
const PINS: &str = "pins";
const LOCKFILE: &str = "lock";

/// Sidecar record written next to every deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployData {
    /// Remote the deployment was installed from.
    pub origin: String,
    /// The deployed commit.
    pub commit: ObjectId,
    /// Materialized subpaths; empty means a full deployment.
    #[serde(default)]
    pub subpaths: Vec<String>,
    /// Bytes occupied by the checkout.
    pub installed_size: u64,
    /// Deploy time, seconds since the epoch.
    pub timestamp: i64,
    /// The deployment this one replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    /// Runtime required by this app, as a full ref string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ref: Option<String>,
    /// Sdk recorded for this app, as a full ref string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_ref: Option<String>,
    /// Primary ref this one was installed as a related ref of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
    /// Whether uninstalling the primary should also remove this ref.
    #[serde(default)]
    pub delete_with_primary: bool,
    /// Whether the unused-sweep may remove this ref automatically.
    #[serde(default)]
    pub autoprune: bool,
    /// Application metadata blob carried by the commit.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One materialized checkout of one commit of one ref.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// The deployed ref.
    pub refname: Ref,
    /// Directory name, the commit id.
    pub deploy_id: String,
    /// Absolute path of the checkout.
    pub path: Utf8PathBuf,
    /// Whether the active symlink selects this deployment.
    pub active: bool,
    /// The sidecar record.
    pub data: DeployData,
}

#[derive(Debug, Default)]
struct LockState {
    file: Option<std::fs::File>,
    depth: u32,
}

/// Guard for the installation lock; reentrant within a process.
#[derive(Debug)]
pub struct LockGuard {
    state: Rc<RefCell<LockState>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut st = self.state.borrow_mut();
        st.depth -= 1;
        if st.depth == 0 {
            // Closing the fd releases the flock
            st.file = None;
        }
    }
}

/// A named installation root.
#[derive(Debug)]
pub struct Installation {
    name: String,
    path: Utf8PathBuf,
    dir: Dir,
    lock: Rc<RefCell<LockState>>,
}

impl Installation {
    /// Open (creating the skeleton if needed) an installation at an
    /// explicit path.
    #[context("Opening installation {name} at {path}")]
    pub fn open(name: &str, path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path.as_std_path())
            .with_context(|| format!("Creating {path}"))?;
        let dir = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())?;
        for d in [REMOVED, REMOTES_D, RefKind::App.as_str(), RefKind::Runtime.as_str()] {
            dir.create_dir_all(d)?;
        }
        Ok(Self {
            name: name.to_string(),
            path: path.to_owned(),
            dir,
            lock: Default::default(),
        })
    }

    /// The per-user installation root, honoring `XDG_DATA_HOME`.
    pub fn user() -> Result<Self> {
        let base = match std::env::var_os("XDG_DATA_HOME") {
            Some(p) => Utf8PathBuf::try_from(std::path::PathBuf::from(p))
                .map_err(|_| anyhow!("Non-UTF8 XDG_DATA_HOME"))?,
            None => {
                let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("HOME is unset"))?;
                Utf8PathBuf::try_from(std::path::PathBuf::from(home))
                    .map_err(|_| anyhow!("Non-UTF8 HOME"))?
                    .join(".local/share")
            }
        };
        Self::open("user", &base.join("appdepot"))
    }

    /// The system-wide installation root.
    pub fn system() -> Result<Self> {
        Self::open("system", Utf8Path::new("/var/lib/appdepot"))
    }

    /// The installation name ("system", "user", or an extra name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn dir(&self) -> &Dir {
        &self.dir
    }

    fn acquire_lock(&self, exclusive: bool) -> Result<LockGuard> {
        let mut st = self.lock.borrow_mut();
        if st.depth == 0 {
            debug_assert!(st.file.is_none());
            let file = std::fs::File::create(self.path.join(LOCKFILE).as_std_path())
                .with_context(|| format!("Creating lock in {}", self.path))?;
            let op = if exclusive {
                rustix::fs::FlockOperation::NonBlockingLockExclusive
            } else {
                rustix::fs::FlockOperation::NonBlockingLockShared
            };
            match rustix::fs::flock(&file, op) {
                Ok(()) => {}
                Err(rustix::io::Errno::WOULDBLOCK) => {
                    return Err(Error::Busy(self.name.clone()).into());
                }
                Err(e) => return Err(e).context("flock"),
            }
            st.file = Some(file);
        }
        st.depth += 1;
        Ok(LockGuard {
            state: Rc::clone(&self.lock),
        })
    }

    /// Take the exclusive lock; every mutation runs under this.
    pub fn lock_exclusive(&self) -> Result<LockGuard> {
        self.acquire_lock(true)
    }

    /// Take the shared lock for read-only enumeration.
    pub fn lock_shared(&self) -> Result<LockGuard> {
        self.acquire_lock(false)
    }

    // Object store

    /// Open the object store if it has been initialized.
    pub fn maybe_ensure_repo(&self) -> Result<Option<ObjectStore>> {
        let p = self.path.join(REPO);
        if self.dir.try_exists(REPO)? {
            Ok(Some(ObjectStore::open(&p)?))
        } else {
            Ok(None)
        }
    }

    /// Open the object store, initializing it on first use.
    pub fn ensure_repo(&self) -> Result<ObjectStore> {
        ObjectStore::ensure(&self.path.join(REPO))
    }

    // Deployments

    fn ref_reldir(r: &Ref) -> Utf8PathBuf {
        r.as_str().into()
    }

    fn read_active_link(&self, r: &Ref) -> Result<Option<String>> {
        let p = Self::ref_reldir(r).join("active");
        match self.dir.read_link(p.as_std_path()) {
            Ok(target) => Ok(Some(
                target
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid active link for {r}"))?
                    .to_string(),
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading active link for {r}")),
        }
    }

    fn load_deployment(&self, r: &Ref, deploy_id: &str, active: bool) -> Result<Deployment> {
        let rel = Self::ref_reldir(r).join(deploy_id);
        let data = self
            .dir
            .read(rel.join("deploy"))
            .with_context(|| format!("Reading deploy data for {r}/{deploy_id}"))?;
        let data: DeployData = serde_json::from_slice(&data)?;
        Ok(Deployment {
            refname: r.clone(),
            deploy_id: deploy_id.to_string(),
            path: self.path.join(&rel),
            active,
            data,
        })
    }

    /// All deployments of a ref, newest first.
    #[context("Listing deployments for {r}")]
    pub fn deployments_for(&self, r: &Ref) -> Result<Vec<Deployment>> {
        let _lock = self.lock_shared()?;
        let rel = Self::ref_reldir(r);
        if !self.dir.try_exists(&rel)? {
            return Ok(Vec::new());
        }
        let active = self.read_active_link(r)?;
        let mut out = Vec::new();
        for ent in self.dir.open_dir(&rel)?.entries()? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            // In-progress staging directories are dot-prefixed
            if name.starts_with('.') {
                continue;
            }
            if let Ok(d) = self.load_deployment(r, name, active.as_deref() == Some(name)) {
                out.push(d);
            }
        }
        out.sort_by(|a, b| b.data.timestamp.cmp(&a.data.timestamp));
        Ok(out)
    }

    /// The deployment the active symlink selects, if any.
    pub fn active_deployment(&self, r: &Ref) -> Result<Option<Deployment>> {
        let _lock = self.lock_shared()?;
        match self.read_active_link(r)? {
            Some(id) => Ok(Some(self.load_deployment(r, &id, true)?)),
            None => Ok(None),
        }
    }

    /// Deploy data of the active deployment.
    pub fn load_deploy_data(&self, r: &Ref) -> Result<DeployData> {
        match self.active_deployment(r)? {
            Some(d) => Ok(d.data),
            None => Err(Error::NotInstalled(r.to_string()).into()),
        }
    }

    /// Whether the ref has an active deployment.
    pub fn is_installed(&self, r: &Ref) -> Result<bool> {
        Ok(self.read_active_link(r)?.is_some())
    }

    /// Every ref with an active deployment.
    #[context("Listing installed refs")]
    pub fn list_installed_refs(&self) -> Result<Vec<Ref>> {
        let _lock = self.lock_shared()?;
        let mut out = Vec::new();
        for kind in [RefKind::App, RefKind::Runtime] {
            let kdir = kind.as_str();
            if !self.dir.try_exists(kdir)? {
                continue;
            }
            for id_ent in self.dir.open_dir(kdir)?.entries()? {
                let id_ent = id_ent?;
                if !id_ent.file_type()?.is_dir() {
                    continue;
                }
                let id = id_ent.file_name();
                let Some(id) = id.to_str().map(ToOwned::to_owned) else {
                    continue;
                };
                let id_dir = id_ent.open_dir()?;
                for arch_ent in id_dir.entries()? {
                    let arch_ent = arch_ent?;
                    if !arch_ent.file_type()?.is_dir() {
                        continue;
                    }
                    let arch = arch_ent.file_name();
                    let Some(arch) = arch.to_str().map(ToOwned::to_owned) else {
                        continue;
                    };
                    let arch_dir = arch_ent.open_dir()?;
                    for br_ent in arch_dir.entries()? {
                        let br_ent = br_ent?;
                        if !br_ent.file_type()?.is_dir() {
                            continue;
                        }
                        let branch = br_ent.file_name();
                        let Some(branch) = branch.to_str() else {
                            continue;
                        };
                        let Ok(r) = Ref::new(kind, &id, &arch, branch) else {
                            continue;
                        };
                        if self.is_installed(&r)? {
                            out.push(r);
                        }
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Materialize a commit as a new deployment and atomically make it
    /// active. The sidecar is written before the activation flip, so an
    /// interrupted deploy never becomes active.
    #[context("Deploying {r}")]
    pub fn deploy_commit(
        &self,
        store: &ObjectStore,
        r: &Ref,
        commit_id: &ObjectId,
        mut data: DeployData,
    ) -> Result<Deployment> {
        let _lock = self.lock_exclusive()?;
        let refdir_rel = Self::ref_reldir(r);
        self.dir.create_dir_all(&refdir_rel)?;
        let refdir = self.dir.open_dir(&refdir_rel)?;

        let (commit, state) = store.load_commit(commit_id)?;
        if state.partial && data.subpaths.is_empty() {
            return Err(Error::StoreCorrupt(format!(
                "commit {commit_id} is partial but a full deployment was requested"
            ))
            .into());
        }

        let deploy_id = commit_id.to_string();
        let staging = format!(".deploy-{}", uuid::Uuid::new_v4());
        refdir.create_dir(&staging)?;
        let staging_dir = refdir.open_dir(&staging)?;
        let staged = checkout_tree(
            store,
            &commit.tree,
            &commit.dirmeta,
            &staging_dir,
            "",
            &data.subpaths,
        )
        .and_then(|bytes| {
            data.installed_size = bytes;
            let blob = serde_json::to_vec(&data).context("Serializing deploy data")?;
            staging_dir.atomic_write("deploy", &blob)?;
            Ok(bytes)
        });
        let bytes = match staged {
            Ok(b) => b,
            Err(e) => {
                // Never leave a torn checkout behind
                let _ = refdir.remove_dir_all(&staging);
                return Err(e);
            }
        };

        // Replace any leftover of the same commit, then the atomic rename
        if refdir.try_exists(&deploy_id)? {
            refdir.remove_dir_all(&deploy_id)?;
        }
        refdir.rename(&staging, &refdir, &deploy_id)?;
        self.activate(&refdir, &deploy_id)?;
        tracing::debug!("deployed {r} at {deploy_id} ({bytes} bytes)");
        self.load_deployment(r, &deploy_id, true)
    }

    fn activate(&self, refdir: &Dir, deploy_id: &str) -> Result<()> {
        let tmp = format!(".active-{}", uuid::Uuid::new_v4());
        rustix::fs::symlinkat(deploy_id, refdir, tmp.as_str()).context("Creating active link")?;
        rustix::fs::renameat(refdir, tmp.as_str(), refdir, "active")
            .context("Activating deployment")?;
        Ok(())
    }

    /// Retire one deployment into `removed/`, returning the staging
    /// name. Clears the active link when it pointed at this deployment.
    #[context("Undeploying {r}")]
    pub fn undeploy(&self, r: &Ref, deploy_id: &str) -> Result<String> {
        let _lock = self.lock_exclusive()?;
        let rel = Self::ref_reldir(r).join(deploy_id);
        if !self.dir.try_exists(&rel)? {
            return Err(Error::NotInstalled(r.to_string()).into());
        }
        if self.read_active_link(r)?.as_deref() == Some(deploy_id) {
            self.dir.remove_file(Self::ref_reldir(r).join("active"))?;
        }
        self.dir.create_dir_all(REMOVED)?;
        let staged = format!("{}-{}", uuid::Uuid::new_v4(), deploy_id);
        self.dir
            .rename(&rel, &self.dir, Utf8Path::new(REMOVED).join(&staged))?;
        tracing::debug!("retired {r}/{deploy_id} into removed/{staged}");
        Ok(staged)
    }

    /// Restore a deployment previously staged into `removed/`.
    pub fn restore_removed(&self, r: &Ref, staged: &str, deploy_id: &str) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let refdir_rel = Self::ref_reldir(r);
        self.dir.create_dir_all(&refdir_rel)?;
        self.dir.rename(
            Utf8Path::new(REMOVED).join(staged),
            &self.dir,
            refdir_rel.join(deploy_id),
        )?;
        let refdir = self.dir.open_dir(&refdir_rel)?;
        self.activate(&refdir, deploy_id)
    }

    /// The staging directory for retired deployments.
    pub fn get_removed_dir(&self) -> Result<Dir> {
        self.dir.create_dir_all(REMOVED)?;
        Ok(self.dir.open_dir(REMOVED)?)
    }

    /// Erase the contents of `removed/`; safe after a transaction
    /// commits (or is cancelled).
    #[context("Erasing removed staging")]
    pub fn clear_removed(&self) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        if !self.dir.try_exists(REMOVED)? {
            return Ok(());
        }
        let removed = self.dir.open_dir(REMOVED)?;
        for ent in removed.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            if ent.file_type()?.is_dir() {
                removed.remove_dir_all(&name)?;
            } else {
                removed.remove_file(&name)?;
            }
        }
        Ok(())
    }

    // Pins

    /// Refs exempted from the unused-sweep.
    pub fn list_pinned_refs(&self) -> Result<Vec<Ref>> {
        let mut out = Vec::new();
        match self.dir.read_to_string(PINS) {
            Ok(s) => {
                for line in s.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    out.push(Ref::parse(line)?);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Reading pins"),
        }
        Ok(out)
    }

    /// Pin or unpin a ref. Returns whether the state changed.
    pub fn set_pinned(&self, r: &Ref, pinned: bool) -> Result<bool> {
        let _lock = self.lock_exclusive()?;
        let mut pins: BTreeSet<String> = self
            .list_pinned_refs()?
            .into_iter()
            .map(|r| r.to_string())
            .collect();
        let changed = if pinned {
            pins.insert(r.to_string())
        } else {
            pins.remove(r.as_str())
        };
        if changed {
            let mut buf = String::new();
            for p in &pins {
                buf.push_str(p);
                buf.push('\n');
            }
            self.dir.atomic_write(PINS, buf.as_bytes())?;
        }
        Ok(changed)
    }

    /// Installed refs that no non-auto-prunable root reaches: runtimes
    /// (and auto-prunable related refs) that no installed app needs and
    /// that are not pinned.
    #[context("Computing unused refs")]
    pub fn list_unused_refs(&self) -> Result<Vec<Ref>> {
        let _lock = self.lock_shared()?;
        let installed = self.list_installed_refs()?;
        let pinned: BTreeSet<Ref> = self.list_pinned_refs()?.into_iter().collect();
        let installed_set: BTreeSet<Ref> = installed.iter().cloned().collect();

        // Roots: every app, every pinned ref
        let mut needed: BTreeSet<Ref> = BTreeSet::new();
        for r in &installed {
            if r.is_app() || pinned.contains(r) {
                needed.insert(r.clone());
            }
        }
        // Everything a root requires stays
        let mut frontier: Vec<Ref> = needed.iter().cloned().collect();
        while let Some(r) = frontier.pop() {
            let Ok(data) = self.load_deploy_data(&r) else {
                continue;
            };
            for dep in [&data.runtime_ref, &data.sdk_ref].into_iter().flatten() {
                if let Ok(dep) = Ref::parse(dep) {
                    if installed_set.contains(&dep) && needed.insert(dep.clone()) {
                        frontier.push(dep);
                    }
                }
            }
        }
        // Related refs follow their primary
        let mut out = Vec::new();
        for r in &installed {
            if needed.contains(r) {
                continue;
            }
            let Ok(data) = self.load_deploy_data(r) else {
                continue;
            };
            if let Some(primary) = &data.related_to {
                if let Ok(primary) = Ref::parse(primary) {
                    if needed.contains(&primary) && !data.autoprune {
                        continue;
                    }
                }
            }
            out.push(r.clone());
        }
        Ok(out)
    }

    /// Drop mirror ref entries that no deployment references.
    #[context("Deleting leaked mirror refs")]
    pub fn delete_mirror_refs(&self, store: &ObjectStore) -> Result<u32> {
        let _lock = self.lock_exclusive()?;
        let mut n = 0;
        for ((collection, refname), _) in store.list_mirror_refs()? {
            let claimed = Ref::parse(&refname)
                .ok()
                .map(|r| self.is_installed(&r))
                .transpose()?
                .unwrap_or(false);
            if !claimed {
                store.set_mirror_ref(&collection, &refname, None)?;
                n += 1;
            }
        }
        Ok(n)
    }

    // Remotes

    fn remote_relpath(name: &str) -> Utf8PathBuf {
        format!("{REMOTES_D}/{name}.conf").into()
    }

    /// Load one remote's configuration.
    pub fn load_remote(&self, name: &str) -> Result<RemoteConfig> {
        let p = Self::remote_relpath(name);
        match self.dir.read_to_string(&p) {
            Ok(s) => RemoteConfig::parse(name, &s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::RemoteMissing(name.to_string()).into())
            }
            Err(e) => Err(e).with_context(|| format!("Reading {p}")),
        }
    }

    /// Enumerate configured remotes.
    #[context("Listing remotes")]
    pub fn list_remotes(&self) -> Result<Vec<RemoteConfig>> {
        let mut out = Vec::new();
        if !self.dir.try_exists(REMOTES_D)? {
            return Ok(out);
        }
        for ent in self.dir.open_dir(REMOTES_D)?.entries()? {
            let ent = ent?;
            let name = ent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(name) = name.strip_suffix(".conf") else {
                continue;
            };
            out.push(self.load_remote(name)?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Add or replace a remote.
    pub fn add_remote(&self, config: &RemoteConfig) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        self.dir.create_dir_all(REMOTES_D)?;
        self.dir
            .atomic_write(Self::remote_relpath(&config.name), config.to_ini().as_bytes())?;
        Ok(())
    }

    // Installation config (languages etc.)

    /// Read the raw installation config file, if present.
    pub fn read_config(&self) -> Result<Option<String>> {
        match self.dir.read_to_string("config") {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Reading config"),
        }
    }

    /// Replace the installation config file.
    pub fn write_config(&self, contents: &str) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        self.dir.atomic_write("config", contents.as_bytes())?;
        Ok(())
    }
}

/// Recursively materialize a tree into `dest`, honoring the subpath
/// restriction; returns bytes written.
fn checkout_tree(
    store: &ObjectStore,
    tree_id: &ObjectId,
    meta_id: &ObjectId,
    dest: &Dir,
    path: &str,
    subpaths: &[String],
) -> Result<u64> {
    let meta: DirMeta = store.load_dirmeta(meta_id)?;
    rustix::fs::chmodat(
        dest,
        ".",
        Mode::from_raw_mode(meta.mode),
        AtFlags::empty(),
    )
    .context("Setting directory mode")?;
    let tree = store.load_dirtree(tree_id)?;
    let mut bytes = 0;
    // Files are only materialized once inside a selected subpath
    if subpath_selects_file(subpaths, path) {
        for f in &tree.files {
            let data = store.read_object(ObjectKind::File, &f.object)?;
            dest.write(&f.name, &data)
                .with_context(|| format!("Writing {path}/{}", f.name))?;
            rustix::fs::chmodat(
                dest,
                f.name.as_str(),
                Mode::from_raw_mode(f.mode),
                AtFlags::empty(),
            )?;
            bytes += data.len() as u64;
        }
    }
    for d in &tree.dirs {
        let child = if path.is_empty() {
            d.name.clone()
        } else {
            format!("{path}/{}", d.name)
        };
        if !subpath_selects_dir(subpaths, &child) {
            continue;
        }
        dest.create_dir(&d.name)?;
        let sub = dest.open_dir(&d.name)?;
        bytes += checkout_tree(store, &d.tree, &d.meta, &sub, &child, subpaths)?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;

    #[test]
    fn test_lock_reentrant() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        let a = inst.lock_exclusive().unwrap();
        let b = inst.lock_exclusive().unwrap();
        drop(a);
        drop(b);
        let _c = inst.lock_shared().unwrap();
    }

    #[test]
    fn test_deploy_and_enumerate() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        let store = inst.ensure_repo().unwrap();
        let r = Ref::parse("app/org.acme.Draw/x86_64/stable").unwrap();
        let commit = fx.commit_sample_tree(&store, &[("bin/draw", b"elf"), ("share/doc", b"hi")]);

        assert!(!inst.is_installed(&r).unwrap());
        assert!(matches!(
            inst.load_deploy_data(&r).unwrap_err().downcast_ref(),
            Some(Error::NotInstalled(_))
        ));

        let data = Fixture::deploy_data("origin", &commit);
        let d = inst.deploy_commit(&store, &r, &commit, data).unwrap();
        assert!(d.active);
        assert!(inst.is_installed(&r).unwrap());
        assert_eq!(inst.list_installed_refs().unwrap(), vec![r.clone()]);
        let loaded = inst.load_deploy_data(&r).unwrap();
        assert_eq!(loaded.commit, commit);
        assert!(loaded.installed_size > 0);

        // Files actually exist in the checkout
        let active = inst.active_deployment(&r).unwrap().unwrap();
        assert!(active.path.join("bin/draw").exists());

        let staged = inst.undeploy(&r, &d.deploy_id).unwrap();
        assert!(!inst.is_installed(&r).unwrap());
        inst.restore_removed(&r, &staged, &d.deploy_id).unwrap();
        assert!(inst.is_installed(&r).unwrap());
        inst.undeploy(&r, &d.deploy_id).unwrap();
        inst.clear_removed().unwrap();
        assert_eq!(inst.get_removed_dir().unwrap().entries().unwrap().count(), 0);
    }

    #[test]
    fn test_subpath_deploy() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        let store = inst.ensure_repo().unwrap();
        let r = Ref::parse("runtime/org.acme.Draw.Locale/x86_64/stable").unwrap();
        let commit = fx.commit_sample_tree(
            &store,
            &[("share/locale/de", b"de"), ("bin/tool", b"elf")],
        );
        let mut data = Fixture::deploy_data("origin", &commit);
        data.subpaths = vec!["/share".to_string()];
        inst.deploy_commit(&store, &r, &commit, data).unwrap();
        let active = inst.active_deployment(&r).unwrap().unwrap();
        assert!(active.path.join("share/locale/de").exists());
        assert!(!active.path.join("bin").exists());
    }

    #[test]
    fn test_pins() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        let r = Ref::parse("runtime/org.acme.Platform/x86_64/24.08").unwrap();
        assert!(inst.set_pinned(&r, true).unwrap());
        assert!(!inst.set_pinned(&r, true).unwrap());
        assert_eq!(inst.list_pinned_refs().unwrap(), vec![r.clone()]);
        assert!(inst.set_pinned(&r, false).unwrap());
        assert!(inst.list_pinned_refs().unwrap().is_empty());
    }

    #[test]
    fn test_unused_refs() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        let store = inst.ensure_repo().unwrap();
        let app = Ref::parse("app/org.acme.Draw/x86_64/stable").unwrap();
        let rt = Ref::parse("runtime/org.acme.Platform/x86_64/24.08").unwrap();
        let orphan = Ref::parse("runtime/org.idle.Thing/x86_64/1").unwrap();

        let c = fx.commit_sample_tree(&store, &[("f", b"x")]);
        let mut app_data = Fixture::deploy_data("origin", &c);
        app_data.runtime_ref = Some(rt.to_string());
        inst.deploy_commit(&store, &app, &c, app_data).unwrap();
        inst.deploy_commit(&store, &rt, &c, Fixture::deploy_data("origin", &c))
            .unwrap();
        inst.deploy_commit(&store, &orphan, &c, Fixture::deploy_data("origin", &c))
            .unwrap();

        assert_eq!(inst.list_unused_refs().unwrap(), vec![orphan.clone()]);
        // Pinning exempts from the sweep
        inst.set_pinned(&orphan, true).unwrap();
        assert!(inst.list_unused_refs().unwrap().is_empty());
    }
}
