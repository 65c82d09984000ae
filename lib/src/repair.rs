//! The repair engine: verify the commit graph, classify damage, prune,
//! and re-materialize deployments that were lost.
//!
//! Tolerates partial-commit damage and torn writes: a partial commit is
//! allowed to be missing objects outside its chosen subpaths, while
//! invalid objects are deleted on sight wherever they are found.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use appdepot_utils::PathQuotedDisplay;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::frontend::{Frontend, QuietFrontend, WarningKind};
use crate::installation::Installation;
use crate::refname::{PartialRef, Ref};
use crate::store::{ObjectId, ObjectKind, ObjectStatus, ObjectStore, PruneStats};
use crate::transaction::{Transaction, TransactionFlags};
use crate::utils::check_cancel;

/// Aggregate state of one object graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraphStatus {
    /// Every reachable object is present and valid.
    Ok,
    /// At least one reachable object is missing.
    HasMissingObjects,
    /// At least one reachable object is corrupt.
    HasInvalidObjects,
}

/// Options for a repair pass.
#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    /// Read-only: report every mutation instead of performing it.
    pub dry_run: bool,
    /// Also drop and refetch the appstream metadata refs.
    pub reinstall_appstream: bool,
}

/// What a repair pass did (or, in dry-run mode, would do).
#[derive(Debug, Clone, Default)]
pub struct RepairResult {
    /// Whether this was (possibly auto-entered) dry-run.
    pub dry_run: bool,
    /// Leaked mirror refs removed.
    pub mirror_refs_removed: u32,
    /// Well-formed refs no deployment claimed, swept.
    pub refs_swept: Vec<String>,
    /// Refs deleted because their graph was damaged.
    pub refs_deleted: Vec<String>,
    /// Corrupt objects deleted during verification.
    pub invalid_objects: u64,
    /// Result of the prune step.
    pub pruned: PruneStats,
    /// Refs re-materialized through the transaction engine.
    pub reinstalled: Vec<String>,
}

struct RepairRun<'a> {
    store: &'a ObjectStore,
    frontend: &'a dyn Frontend,
    dry_run: bool,
    memo: HashMap<(ObjectKind, ObjectId), GraphStatus>,
    invalid_objects: u64,
}

impl RepairRun<'_> {
    // Verify one object and everything below it, deleting invalid
    // objects as they are found. Memoized on (kind, id).
    fn fsck_graph(&mut self, kind: ObjectKind, id: &ObjectId) -> Result<GraphStatus> {
        if let Some(&s) = self.memo.get(&(kind, id.clone())) {
            return Ok(s);
        }
        let own = match self.store.fsck_object(kind, id)? {
            ObjectStatus::Ok => GraphStatus::Ok,
            ObjectStatus::Missing => GraphStatus::HasMissingObjects,
            ObjectStatus::Invalid => {
                self.invalid_objects += 1;
                if self.dry_run {
                    println!("Would delete invalid {kind} object {id}");
                } else {
                    self.store.delete_object(kind, id)?;
                }
                GraphStatus::HasInvalidObjects
            }
        };
        let mut status = own;
        if own == GraphStatus::Ok {
            match kind {
                ObjectKind::Commit => {
                    let (commit, state) = self.store.load_commit(id)?;
                    let mut child = self.fsck_graph(ObjectKind::DirTree, &commit.tree)?;
                    child = child.max(self.fsck_graph(ObjectKind::DirMeta, &commit.dirmeta)?);
                    // A partial commit is allowed to be missing pieces
                    if state.partial && child == GraphStatus::HasMissingObjects {
                        child = GraphStatus::Ok;
                    }
                    status = child;
                }
                ObjectKind::DirTree => {
                    let tree = self.store.load_dirtree(id)?;
                    for f in &tree.files {
                        status = status.max(self.fsck_graph(ObjectKind::File, &f.object)?);
                    }
                    for d in &tree.dirs {
                        status = status.max(self.fsck_graph(ObjectKind::DirTree, &d.tree)?);
                        status = status.max(self.fsck_graph(ObjectKind::DirMeta, &d.meta)?);
                    }
                }
                ObjectKind::DirMeta | ObjectKind::File => {}
            }
        }
        self.memo.insert((kind, id.clone()), status);
        Ok(status)
    }
}

fn split_ref_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once(':') {
        Some((remote, refname)) => (Some(remote), refname),
        None => (None, key),
    }
}

// Insufficient privileges degrade to a read-only pass.
fn can_mutate(installation: &Installation) -> bool {
    let probe = ".repair-probe";
    match installation.dir().write(probe, b"") {
        Ok(()) => {
            let _ = installation.dir().remove_file(probe);
            true
        }
        Err(_) => false,
    }
}

/// Run a repair pass over one installation.
#[context("Repairing installation {}", installation.name())]
pub fn repair(
    installation: &Installation,
    frontend: &dyn Frontend,
    options: &RepairOptions,
    cancel: &CancellationToken,
) -> Result<RepairResult> {
    let mut dry_run = options.dry_run;
    if !dry_run && !can_mutate(installation) {
        frontend.warn(
            WarningKind::RemoteMissing,
            &format!(
                "No permission to modify {}; entering dry run",
                PathQuotedDisplay::new(&installation.path().as_std_path())
            ),
        );
        dry_run = true;
    }
    let _guard = if dry_run {
        installation.lock_shared()?
    } else {
        installation.lock_exclusive()?
    };
    let mut result = RepairResult {
        dry_run,
        ..Default::default()
    };
    let Some(store) = installation.maybe_ensure_repo()? else {
        return Ok(result);
    };

    // Pre-clean: leaked mirror refs
    check_cancel(cancel)?;
    for ((collection, refname), _) in store.list_mirror_refs()? {
        let claimed = Ref::parse(&refname)
            .ok()
            .map(|r| installation.is_installed(&r))
            .transpose()?
            .unwrap_or(false);
        if !claimed {
            if dry_run {
                println!("Would remove mirror ref {collection}/{refname}");
            } else {
                store.set_mirror_ref(&collection, &refname, None)?;
            }
            result.mirror_refs_removed += 1;
        }
    }

    // Sweep well-formed refs no deployment claims
    let mut surviving: Vec<(Option<String>, String, ObjectId)> = Vec::new();
    for (key, commit) in store.list_refs(None)? {
        check_cancel(cancel)?;
        let (remote, refname) = split_ref_key(&key);
        if let Ok(r) = Ref::parse(refname) {
            if installation.deployments_for(&r)?.is_empty() {
                if dry_run {
                    println!("Would remove undeployed ref {key}");
                } else {
                    store.set_ref(remote, refname, None)?;
                }
                result.refs_swept.push(key);
                continue;
            }
        }
        surviving.push((remote.map(ToOwned::to_owned), refname.to_string(), commit));
    }

    // Verify the commit graph of every surviving ref
    let mut run = RepairRun {
        store: &store,
        frontend,
        dry_run,
        memo: HashMap::new(),
        invalid_objects: 0,
    };
    for (remote, refname, commit) in &surviving {
        check_cancel(cancel)?;
        let status = run.fsck_graph(ObjectKind::Commit, commit)?;
        if status != GraphStatus::Ok {
            let key = match remote {
                Some(rm) => format!("{rm}:{refname}"),
                None => refname.clone(),
            };
            tracing::debug!("ref {key} is damaged: {status:?}");
            if dry_run {
                println!("Would remove damaged ref {key}");
            } else {
                store.set_ref(remote.as_deref(), refname, None)?;
            }
            result.refs_deleted.push(key);
        }
    }
    result.invalid_objects = run.invalid_objects;

    // Remotes that vanished under installed refs get a warning, never
    // a deletion
    let mut seen_remotes = BTreeSet::new();
    for r in installation.list_installed_refs()? {
        let Ok(data) = installation.load_deploy_data(&r) else {
            continue;
        };
        if !seen_remotes.insert(data.origin.clone()) {
            continue;
        }
        match installation.load_remote(&data.origin) {
            Ok(config) if config.disabled => run.frontend.warn(
                WarningKind::RemoteMissing,
                &format!("Remote {} (origin of {r}) is disabled", data.origin),
            ),
            Ok(_) => {}
            Err(_) => run.frontend.warn(
                WarningKind::RemoteMissing,
                &format!("Remote {} (origin of {r}) is not configured", data.origin),
            ),
        }
    }

    if !dry_run {
        result.pruned = store.prune(0)?;
        installation.clear_removed()?;
    }

    // Re-materialize deployments whose backing state was lost
    let mut to_reinstall: Vec<(Ref, String, Vec<String>)> = Vec::new();
    for r in installation.list_installed_refs()? {
        let Ok(data) = installation.load_deploy_data(&r) else {
            continue;
        };
        let ref_present = store.resolve_ref(Some(&data.origin), r.as_str())?.is_some()
            || store.resolve_ref(None, r.as_str())?.is_some();
        let partial_full_deploy = data.subpaths.is_empty()
            && store.has_object(ObjectKind::Commit, &data.commit)?
            && store.commit_is_partial(&data.commit)?;
        if !ref_present || partial_full_deploy {
            to_reinstall.push((r, data.origin, data.subpaths));
        }
    }
    if !to_reinstall.is_empty() {
        if dry_run {
            for (r, origin, _) in &to_reinstall {
                println!("Would reinstall {r} from {origin}");
            }
            result.reinstalled = to_reinstall
                .iter()
                .map(|(r, _, _)| r.to_string())
                .collect();
        } else {
            let flags = TransactionFlags {
                reinstall: true,
                disable_related: true,
                disable_dependencies: true,
                disable_prune: true,
                disable_interaction: true,
                ..Default::default()
            };
            let mut txn = Transaction::new(installation, flags, Box::new(QuietFrontend));
            for (r, origin, subpaths) in &to_reinstall {
                txn.add_install(
                    Some(origin.clone()),
                    PartialRef {
                        kind: Some(r.kind()),
                        id: r.id().to_string(),
                        arch: Some(r.arch().to_string()),
                        branch: Some(r.branch().to_string()),
                    },
                    subpaths.clone(),
                );
                result.reinstalled.push(r.to_string());
            }
            txn.run(cancel).context("Re-materializing deployments")?;
        }
    }

    if options.reinstall_appstream {
        reinstall_appstream(&store, frontend, dry_run)?;
    }

    Ok(result)
}

// Appstream refs are plain metadata refs; refetching them is dropping
// the ref so the next update pulls a fresh copy.
fn reinstall_appstream(
    store: &ObjectStore,
    frontend: &dyn Frontend,
    dry_run: bool,
) -> Result<()> {
    for (key, _) in store.list_refs(None)? {
        let (remote, refname) = split_ref_key(&key);
        if !refname.starts_with("appstream/") {
            continue;
        }
        if dry_run {
            println!("Would refresh {key}");
            continue;
        }
        store.set_ref(remote, refname, None)?;
        frontend.warn(
            WarningKind::RemoteMissing,
            &format!("Dropped {key}; it will be refetched on the next update"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_status_order() {
        assert!(GraphStatus::Ok < GraphStatus::HasMissingObjects);
        assert!(GraphStatus::HasMissingObjects < GraphStatus::HasInvalidObjects);
        assert_eq!(
            GraphStatus::Ok.max(GraphStatus::HasInvalidObjects),
            GraphStatus::HasInvalidObjects
        );
    }

    #[test]
    fn test_split_ref_key() {
        assert_eq!(
            split_ref_key("origin:app/org.a.B/x86_64/stable"),
            (Some("origin"), "app/org.a.B/x86_64/stable")
        );
        assert_eq!(
            split_ref_key("app/org.a.B/x86_64/stable"),
            (None, "app/org.a.B/x86_64/stable")
        );
    }
}
