//! The resolver: turns user intents plus policy flags into an ordered
//! plan of operations with resolved commits, subpaths and dependencies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

use crate::bundle::Bundle;
use crate::config::LanguageConfig;
use crate::frontend::{Frontend, WarningKind};
use crate::installation::Installation;
use crate::refname::{PartialRef, Ref, RefKind};
use crate::remote::{RemoteState, SummaryRef};
use crate::store::ObjectId;
use crate::transaction::TransactionFlags;
use crate::Error;

/// What one operation does.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Pull and deploy a ref that is not installed here.
    Install {
        /// Remote to pull from.
        remote: String,
        /// Resolved commit.
        commit: ObjectId,
        /// Subpath restriction; empty means full.
        subpaths: Vec<String>,
    },
    /// Pull a new commit and replace the active deployment.
    Update {
        /// Origin remote.
        remote: String,
        /// Currently deployed commit.
        from_commit: ObjectId,
        /// Resolved target commit.
        to_commit: ObjectId,
        /// Subpath restriction carried over from the deployment.
        subpaths: Vec<String>,
    },
    /// Unpack a single-file bundle and deploy it.
    InstallBundle {
        /// Bundle file path.
        path: Utf8PathBuf,
        /// The commit the bundle carries.
        commit: ObjectId,
    },
    /// Retire the deployments of a ref.
    Uninstall {
        /// Keep the local ref entry (and thus the objects) around.
        keep_ref: bool,
        /// Remove even when other refs still use it.
        force: bool,
    },
}

impl OpKind {
    /// Human-readable verb for tables and logs.
    pub fn verb(&self) -> &'static str {
        match self {
            OpKind::Install { .. } => "install",
            OpKind::Update { .. } => "update",
            OpKind::InstallBundle { .. } => "install bundle",
            OpKind::Uninstall { .. } => "uninstall",
        }
    }

    /// The remote involved, when there is one.
    pub fn remote(&self) -> Option<&str> {
        match self {
            OpKind::Install { remote, .. } | OpKind::Update { remote, .. } => Some(remote),
            _ => None,
        }
    }

    fn target_commit(&self) -> Option<&ObjectId> {
        match self {
            OpKind::Install { commit, .. } | OpKind::InstallBundle { commit, .. } => Some(commit),
            OpKind::Update { to_commit, .. } => Some(to_commit),
            OpKind::Uninstall { .. } => None,
        }
    }

    fn subpaths(&self) -> &[String] {
        match self {
            OpKind::Install { subpaths, .. } | OpKind::Update { subpaths, .. } => subpaths,
            _ => &[],
        }
    }
}

/// One resolved operation.
#[derive(Debug, Clone)]
pub struct Operation {
    /// The ref being acted on.
    pub refname: Ref,
    /// What to do.
    pub kind: OpKind,
    /// Estimated transfer size.
    pub download_size: u64,
    /// Estimated checkout size.
    pub installed_size: u64,
    /// Runtime requirement recorded into deploy data.
    pub runtime_ref: Option<String>,
    /// Sdk recorded into deploy data.
    pub sdk_ref: Option<String>,
    /// Primary ref when this op came from related-ref expansion.
    pub related_to: Option<String>,
    /// Related policy: removed together with the primary.
    pub delete_with_primary: bool,
    /// Related policy: the unused-sweep may remove it.
    pub autoprune: bool,
    /// Metadata blob recorded into deploy data.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Indices of operations that must succeed before this one runs.
    pub deps: Vec<usize>,
}

impl Operation {
    fn fingerprint(&self) -> (Ref, Option<ObjectId>, Vec<String>) {
        (
            self.refname.clone(),
            self.kind.target_commit().cloned(),
            self.kind.subpaths().to_vec(),
        )
    }
}

/// A resolved, linearized plan. Operations are in execution order and
/// every dependency index points at an earlier entry.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Operations in execution order.
    pub ops: Vec<Operation>,
}

impl Plan {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sum of estimated transfer sizes.
    pub fn download_total(&self) -> u64 {
        self.ops.iter().map(|o| o.download_size).sum()
    }

    /// Sum of estimated checkout sizes.
    pub fn installed_total(&self) -> u64 {
        self.ops.iter().map(|o| o.installed_size).sum()
    }
}

/// An accumulated but not yet resolved user intent.
#[derive(Debug, Clone)]
pub(crate) enum Pending {
    Install {
        remote: Option<String>,
        target: PartialRef,
        subpaths: Vec<String>,
    },
    InstallBundle {
        path: Utf8PathBuf,
    },
    Update {
        target: PartialRef,
        commit: Option<ObjectId>,
    },
    Uninstall {
        target: PartialRef,
        keep_ref: bool,
        force: bool,
    },
}

/// Access to frozen per-remote state, built on demand.
pub(crate) trait RemoteStateSource {
    /// State for one named remote.
    fn get(&self, name: &str) -> Result<Arc<RemoteState>>;
    /// Names of all configured, enabled remotes.
    fn configured_names(&self) -> Result<Vec<String>>;
}

pub(crate) struct ResolveContext<'a> {
    pub installation: &'a Installation,
    pub others: &'a [Installation],
    pub remotes: &'a dyn RemoteStateSource,
    pub flags: &'a TransactionFlags,
    pub frontend: &'a dyn Frontend,
    pub languages: &'a LanguageConfig,
    pub default_arch: String,
}

pub(crate) struct Resolver<'a> {
    ctx: ResolveContext<'a>,
    ops: Vec<Operation>,
    fingerprints: HashMap<(Ref, Option<ObjectId>, Vec<String>), usize>,
}

const MAX_REBASE_DEPTH: u32 = 8;

impl<'a> Resolver<'a> {
    pub(crate) fn new(ctx: ResolveContext<'a>) -> Self {
        Self {
            ctx,
            ops: Vec::new(),
            fingerprints: HashMap::new(),
        }
    }

    /// Resolve every pending intent and linearize the result.
    #[context("Resolving transaction")]
    pub(crate) fn resolve(mut self, pending: &[Pending]) -> Result<Plan> {
        for p in pending {
            match p {
                Pending::Install {
                    remote,
                    target,
                    subpaths,
                } => self.resolve_install(remote.as_deref(), target, subpaths)?,
                Pending::InstallBundle { path } => self.resolve_bundle(path)?,
                Pending::Update { target, commit } => self.resolve_update(target, commit.as_ref())?,
                Pending::Uninstall {
                    target,
                    keep_ref,
                    force,
                } => self.resolve_uninstall(target, *keep_ref, *force)?,
            }
        }
        self.order_uninstalls();
        linearize(self.ops)
    }

    // At most one op per (ref, commit, subpaths) fingerprint runs in
    // one transaction, regardless of how many paths brought it in.
    fn push_op(&mut self, op: Operation) -> usize {
        let fp = op.fingerprint();
        if let Some(&idx) = self.fingerprints.get(&fp) {
            // Merge dependency arcs into the existing op
            let deps = op.deps;
            for d in deps {
                if !self.ops[idx].deps.contains(&d) && d != idx {
                    self.ops[idx].deps.push(d);
                }
            }
            return idx;
        }
        let idx = self.ops.len();
        self.fingerprints.insert(fp, idx);
        self.ops.push(op);
        idx
    }

    fn op_from_summary(
        &self,
        r: &Ref,
        kind: OpKind,
        sref: Option<&SummaryRef>,
    ) -> Operation {
        Operation {
            refname: r.clone(),
            kind,
            download_size: sref.map(|s| s.download_size).unwrap_or_default(),
            installed_size: sref.map(|s| s.installed_size).unwrap_or_default(),
            runtime_ref: sref.and_then(|s| s.runtime_ref.clone()),
            sdk_ref: sref.and_then(|s| s.sdk_ref.clone()),
            related_to: None,
            delete_with_primary: false,
            autoprune: false,
            metadata: sref.map(|s| s.metadata.clone()).unwrap_or_default(),
            deps: Vec::new(),
        }
    }

    fn pick_one(&self, what: &str, candidates: Vec<Ref>) -> Result<Ref> {
        match candidates.len() {
            0 => bail!("No matches for {what}"),
            1 => Ok(candidates.into_iter().next().unwrap()),
            _ => {
                if self.ctx.flags.disable_interaction {
                    return Err(Error::AmbiguousRef(what.to_string()).into());
                }
                let options: Vec<String> =
                    candidates.iter().map(|r| r.to_string()).collect();
                let idx = self
                    .ctx
                    .frontend
                    .choose_one(&format!("Similar refs found for {what}; which do you want to use?"), &options)
                    .ok_or_else(|| Error::AmbiguousRef(what.to_string()))?;
                candidates
                    .into_iter()
                    .nth(idx)
                    .ok_or_else(|| anyhow!("Choice out of range"))
            }
        }
    }

    // Apply the default arch and the remote's default branch when the
    // argument left them open and doing so narrows the match set.
    fn fan_out(&self, state: &RemoteState, target: &PartialRef) -> Vec<Ref> {
        let mut matches = state.matching_refs(target);
        if target.arch.is_none() {
            let narrowed: Vec<Ref> = matches
                .iter()
                .filter(|r| r.arch() == self.ctx.default_arch)
                .cloned()
                .collect();
            if !narrowed.is_empty() {
                matches = narrowed;
            }
        }
        if target.branch.is_none() {
            if let Some(default_branch) = &state.default_branch {
                let narrowed: Vec<Ref> = matches
                    .iter()
                    .filter(|r| r.branch() == default_branch)
                    .cloned()
                    .collect();
                if !narrowed.is_empty() {
                    matches = narrowed;
                }
            }
        }
        matches
    }

    fn remote_for_install(
        &self,
        named: Option<&str>,
        target: &PartialRef,
    ) -> Result<(Arc<RemoteState>, Vec<Ref>)> {
        if let Some(name) = named {
            let state = self.ctx.remotes.get(name)?;
            let matches = self.fan_out(&state, target);
            if matches.is_empty() {
                bail!("No matches for {target} in remote {name}");
            }
            return Ok((state, matches));
        }
        let mut offering: Vec<(Arc<RemoteState>, Vec<Ref>)> = Vec::new();
        for name in self.ctx.remotes.configured_names()? {
            let Ok(state) = self.ctx.remotes.get(&name) else {
                continue;
            };
            let matches = self.fan_out(&state, target);
            if !matches.is_empty() {
                offering.push((state, matches));
            }
        }
        match offering.len() {
            0 => bail!("No remote provides {target}"),
            1 => Ok(offering.into_iter().next().unwrap()),
            _ => {
                if self.ctx.flags.disable_interaction {
                    return Err(Error::AmbiguousRef(target.to_string()).into());
                }
                let options: Vec<String> =
                    offering.iter().map(|(s, _)| s.name.clone()).collect();
                let idx = self
                    .ctx
                    .frontend
                    .choose_one(
                        &format!("{target} is provided by several remotes; which one?"),
                        &options,
                    )
                    .ok_or_else(|| Error::AmbiguousRef(target.to_string()))?;
                offering
                    .into_iter()
                    .nth(idx)
                    .ok_or_else(|| anyhow!("Choice out of range"))
            }
        }
    }

    // Follow EOL_REBASE chains; a plain EOL warns (or refuses).
    fn apply_eol(&self, state: &RemoteState, mut r: Ref) -> Result<Ref> {
        for _ in 0..MAX_REBASE_DEPTH {
            let Some(sparse) = state.sparse_info(r.as_str()) else {
                return Ok(r);
            };
            if let Some(successor) = &sparse.eol_rebase {
                self.ctx.frontend.warn(
                    WarningKind::EndOfLifeRebased,
                    &format!("{r} has been replaced by {successor}"),
                );
                r = Ref::parse(successor)?;
                continue;
            }
            if let Some(reason) = &sparse.eol {
                if self.ctx.flags.refuse_eol {
                    bail!("{r} is end-of-life: {reason}");
                }
                self.ctx
                    .frontend
                    .warn(WarningKind::EndOfLife, &format!("{r} is end-of-life: {reason}"));
            }
            return Ok(r);
        }
        Err(Error::DependencyCycle(r.to_string()).into())
    }

    fn resolve_install(
        &mut self,
        named_remote: Option<&str>,
        target: &PartialRef,
        subpaths: &[String],
    ) -> Result<()> {
        let (state, matches) = self.remote_for_install(named_remote, target)?;
        let r = self.pick_one(&target.to_string(), matches)?;
        let r = self.apply_eol(&state, r)?;
        let sref = state
            .lookup_ref(r.as_str())
            .ok_or_else(|| anyhow!("Remote {} no longer provides {r}", state.name))?
            .clone();

        let installed_here = self.ctx.installation.is_installed(&r)?;
        if installed_here && !self.ctx.flags.reinstall {
            return Err(Error::AlreadyInstalled(r.to_string()).into());
        }
        // Reinstall is modeled as an uninstall the install depends on
        let mut deps = Vec::new();
        if installed_here {
            deps.push(self.push_op(Operation {
                refname: r.clone(),
                kind: OpKind::Uninstall {
                    keep_ref: false,
                    force: true,
                },
                download_size: 0,
                installed_size: 0,
                runtime_ref: None,
                sdk_ref: None,
                related_to: None,
                delete_with_primary: false,
                autoprune: false,
                metadata: BTreeMap::new(),
                deps: Vec::new(),
            }));
        }
        let mut op = self.op_from_summary(
            &r,
            OpKind::Install {
                remote: state.name.clone(),
                commit: sref.commit.clone(),
                subpaths: subpaths.to_vec(),
            },
            Some(&sref),
        );
        op.deps = deps;
        let idx = self.push_op(op);
        self.expand_dependencies(idx, &r, &sref)?;
        self.expand_related(&r, &sref, &state)?;
        self.expand_debug(&r, &state)?;
        Ok(())
    }

    fn resolve_bundle(&mut self, path: &Utf8PathBuf) -> Result<()> {
        let bundle = Bundle::load(path)?;
        let r = bundle.refname.clone();
        let installed_here = self.ctx.installation.is_installed(&r)?;
        if installed_here && !self.ctx.flags.reinstall {
            return Err(Error::AlreadyInstalled(r.to_string()).into());
        }
        let mut deps = Vec::new();
        if installed_here {
            deps.push(self.push_op(Operation {
                refname: r.clone(),
                kind: OpKind::Uninstall {
                    keep_ref: false,
                    force: true,
                },
                download_size: 0,
                installed_size: 0,
                runtime_ref: None,
                sdk_ref: None,
                related_to: None,
                delete_with_primary: false,
                autoprune: false,
                metadata: BTreeMap::new(),
                deps: Vec::new(),
            }));
        }
        let mut op = self.op_from_summary(
            &r,
            OpKind::InstallBundle {
                path: path.clone(),
                commit: bundle.commit().clone(),
            },
            None,
        );
        op.deps = deps;
        self.push_op(op);
        Ok(())
    }

    fn resolve_update(&mut self, target: &PartialRef, pin: Option<&ObjectId>) -> Result<()> {
        let matches: Vec<Ref> = self
            .ctx
            .installation
            .list_installed_refs()?
            .into_iter()
            .filter(|r| target.matches(r))
            .collect();
        if matches.is_empty() {
            return Err(Error::NotInstalled(target.to_string()).into());
        }
        for r in matches {
            let data = self.ctx.installation.load_deploy_data(&r)?;
            let state = match self.ctx.remotes.get(&data.origin) {
                Ok(s) => s,
                Err(e) => {
                    self.ctx.frontend.warn(
                        WarningKind::RemoteMissing,
                        &format!("Cannot update {r}: {e:#}"),
                    );
                    continue;
                }
            };
            // A rebased ref updates by installing its successor
            let resolved = self.apply_eol(&state, r.clone())?;
            if resolved != r {
                if !self.ctx.installation.is_installed(&resolved)? {
                    let sref = state
                        .lookup_ref(resolved.as_str())
                        .ok_or_else(|| {
                            anyhow!("Remote {} does not provide {resolved}", state.name)
                        })?
                        .clone();
                    let op = self.op_from_summary(
                        &resolved,
                        OpKind::Install {
                            remote: state.name.clone(),
                            commit: sref.commit.clone(),
                            subpaths: data.subpaths.clone(),
                        },
                        Some(&sref),
                    );
                    let idx = self.push_op(op);
                    self.expand_dependencies(idx, &resolved, &sref)?;
                    self.expand_related(&resolved, &sref, &state)?;
                }
                continue;
            }
            let Some(sref) = state.lookup_ref(r.as_str()).cloned() else {
                self.ctx.frontend.warn(
                    WarningKind::RemoteMissing,
                    &format!("Remote {} no longer provides {r}", state.name),
                );
                continue;
            };
            let to_commit = pin.cloned().unwrap_or_else(|| sref.commit.clone());
            if to_commit == data.commit && !self.ctx.flags.reinstall {
                tracing::debug!("{r} is already current");
                continue;
            }
            let mut op = self.op_from_summary(
                &r,
                OpKind::Update {
                    remote: state.name.clone(),
                    from_commit: data.commit.clone(),
                    to_commit,
                    subpaths: data.subpaths.clone(),
                },
                Some(&sref),
            );
            op.related_to = data.related_to.clone();
            op.delete_with_primary = data.delete_with_primary;
            op.autoprune = data.autoprune;
            let idx = self.push_op(op);
            self.expand_dependencies(idx, &r, &sref)?;
            self.expand_related(&r, &sref, &state)?;
        }
        Ok(())
    }

    fn resolve_uninstall(&mut self, target: &PartialRef, keep_ref: bool, force: bool) -> Result<()> {
        let matches: Vec<Ref> = self
            .ctx
            .installation
            .list_installed_refs()?
            .into_iter()
            .filter(|r| target.matches(r))
            .collect();
        if matches.is_empty() {
            // Maybe it lives in a different installation
            let mut candidates = Vec::new();
            for other in self.ctx.others {
                let any = other
                    .list_installed_refs()?
                    .into_iter()
                    .any(|r| target.matches(&r));
                if any {
                    candidates.push(other.name().to_string());
                }
            }
            if !candidates.is_empty() {
                return Err(Error::MultipleMatches {
                    reference: target.to_string(),
                    candidates,
                }
                .into());
            }
            return Err(Error::NotInstalled(target.to_string()).into());
        }
        // An exact argument selects exactly; otherwise ambiguity is
        // resolved interactively.
        let selected = if matches.len() > 1 && !target.is_exact() {
            vec![self.pick_one(&target.to_string(), matches)?]
        } else {
            matches
        };
        for r in selected {
            let data = self.ctx.installation.load_deploy_data(&r)?;
            let primary_idx = self.push_op(Operation {
                refname: r.clone(),
                kind: OpKind::Uninstall { keep_ref, force },
                download_size: 0,
                installed_size: 0,
                runtime_ref: data.runtime_ref.clone(),
                sdk_ref: data.sdk_ref.clone(),
                related_to: None,
                delete_with_primary: false,
                autoprune: false,
                metadata: BTreeMap::new(),
                deps: Vec::new(),
            });
            if self.ctx.flags.disable_related {
                continue;
            }
            // Related refs recorded against this primary leave with it
            for other in self.ctx.installation.list_installed_refs()? {
                if other == r {
                    continue;
                }
                let Ok(odata) = self.ctx.installation.load_deploy_data(&other) else {
                    continue;
                };
                if odata.related_to.as_deref() == Some(r.as_str()) && odata.delete_with_primary {
                    let idx = self.push_op(Operation {
                        refname: other.clone(),
                        kind: OpKind::Uninstall {
                            keep_ref,
                            force: true,
                        },
                        download_size: 0,
                        installed_size: 0,
                        runtime_ref: None,
                        sdk_ref: None,
                        related_to: Some(r.to_string()),
                        delete_with_primary: true,
                        autoprune: odata.autoprune,
                        metadata: BTreeMap::new(),
                        deps: Vec::new(),
                    });
                    if idx != primary_idx && !self.ops[idx].deps.contains(&primary_idx) {
                        self.ops[idx].deps.push(primary_idx);
                    }
                }
            }
        }
        Ok(())
    }

    // Emit install/update ops for a primary's runtime (and sdk).
    fn expand_dependencies(&mut self, primary_idx: usize, r: &Ref, sref: &SummaryRef) -> Result<()> {
        if self.ctx.flags.disable_dependencies || !r.is_app() {
            return Ok(());
        }
        let mut wanted: Vec<(String, bool)> = Vec::new();
        if let Some(rt) = &sref.runtime_ref {
            wanted.push((rt.clone(), true));
        }
        if self.ctx.flags.auto_install_sdk {
            if let Some(sdk) = &sref.sdk_ref {
                wanted.push((sdk.clone(), false));
            }
        }
        for (dep_str, required) in wanted {
            let dep = Ref::parse(&dep_str)
                .with_context(|| format!("Invalid dependency of {r}: {dep_str}"))?;
            if dep == *r {
                return Err(Error::DependencyCycle(r.to_string()).into());
            }
            match self.resolve_dependency(&dep, required)? {
                Some(dep_idx) => {
                    if !self.ops[primary_idx].deps.contains(&dep_idx) {
                        self.ops[primary_idx].deps.push(dep_idx);
                    }
                }
                None => continue,
            }
        }
        Ok(())
    }

    // Returns the op index satisfying the dependency, or None when the
    // installed copy is already current (or the dep was skipped).
    fn resolve_dependency(&mut self, dep: &Ref, required: bool) -> Result<Option<usize>> {
        if self.ctx.installation.is_installed(dep)? {
            let data = self.ctx.installation.load_deploy_data(dep)?;
            let Ok(state) = self.ctx.remotes.get(&data.origin) else {
                // Can't check for updates; the installed copy will do
                return Ok(None);
            };
            let Some(sref) = state.lookup_ref(dep.as_str()).cloned() else {
                return Ok(None);
            };
            if sref.commit == data.commit {
                return Ok(None);
            }
            let op = self.op_from_summary(
                dep,
                OpKind::Update {
                    remote: state.name.clone(),
                    from_commit: data.commit.clone(),
                    to_commit: sref.commit.clone(),
                    subpaths: data.subpaths.clone(),
                },
                Some(&sref),
            );
            let idx = self.push_op(op);
            self.expand_related(dep, &sref, &state)?;
            return Ok(Some(idx));
        }
        // Not installed: find a remote that provides it
        let partial = PartialRef {
            kind: Some(dep.kind()),
            id: dep.id().to_string(),
            arch: Some(dep.arch().to_string()),
            branch: Some(dep.branch().to_string()),
        };
        match self.remote_for_install(None, &partial) {
            Ok((state, matches)) => {
                let dep = self.pick_one(&partial.to_string(), matches)?;
                let sref = state
                    .lookup_ref(dep.as_str())
                    .ok_or_else(|| anyhow!("Remote {} lost {dep}", state.name))?
                    .clone();
                let op = self.op_from_summary(
                    &dep,
                    OpKind::Install {
                        remote: state.name.clone(),
                        commit: sref.commit.clone(),
                        subpaths: Vec::new(),
                    },
                    Some(&sref),
                );
                let idx = self.push_op(op);
                self.expand_related(&dep, &sref, &state)?;
                Ok(Some(idx))
            }
            Err(e) if required => Err(e).with_context(|| format!("Resolving runtime {dep}")),
            Err(e) => {
                self.ctx
                    .frontend
                    .warn(WarningKind::RelatedRef, &format!("Skipping {dep}: {e:#}"));
                Ok(None)
            }
        }
    }

    // Emit ops for the related refs a primary declares.
    fn expand_related(&mut self, r: &Ref, sref: &SummaryRef, state: &RemoteState) -> Result<()> {
        if self.ctx.flags.disable_related {
            return Ok(());
        }
        for rel in &sref.related {
            if !rel.should_download {
                continue;
            }
            if rel.refname == r.as_str() {
                // Related refs are declared only on primaries; a remote
                // claiming otherwise is lying
                return Err(Error::DependencyCycle(r.to_string()).into());
            }
            let rel_ref = match Ref::parse(&rel.refname) {
                Ok(rr) => rr,
                Err(e) => {
                    self.ctx.frontend.warn(
                        WarningKind::RelatedRef,
                        &format!("Ignoring invalid related ref of {r}: {e}"),
                    );
                    continue;
                }
            };
            // Per-language extensions are trimmed to the configured set
            let mut subpaths = rel.subpaths.clone();
            if rel_ref.id().ends_with(".Locale") && !self.ctx.languages.all() {
                subpaths.retain(|sp| self.ctx.languages.matches_locale(sp.trim_matches('/')));
                if subpaths.is_empty() && !rel.subpaths.is_empty() {
                    continue;
                }
            }
            let Some(rel_sref) = state.lookup_ref(&rel.refname).cloned() else {
                self.ctx.frontend.warn(
                    WarningKind::RelatedRef,
                    &format!("Remote {} does not provide related ref {rel_ref}", state.name),
                );
                continue;
            };
            let kind = if self.ctx.installation.is_installed(&rel_ref)? {
                let data = self.ctx.installation.load_deploy_data(&rel_ref)?;
                if data.commit == rel_sref.commit {
                    continue;
                }
                OpKind::Update {
                    remote: state.name.clone(),
                    from_commit: data.commit,
                    to_commit: rel_sref.commit.clone(),
                    subpaths,
                }
            } else {
                OpKind::Install {
                    remote: state.name.clone(),
                    commit: rel_sref.commit.clone(),
                    subpaths,
                }
            };
            let mut op = self.op_from_summary(&rel_ref, kind, Some(&rel_sref));
            op.related_to = Some(r.to_string());
            op.delete_with_primary = rel.delete_with_primary;
            op.autoprune = rel.autoprune;
            self.push_op(op);
        }
        Ok(())
    }

    // The `.Debug` extension of each primary, when requested.
    fn expand_debug(&mut self, r: &Ref, state: &RemoteState) -> Result<()> {
        if !self.ctx.flags.auto_install_debug {
            return Ok(());
        }
        let debug_id = format!("{}.Debug", r.id());
        let Ok(debug_ref) = Ref::new(RefKind::Runtime, &debug_id, r.arch(), r.branch()) else {
            return Ok(());
        };
        let Some(sref) = state.lookup_ref(debug_ref.as_str()).cloned() else {
            return Ok(());
        };
        if self.ctx.installation.is_installed(&debug_ref)? {
            return Ok(());
        }
        let mut op = self.op_from_summary(
            &debug_ref,
            OpKind::Install {
                remote: state.name.clone(),
                commit: sref.commit.clone(),
                subpaths: Vec::new(),
            },
            Some(&sref),
        );
        op.related_to = Some(r.to_string());
        op.delete_with_primary = true;
        self.push_op(op);
        Ok(())
    }

    // A runtime's uninstall must run after the uninstall of any app in
    // the same plan that depends on it.
    fn order_uninstalls(&mut self) {
        let mut arcs = Vec::new();
        for (ri, rop) in self.ops.iter().enumerate() {
            if !matches!(rop.kind, OpKind::Uninstall { .. }) || !rop.refname.is_runtime() {
                continue;
            }
            for (ai, aop) in self.ops.iter().enumerate() {
                if !matches!(aop.kind, OpKind::Uninstall { .. }) || !aop.refname.is_app() {
                    continue;
                }
                let uses = [aop.runtime_ref.as_deref(), aop.sdk_ref.as_deref()]
                    .into_iter()
                    .flatten()
                    .any(|d| d == rop.refname.as_str());
                if uses {
                    arcs.push((ri, ai));
                }
            }
        }
        for (ri, ai) in arcs {
            if ri != ai && !self.ops[ri].deps.contains(&ai) {
                self.ops[ri].deps.push(ai);
            }
        }
    }
}

// Reverse-topological linearization with a stable tie-break on
// (runtimes first, then ref string).
fn linearize(ops: Vec<Operation>) -> Result<Plan> {
    let n = ops.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, op) in ops.iter().enumerate() {
        for &d in &op.deps {
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }
    let sort_key = |i: usize| {
        (
            ops[i].refname.kind(),
            ops[i].refname.as_str().to_string(),
            i,
        )
    };
    let mut ready: BTreeSet<(RefKind, String, usize)> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(sort_key)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(entry) = ready.iter().next().cloned() {
        ready.remove(&entry);
        let i = entry.2;
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert(sort_key(j));
            }
        }
    }
    if order.len() != n {
        return Err(Error::DependencyCycle("resolved plan".to_string()).into());
    }
    let mut new_index = vec![0usize; n];
    for (pos, &old) in order.iter().enumerate() {
        new_index[old] = pos;
    }
    let mut new_ops: Vec<Operation> = Vec::with_capacity(n);
    for &old in &order {
        let mut op = ops[old].clone();
        op.deps = op.deps.iter().map(|&d| new_index[d]).collect();
        op.deps.sort_unstable();
        new_ops.push(op);
    }
    Ok(Plan { ops: new_ops })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_op(refname: &str, uninstall: bool, deps: Vec<usize>) -> Operation {
        Operation {
            refname: Ref::parse(refname).unwrap(),
            kind: if uninstall {
                OpKind::Uninstall {
                    keep_ref: false,
                    force: false,
                }
            } else {
                OpKind::Install {
                    remote: "origin".into(),
                    commit: ObjectId::digest(refname.as_bytes()).unwrap(),
                    subpaths: vec![],
                }
            },
            download_size: 0,
            installed_size: 0,
            runtime_ref: None,
            sdk_ref: None,
            related_to: None,
            delete_with_primary: false,
            autoprune: false,
            metadata: BTreeMap::new(),
            deps,
        }
    }

    #[test]
    fn test_linearize_runtime_first() {
        // App listed first, runtime second, no explicit arcs: the
        // tie-break still puts the runtime ahead.
        let ops = vec![
            dummy_op("app/org.acme.Draw/x86_64/stable", false, vec![]),
            dummy_op("runtime/org.acme.Platform/x86_64/24.08", false, vec![]),
        ];
        let plan = linearize(ops).unwrap();
        assert!(plan.ops[0].refname.is_runtime());
        assert!(plan.ops[1].refname.is_app());
    }

    #[test]
    fn test_linearize_deps_win_over_tiebreak() {
        // The runtime op depends on the app op (uninstall ordering):
        // dependency beats the kind tie-break.
        let ops = vec![
            dummy_op("runtime/org.acme.Platform/x86_64/24.08", true, vec![1]),
            dummy_op("app/org.acme.Draw/x86_64/stable", true, vec![]),
        ];
        let plan = linearize(ops).unwrap();
        assert!(plan.ops[0].refname.is_app());
        assert!(plan.ops[1].refname.is_runtime());
        assert_eq!(plan.ops[1].deps, vec![0]);
    }

    #[test]
    fn test_linearize_cycle() {
        let ops = vec![
            dummy_op("app/org.a.A/x86_64/stable", false, vec![1]),
            dummy_op("app/org.b.B/x86_64/stable", false, vec![0]),
        ];
        let e = linearize(ops).unwrap_err();
        assert!(matches!(
            e.downcast_ref(),
            Some(Error::DependencyCycle(_))
        ));
    }
}
