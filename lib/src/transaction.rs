//! The transaction engine: resolve accumulated intents into a plan,
//! then execute it under the installation lock with strict failure,
//! interaction and cancellation rules.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use crate::bundle::{Bundle, RefDescription};
use crate::config::LanguageConfig;
use crate::frontend::{Answer, Frontend, OpOutcome, Readiness};
use crate::installation::{DeployData, Installation};
use crate::refname::{self, PartialRef, Ref, RefKind};
use crate::remote::{RemoteConfig, RemoteState};
use crate::resolve::{OpKind, Operation, Pending, RemoteStateSource, ResolveContext, Resolver};
use crate::store::pull::{pull_ref, FileBackend, PullOptions, RepoBackend};
use crate::store::{ObjectId, ObjectStore};
use crate::utils::{check_cancel, now_timestamp};
use crate::{is_aborted, Error};

/// Global policy switches for one transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionFlags {
    /// Skip the pull phase (objects must already be local).
    pub no_pull: bool,
    /// Skip the deploy phase (pull only).
    pub no_deploy: bool,
    /// Never use static deltas.
    pub no_static_deltas: bool,
    /// Do not expand runtime/sdk dependencies.
    pub disable_dependencies: bool,
    /// Do not expand related refs.
    pub disable_related: bool,
    /// Reinstall refs that are already installed.
    pub reinstall: bool,
    /// Uninstall without the runtime-in-use check.
    pub force_uninstall: bool,
    /// Keep local ref entries when uninstalling.
    pub keep_ref: bool,
    /// Skip the final prune.
    pub disable_prune: bool,
    /// Never prompt; ambiguity becomes an error.
    pub disable_interaction: bool,
    /// Abort the whole transaction on the first failing operation.
    pub stop_on_first_error: bool,
    /// Override the default architecture.
    pub default_arch: Option<String>,
    /// Also install the sdk named by each app.
    pub auto_install_sdk: bool,
    /// Also install the `.Debug` extension of each primary.
    pub auto_install_debug: bool,
    /// Treat end-of-life (without rebase) as an error.
    pub refuse_eol: bool,
}

/// Creates transport backends for configured remotes.
pub trait BackendProvider: std::fmt::Debug {
    /// A backend for one remote.
    fn backend_for(&self, config: &RemoteConfig) -> Result<Box<dyn RepoBackend>>;
}

/// The stock provider: local `file://` repositories.
#[derive(Debug, Default)]
pub struct DefaultBackendProvider;

impl BackendProvider for DefaultBackendProvider {
    fn backend_for(&self, config: &RemoteConfig) -> Result<Box<dyn RepoBackend>> {
        if let Some(path) = config.url.strip_prefix("file://") {
            let mut backend = FileBackend::open(Utf8PathBuf::from(path).as_path())?;
            if let Some(key) = &config.trusted_key {
                backend = backend.with_trusted_key(key.as_bytes());
            }
            return Ok(Box::new(backend));
        }
        Err(Error::NetworkError(format!(
            "unsupported transport for remote {}: {}",
            config.name, config.url
        ))
        .into())
    }
}

pub(crate) struct RemoteStates<'a> {
    installation: &'a Installation,
    provider: &'a dyn BackendProvider,
    extra_sideloads: &'a [Utf8PathBuf],
    cache: RefCell<BTreeMap<String, Arc<RemoteState>>>,
}

impl RemoteStateSource for RemoteStates<'_> {
    fn get(&self, name: &str) -> Result<Arc<RemoteState>> {
        if let Some(state) = self.cache.borrow().get(name) {
            return Ok(Arc::clone(state));
        }
        let config = self.installation.load_remote(name)?;
        let backend = self.provider.backend_for(&config)?;
        let state = Arc::new(RemoteState::build(&config, backend, self.extra_sideloads)?);
        self.cache
            .borrow_mut()
            .insert(name.to_string(), Arc::clone(&state));
        Ok(state)
    }

    fn configured_names(&self) -> Result<Vec<String>> {
        Ok(self
            .installation
            .list_remotes()?
            .into_iter()
            .filter(|r| !r.disabled)
            .map(|r| r.name)
            .collect())
    }
}

/// Counts of what a finished transaction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    /// Operations that completed.
    pub executed: usize,
    /// Operations skipped (failed dependency or declined prompt).
    pub skipped: usize,
    /// Operations that ran and failed.
    pub failed: usize,
}

#[derive(Debug, Clone)]
enum Queued {
    Resolved(Pending),
    Description(RefDescription),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OpStatus {
    Waiting,
    Done,
    Failed,
    Skipped,
}

enum Executed {
    Done,
    Declined,
}

/// One unit of resolve-plus-execute against one installation.
#[derive(Debug)]
pub struct Transaction<'a> {
    installation: &'a Installation,
    others: Vec<Installation>,
    flags: TransactionFlags,
    frontend: Box<dyn Frontend>,
    provider: Box<dyn BackendProvider>,
    extra_sideloads: Vec<Utf8PathBuf>,
    queued: Vec<Queued>,
    bundle_keys: BTreeMap<Utf8PathBuf, Vec<Vec<u8>>>,
}

impl<'a> Transaction<'a> {
    /// Start building a transaction against an installation.
    pub fn new(
        installation: &'a Installation,
        flags: TransactionFlags,
        frontend: Box<dyn Frontend>,
    ) -> Self {
        Self {
            installation,
            others: Vec::new(),
            flags,
            frontend,
            provider: Box::new(DefaultBackendProvider),
            extra_sideloads: Vec::new(),
            queued: Vec::new(),
            bundle_keys: BTreeMap::new(),
        }
    }

    /// Replace the transport provider (tests, alternative transports).
    pub fn with_backend_provider(mut self, provider: Box<dyn BackendProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Other installations consulted for cross-installation checks.
    pub fn with_other_installations(mut self, others: Vec<Installation>) -> Self {
        self.others = others;
        self
    }

    /// Additional sideload repositories for this run.
    pub fn with_extra_sideloads(mut self, dirs: Vec<Utf8PathBuf>) -> Self {
        self.extra_sideloads = dirs;
        self
    }

    /// Queue an install of refs matching `target` from `remote` (or
    /// from whichever remote provides it).
    pub fn add_install(
        &mut self,
        remote: Option<String>,
        target: PartialRef,
        subpaths: Vec<String>,
    ) {
        self.queued.push(Queued::Resolved(Pending::Install {
            remote,
            target,
            subpaths,
        }));
    }

    /// Queue installing a single-file bundle.
    pub fn add_install_bundle(&mut self, path: Utf8PathBuf, gpg_keys: Vec<Vec<u8>>) {
        if !gpg_keys.is_empty() {
            self.bundle_keys.insert(path.clone(), gpg_keys);
        }
        self.queued
            .push(Queued::Resolved(Pending::InstallBundle { path }));
    }

    /// Queue an install described by a `.appref` file.
    pub fn add_install_from_description(&mut self, data: &[u8]) -> Result<()> {
        let desc = RefDescription::parse(data)?;
        self.queued.push(Queued::Description(desc));
        Ok(())
    }

    /// Queue an update, optionally pinned to a commit.
    pub fn add_update(&mut self, target: PartialRef, commit: Option<ObjectId>) {
        self.queued
            .push(Queued::Resolved(Pending::Update { target, commit }));
    }

    /// Queue an uninstall; keep-ref and force come from the flags.
    pub fn add_uninstall(&mut self, target: PartialRef) {
        self.queued.push(Queued::Resolved(Pending::Uninstall {
            target,
            keep_ref: self.flags.keep_ref,
            force: self.flags.force_uninstall,
        }));
    }

    /// Queue installs for every listed ref that is not yet installed.
    pub fn add_sync_preinstalled(&mut self, refs: &[PartialRef]) -> Result<()> {
        let installed = self.installation.list_installed_refs()?;
        for target in refs {
            if installed.iter().any(|r| target.matches(r)) {
                continue;
            }
            self.add_install(None, target.clone(), Vec::new());
        }
        Ok(())
    }

    /// Whether anything has been queued.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    // A description references a repository by URL; make sure a remote
    // exists for it and rewrite to a plain install.
    fn materialize_descriptions(&self) -> Result<Vec<Pending>> {
        let mut out = Vec::with_capacity(self.queued.len());
        for q in &self.queued {
            match q {
                Queued::Resolved(p) => out.push(p.clone()),
                Queued::Description(desc) => {
                    let existing = self
                        .installation
                        .list_remotes()?
                        .into_iter()
                        .find(|r| r.url == desc.url);
                    let remote = match existing {
                        Some(r) => r.name,
                        None => {
                            let name = format!("{}-origin", desc.name);
                            self.installation.add_remote(&RemoteConfig {
                                name: name.clone(),
                                url: desc.url.clone(),
                                default_branch: desc.branch.clone(),
                                ..Default::default()
                            })?;
                            name
                        }
                    };
                    let kind = if desc.is_runtime {
                        RefKind::Runtime
                    } else {
                        RefKind::App
                    };
                    out.push(Pending::Install {
                        remote: Some(remote),
                        target: PartialRef {
                            kind: Some(kind),
                            id: desc.name.clone(),
                            arch: None,
                            branch: desc.branch.clone(),
                        },
                        subpaths: Vec::new(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Resolve and execute. Consumes the transaction; there is exactly
    /// one run per transaction.
    pub fn run(self, cancel: &CancellationToken) -> Result<TransactionSummary> {
        let name = self.installation.name().to_string();
        self.run_inner(cancel)
            .with_context(|| format!("Running transaction on {name}"))
    }

    fn run_inner(self, cancel: &CancellationToken) -> Result<TransactionSummary> {
        let _guard = self.installation.lock_exclusive()?;
        let store = self.installation.ensure_repo()?;
        let pending = self.materialize_descriptions()?;

        let states = RemoteStates {
            installation: self.installation,
            provider: self.provider.as_ref(),
            extra_sideloads: &self.extra_sideloads,
            cache: RefCell::new(BTreeMap::new()),
        };
        let languages = LanguageConfig::load(self.installation)?;
        let default_arch = self
            .flags
            .default_arch
            .clone()
            .unwrap_or_else(|| refname::default_arch().to_string());

        check_cancel(cancel)?;
        let plan = Resolver::new(ResolveContext {
            installation: self.installation,
            others: &self.others,
            remotes: &states,
            flags: &self.flags,
            frontend: self.frontend.as_ref(),
            languages: &languages,
            default_arch,
        })
        .resolve(&pending)?;

        if self.frontend.ready(&plan) == Readiness::Abort {
            return Err(Error::Aborted.into());
        }

        let mut status = vec![OpStatus::Waiting; plan.ops.len()];
        let mut summary = TransactionSummary::default();
        let mut first_error: Option<anyhow::Error> = None;

        for (i, op) in plan.ops.iter().enumerate() {
            if let Err(e) = check_cancel(cancel) {
                self.installation.clear_removed()?;
                return Err(e);
            }
            if op.deps.iter().any(|&d| status[d] != OpStatus::Done) {
                status[i] = OpStatus::Skipped;
                summary.skipped += 1;
                self.frontend.op_end(
                    op,
                    &OpOutcome::Skipped {
                        reason: "a dependency failed".to_string(),
                    },
                );
                continue;
            }
            self.frontend.op_begin(op);
            match self.execute_op(&store, &states, op, cancel) {
                Ok(Executed::Done) => {
                    status[i] = OpStatus::Done;
                    summary.executed += 1;
                    self.frontend.op_end(op, &OpOutcome::Done);
                }
                Ok(Executed::Declined) => {
                    status[i] = OpStatus::Skipped;
                    summary.skipped += 1;
                    self.frontend.op_end(
                        op,
                        &OpOutcome::Skipped {
                            reason: "declined".to_string(),
                        },
                    );
                }
                Err(e) => {
                    if is_aborted(&e) {
                        // A cancelled transaction is not a failure to
                        // report; it still leaves a consistent tree
                        self.frontend.op_end(
                            op,
                            &OpOutcome::Skipped {
                                reason: "aborted".to_string(),
                            },
                        );
                        self.installation.clear_removed()?;
                        return Err(e);
                    }
                    self.frontend.op_end(
                        op,
                        &OpOutcome::Failed {
                            message: format!("{e:#}"),
                        },
                    );
                    let fatal = match e.downcast_ref::<Error>() {
                        Some(Error::GpgUntrusted(_)) => true,
                        Some(Error::StoreCorrupt(_)) => {
                            return Err(e.context("Object store damage detected; run repair"));
                        }
                        _ => self.flags.stop_on_first_error,
                    };
                    if fatal {
                        return Err(e);
                    }
                    status[i] = OpStatus::Failed;
                    summary.failed += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        self.installation.clear_removed()?;
        if summary.failed == 0 && !self.flags.disable_prune {
            store.prune(0)?;
        }
        match first_error {
            Some(e) => Err(e.context(format!("{} operation(s) failed", summary.failed))),
            None => Ok(summary),
        }
    }

    fn execute_op(
        &self,
        store: &ObjectStore,
        states: &RemoteStates<'_>,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> Result<Executed> {
        match &op.kind {
            OpKind::Install {
                remote,
                commit,
                subpaths,
            } => {
                self.check_conflict(&op.refname)?;
                let state = states.get(remote)?;
                self.pull_one(store, &state, op, commit, subpaths, cancel)?;
                if !self.flags.no_deploy {
                    check_cancel(cancel)?;
                    let data = self.deploy_data_for(op, remote, commit, subpaths);
                    self.installation
                        .deploy_commit(store, &op.refname, commit, data)?;
                }
                Ok(Executed::Done)
            }
            OpKind::Update {
                remote,
                from_commit: _,
                to_commit,
                subpaths,
            } => {
                let state = states.get(remote)?;
                self.pull_one(store, &state, op, to_commit, subpaths, cancel)?;
                if !self.flags.no_deploy {
                    check_cancel(cancel)?;
                    let prev = self
                        .installation
                        .active_deployment(&op.refname)?
                        .ok_or_else(|| Error::NotInstalled(op.refname.to_string()))?;
                    // The prior deployment moves to staging first; it
                    // comes back if the new one fails to materialize
                    let staged = self.installation.undeploy(&op.refname, &prev.deploy_id)?;
                    let mut data = self.deploy_data_for(op, remote, to_commit, subpaths);
                    data.previous_id = Some(prev.deploy_id.clone());
                    match self
                        .installation
                        .deploy_commit(store, &op.refname, to_commit, data)
                    {
                        Ok(_) => Ok(Executed::Done),
                        Err(e) => {
                            self.installation
                                .restore_removed(&op.refname, &staged, &prev.deploy_id)
                                .context("Restoring prior deployment")?;
                            Err(e)
                        }
                    }
                } else {
                    Ok(Executed::Done)
                }
            }
            OpKind::InstallBundle { path, commit } => {
                self.check_conflict(&op.refname)?;
                let bundle = Bundle::load(path)?;
                if let Some(keys) = self.bundle_keys.get(path) {
                    if !bundle.verify(keys)? {
                        return Err(Error::GpgUntrusted(format!("bundle {path}")).into());
                    }
                }
                check_cancel(cancel)?;
                bundle.delta.apply(store)?;
                store.set_commit_partial(commit, false)?;
                let origin = self.ensure_bundle_origin(&bundle)?;
                store.set_ref(Some(&origin), bundle.refname.as_str(), Some(commit))?;
                if !self.flags.no_deploy {
                    let data = self.deploy_data_for(op, &origin, commit, &[]);
                    self.installation
                        .deploy_commit(store, &op.refname, commit, data)?;
                }
                Ok(Executed::Done)
            }
            OpKind::Uninstall { keep_ref, force } => {
                self.execute_uninstall(store, op, *keep_ref, *force)
            }
        }
    }

    fn pull_one(
        &self,
        store: &ObjectStore,
        state: &RemoteState,
        op: &Operation,
        commit: &ObjectId,
        subpaths: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.flags.no_pull {
            return Ok(());
        }
        let opts = PullOptions {
            subpaths: subpaths.to_vec(),
            disable_static_deltas: self.flags.no_static_deltas,
            verify_existing: self.flags.reinstall,
        };
        let sideloads = state.sideload_stores();
        pull_ref(
            store,
            &state.name,
            state.collection_id.as_deref(),
            state.backend(),
            &sideloads,
            op.refname.as_str(),
            commit,
            &opts,
            cancel,
            &mut |p| self.frontend.progress(op, p),
        )
    }

    // Install of a ref already active in another installation is a
    // deploy conflict.
    fn check_conflict(&self, r: &Ref) -> Result<()> {
        if self.flags.reinstall {
            return Ok(());
        }
        for other in &self.others {
            if other.is_installed(r)? {
                return Err(Error::AlreadyInstalled(format!(
                    "{r} (in installation {})",
                    other.name()
                ))
                .into());
            }
        }
        Ok(())
    }

    fn deploy_data_for(
        &self,
        op: &Operation,
        origin: &str,
        commit: &ObjectId,
        subpaths: &[String],
    ) -> DeployData {
        DeployData {
            origin: origin.to_string(),
            commit: commit.clone(),
            subpaths: subpaths.to_vec(),
            installed_size: 0,
            timestamp: now_timestamp(),
            previous_id: None,
            runtime_ref: op.runtime_ref.clone(),
            sdk_ref: op.sdk_ref.clone(),
            related_to: op.related_to.clone(),
            delete_with_primary: op.delete_with_primary,
            autoprune: op.autoprune,
            metadata: op.metadata.clone(),
        }
    }

    fn ensure_bundle_origin(&self, bundle: &Bundle) -> Result<String> {
        if let Some(url) = &bundle.origin_url {
            if let Some(existing) = self
                .installation
                .list_remotes()?
                .into_iter()
                .find(|r| &r.url == url)
            {
                return Ok(existing.name);
            }
        }
        let name = format!("{}-origin", bundle.refname.id());
        if self.installation.load_remote(&name).is_err() {
            self.installation.add_remote(&RemoteConfig {
                name: name.clone(),
                url: bundle.origin_url.clone().unwrap_or_default(),
                // A bundle with no publishing repository cannot update
                disabled: bundle.origin_url.is_none(),
                ..Default::default()
            })?;
        }
        Ok(name)
    }

    fn execute_uninstall(
        &self,
        store: &ObjectStore,
        op: &Operation,
        keep_ref: bool,
        force: bool,
    ) -> Result<Executed> {
        let r = &op.refname;
        let deployments = self.installation.deployments_for(r)?;
        if deployments.is_empty() {
            if force {
                return Ok(Executed::Done);
            }
            return Err(Error::NotInstalled(r.to_string()).into());
        }
        if r.is_runtime() && !force {
            let mut users = Vec::new();
            for app in self.installation.list_installed_refs()? {
                if !app.is_app() {
                    continue;
                }
                let Ok(data) = self.installation.load_deploy_data(&app) else {
                    continue;
                };
                let uses = [data.runtime_ref.as_deref(), data.sdk_ref.as_deref()]
                    .into_iter()
                    .flatten()
                    .any(|d| d == r.as_str());
                if uses {
                    users.push(app.id().to_string());
                }
            }
            if !users.is_empty() {
                let listed = appdepot_utils::truncated_list(users.iter(), 5)
                    .unwrap_or_default();
                match self.frontend.confirm(&format!(
                    "Applications using this runtime: {listed}. Really remove?"
                )) {
                    Answer::Yes => {}
                    Answer::No => return Ok(Executed::Declined),
                    Answer::Abort => return Err(Error::Aborted.into()),
                }
            }
        }
        let origin = deployments
            .iter()
            .find(|d| d.active)
            .map(|d| d.data.origin.clone());
        for d in &deployments {
            self.installation.undeploy(r, &d.deploy_id)?;
        }
        if !keep_ref {
            if let Some(origin) = origin {
                store.set_ref(Some(&origin), r.as_str(), None)?;
            }
            store.set_ref(None, r.as_str(), None)?;
        }
        Ok(Executed::Done)
    }
}
