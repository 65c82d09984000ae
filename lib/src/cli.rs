//! # Application distribution manager CLI
//!
//! Command line surface over the transaction and repair engines.

use std::ffi::OsString;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use comfy_table::Table;
use indicatif::HumanBytes;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::frontend::{Frontend, InteractiveFrontend, QuietFrontend};
use crate::installation::Installation;
use crate::preinstall;
use crate::refname::{PartialRef, Ref, RefKind};
use crate::repair::{repair, RepairOptions};
use crate::store::ObjectId;
use crate::transaction::{Transaction, TransactionFlags, TransactionSummary};
use crate::Error;

/// Exit status signalling "nothing changed" to a build-side driver.
pub const EXIT_SKIPPED: i32 = 42;

/// Which installation a command operates on.
#[derive(Debug, Parser, PartialEq, Eq, Default)]
pub(crate) struct LocationOpts {
    /// Work on the per-user installation
    #[clap(long, conflicts_with_all = ["system", "installation"])]
    pub(crate) user: bool,

    /// Work on the system-wide installation (default)
    #[clap(long, conflicts_with = "installation")]
    pub(crate) system: bool,

    /// Work on a named extra installation
    #[clap(long)]
    pub(crate) installation: Option<String>,
}

impl LocationOpts {
    fn installation(&self) -> Result<Installation> {
        if let Some(name) = &self.installation {
            let root = Utf8PathBuf::from("/var/lib/appdepot-installations").join(name);
            return Installation::open(name, &root);
        }
        if self.user && !self.system {
            Installation::user()
        } else {
            Installation::system()
        }
    }

    // The other default roots, for cross-installation diagnostics.
    fn others(&self) -> Vec<Installation> {
        let mut out = Vec::new();
        if self.user {
            if let Ok(i) = Installation::system() {
                out.push(i);
            }
        } else if let Ok(i) = Installation::user() {
            out.push(i);
        }
        out
    }
}

/// Shared interaction switches.
#[derive(Debug, Parser, PartialEq, Eq, Default)]
pub(crate) struct InteractionOpts {
    /// Assume yes to all questions
    #[clap(long, short = 'y')]
    pub(crate) assumeyes: bool,

    /// Never prompt; ambiguity becomes an error
    #[clap(long)]
    pub(crate) noninteractive: bool,
}

impl InteractionOpts {
    fn frontend(&self) -> Box<dyn Frontend> {
        if self.noninteractive {
            Box::new(QuietFrontend)
        } else {
            Box::new(InteractiveFrontend::new(self.assumeyes))
        }
    }
}

/// Install applications or runtimes.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    #[clap(flatten)]
    pub(crate) interaction: InteractionOpts,

    /// Don't pull, only deploy what is already local
    #[clap(long)]
    pub(crate) no_pull: bool,

    /// Don't deploy, only pull
    #[clap(long)]
    pub(crate) no_deploy: bool,

    /// Don't install related refs (locales, extensions)
    #[clap(long)]
    pub(crate) no_related: bool,

    /// Don't install runtime dependencies
    #[clap(long)]
    pub(crate) no_deps: bool,

    /// Never use static deltas
    #[clap(long)]
    pub(crate) no_static_deltas: bool,

    /// Uninstall first if already installed
    #[clap(long)]
    pub(crate) reinstall: bool,

    /// Only deploy the named subpaths (may be repeated)
    #[clap(long = "subpath")]
    pub(crate) subpaths: Vec<String>,

    /// Treat the arguments as app refs
    #[clap(long, conflicts_with = "runtime")]
    pub(crate) app: bool,

    /// Treat the arguments as runtime refs
    #[clap(long)]
    pub(crate) runtime: bool,

    /// Architecture to install for
    #[clap(long)]
    pub(crate) arch: Option<String>,

    /// The arguments are bundle files
    #[clap(long, conflicts_with = "from")]
    pub(crate) bundle: bool,

    /// The arguments are ref description files
    #[clap(long)]
    pub(crate) from: bool,

    /// Trust keys from this file when installing bundles
    #[clap(long)]
    pub(crate) gpg_file: Option<Utf8PathBuf>,

    /// Exit 42 without error when there is nothing to do
    #[clap(long, hide = true)]
    pub(crate) skip_if_unchanged: bool,

    /// [REMOTE] REF...; the first argument names a remote when one by
    /// that name is configured
    #[clap(required = true)]
    pub(crate) targets: Vec<String>,
}

/// Uninstall applications or runtimes.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UninstallOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    #[clap(flatten)]
    pub(crate) interaction: InteractionOpts,

    /// Remove everything that is installed
    #[clap(long, conflicts_with = "unused")]
    pub(crate) all: bool,

    /// Remove unused runtimes and extensions
    #[clap(long)]
    pub(crate) unused: bool,

    /// Keep the local ref (and objects) around
    #[clap(long)]
    pub(crate) keep_ref: bool,

    /// Remove even when something still depends on it
    #[clap(long)]
    pub(crate) force_remove: bool,

    /// Don't remove related refs
    #[clap(long)]
    pub(crate) no_related: bool,

    /// Also remove the application's data directory
    #[clap(long)]
    pub(crate) delete_data: bool,

    /// Architecture to match
    #[clap(long)]
    pub(crate) arch: Option<String>,

    /// Treat the arguments as app refs
    #[clap(long, conflicts_with = "runtime")]
    pub(crate) app: bool,

    /// Treat the arguments as runtime refs
    #[clap(long)]
    pub(crate) runtime: bool,

    /// REF...
    pub(crate) targets: Vec<String>,
}

/// Update installed applications or runtimes.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpdateOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    #[clap(flatten)]
    pub(crate) interaction: InteractionOpts,

    /// Don't pull, only deploy what is already local
    #[clap(long)]
    pub(crate) no_pull: bool,

    /// Don't deploy, only pull
    #[clap(long)]
    pub(crate) no_deploy: bool,

    /// Don't update related refs
    #[clap(long)]
    pub(crate) no_related: bool,

    /// Don't update runtime dependencies
    #[clap(long)]
    pub(crate) no_deps: bool,

    /// Never use static deltas
    #[clap(long)]
    pub(crate) no_static_deltas: bool,

    /// Update to this commit instead of the latest
    #[clap(long)]
    pub(crate) commit: Option<String>,

    /// Architecture to match
    #[clap(long)]
    pub(crate) arch: Option<String>,

    /// Treat the arguments as app refs
    #[clap(long, conflicts_with = "runtime")]
    pub(crate) app: bool,

    /// Treat the arguments as runtime refs
    #[clap(long)]
    pub(crate) runtime: bool,

    /// Exit 42 without error when there is nothing to do
    #[clap(long, hide = true)]
    pub(crate) skip_if_unchanged: bool,

    /// REF... (empty updates everything)
    pub(crate) targets: Vec<String>,
}

/// Install the refs the operating system declares as required.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct PreinstallOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// Prefer objects from this repository (may be repeated)
    #[clap(long = "sideload-repo")]
    pub(crate) sideload_repos: Vec<Utf8PathBuf>,

    /// Also install sdks
    #[clap(long)]
    pub(crate) include_sdk: bool,

    /// Also install debug extensions
    #[clap(long)]
    pub(crate) include_debug: bool,

    /// Never prompt (preinstall is always noninteractive)
    #[clap(long)]
    #[allow(dead_code)]
    pub(crate) noninteractive: bool,

    /// Read the list from this directory instead of the default
    #[clap(long, hide = true, default_value = preinstall::DEFAULT_DIR)]
    pub(crate) list_dir: Utf8PathBuf,
}

/// Verify and repair the installation.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RepairCliOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// Report what would change without changing anything
    #[clap(long)]
    pub(crate) dry_run: bool,

    /// Also drop and refetch appstream metadata
    #[clap(long)]
    pub(crate) reinstall_all: bool,
}

/// Read or change installation configuration.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ConfigOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// List all configured keys
    #[clap(long, conflicts_with_all = ["get", "set", "unset"])]
    pub(crate) list: bool,

    /// Print one key
    #[clap(long, conflicts_with_all = ["set", "unset"])]
    pub(crate) get: bool,

    /// Set KEY VALUE
    #[clap(long, conflicts_with = "unset")]
    pub(crate) set: bool,

    /// Remove a key
    #[clap(long)]
    pub(crate) unset: bool,

    /// KEY [VALUE]
    pub(crate) args: Vec<String>,
}

/// List installed refs.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ListOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// Only apps
    #[clap(long, conflicts_with = "runtime")]
    pub(crate) app: bool,

    /// Only runtimes
    #[clap(long)]
    pub(crate) runtime: bool,

    /// Only this architecture
    #[clap(long)]
    pub(crate) arch: Option<String>,
}

/// Show details of one installed ref.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InfoOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// The ref to inspect
    pub(crate) target: String,
}

/// List or change pinned refs.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct PinOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,

    /// Remove a pin instead of adding one
    #[clap(long)]
    pub(crate) unpin: bool,

    /// Refs to (un)pin; empty lists current pins
    pub(crate) targets: Vec<String>,
}

/// List configured remotes.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct RemoteListOpts {
    #[clap(flatten)]
    pub(crate) location: LocationOpts,
}

/// Hidden, internal only options
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum InternalsOpts {
    /// Dump object store statistics
    RepoInfo {
        #[clap(flatten)]
        location: LocationOpts,
    },
}

/// Manage installed applications and runtimes.
///
/// Applications and runtimes are drawn from content-addressed
/// repositories and deployed per installation; transactions resolve
/// dependencies and related refs, then pull, deploy and prune.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "appdepot")]
#[clap(rename_all = "kebab-case")]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Opt {
    /// Install applications or runtimes
    Install(InstallOpts),
    /// Uninstall applications or runtimes
    Uninstall(UninstallOpts),
    /// Update installed applications or runtimes
    #[clap(alias = "upgrade")]
    Update(UpdateOpts),
    /// Install the refs the operating system preinstall list declares
    Preinstall(PreinstallOpts),
    /// Verify and repair the local state
    Repair(RepairCliOpts),
    /// Read or change configuration
    Config(ConfigOpts),
    /// List installed refs
    List(ListOpts),
    /// Show details of an installed ref
    Info(InfoOpts),
    /// List or change pinned refs
    Pin(PinOpts),
    /// List configured remotes
    RemoteList(RemoteListOpts),
    /// Hidden internal commands
    #[clap(subcommand, hide = true)]
    Internals(InternalsOpts),
}

fn parse_target(
    raw: &str,
    app: bool,
    runtime: bool,
    arch: Option<&str>,
) -> Result<PartialRef> {
    let mut target = PartialRef::parse(raw)?;
    if app {
        target.kind = Some(RefKind::App);
    } else if runtime {
        target.kind = Some(RefKind::Runtime);
    }
    if target.arch.is_none() {
        target.arch = arch.map(ToOwned::to_owned);
    }
    Ok(target)
}

// Run blocking engine work on a worker thread, wiring Ctrl-C to the
// cancellation token.
async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let cancel2 = cancel.clone();
    let ctrlc = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel2.cancel();
        }
    });
    let r = tokio::task::spawn_blocking(move || f(&cancel)).await;
    ctrlc.abort();
    r.map_err(|e| anyhow!("worker thread panicked: {e}"))?
}

fn summary_exit(summary: TransactionSummary, skip_if_unchanged: bool) -> i32 {
    if skip_if_unchanged && summary == TransactionSummary::default() {
        EXIT_SKIPPED
    } else {
        0
    }
}

async fn install(opts: InstallOpts) -> Result<i32> {
    run_blocking(move |cancel| {
        let installation = opts.location.installation()?;
        let flags = TransactionFlags {
            no_pull: opts.no_pull,
            no_deploy: opts.no_deploy,
            no_static_deltas: opts.no_static_deltas,
            disable_related: opts.no_related,
            disable_dependencies: opts.no_deps,
            reinstall: opts.reinstall,
            disable_interaction: opts.interaction.noninteractive,
            default_arch: opts.arch.clone(),
            ..Default::default()
        };
        let mut txn = Transaction::new(&installation, flags, opts.interaction.frontend())
            .with_other_installations(opts.location.others());
        if opts.bundle {
            let keys = match &opts.gpg_file {
                Some(p) => vec![std::fs::read(p.as_std_path())
                    .with_context(|| format!("Reading {p}"))?],
                None => Vec::new(),
            };
            for path in &opts.targets {
                txn.add_install_bundle(Utf8PathBuf::from(path), keys.clone());
            }
        } else if opts.from {
            for path in &opts.targets {
                let data = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
                txn.add_install_from_description(&data)?;
            }
        } else {
            // `install REMOTE REF...` when the first argument names a
            // configured remote, plain `install REF...` otherwise
            let (remote, refs) = match opts.targets.split_first() {
                Some((first, rest))
                    if !rest.is_empty() && installation.load_remote(first).is_ok() =>
                {
                    (Some(first.clone()), rest.to_vec())
                }
                _ => (None, opts.targets.clone()),
            };
            for raw in &refs {
                let target =
                    parse_target(raw, opts.app, opts.runtime, opts.arch.as_deref())?;
                txn.add_install(remote.clone(), target, opts.subpaths.clone());
            }
        }
        let summary = txn.run(cancel)?;
        Ok(summary_exit(summary, opts.skip_if_unchanged))
    })
    .await
}

async fn uninstall(opts: UninstallOpts) -> Result<i32> {
    run_blocking(move |cancel| {
        let installation = opts.location.installation()?;
        let flags = TransactionFlags {
            disable_related: opts.no_related,
            keep_ref: opts.keep_ref,
            force_uninstall: opts.force_remove,
            disable_interaction: opts.interaction.noninteractive,
            default_arch: opts.arch.clone(),
            ..Default::default()
        };
        let mut targets: Vec<PartialRef> = Vec::new();
        if opts.all {
            for r in installation.list_installed_refs()? {
                targets.push(PartialRef::parse(r.as_str())?);
            }
        } else if opts.unused {
            let unused = installation.list_unused_refs()?;
            if unused.is_empty() {
                println!("Nothing unused to uninstall");
                return Ok(0);
            }
            for r in unused {
                targets.push(PartialRef::parse(r.as_str())?);
            }
        } else {
            if opts.targets.is_empty() {
                return Err(anyhow!("No refs given; see --all and --unused"));
            }
            for raw in &opts.targets {
                targets.push(parse_target(
                    raw,
                    opts.app,
                    opts.runtime,
                    opts.arch.as_deref(),
                )?);
            }
        }
        let mut txn = Transaction::new(&installation, flags, opts.interaction.frontend())
            .with_other_installations(opts.location.others());
        let ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        for t in targets {
            txn.add_uninstall(t);
        }
        txn.run(cancel)?;
        if opts.delete_data {
            for id in ids {
                let data_dir = installation.path().join("data").join(&id);
                if data_dir.exists() {
                    std::fs::remove_dir_all(data_dir.as_std_path())
                        .with_context(|| format!("Removing data for {id}"))?;
                }
            }
        }
        Ok(0)
    })
    .await
}

async fn update(opts: UpdateOpts) -> Result<i32> {
    run_blocking(move |cancel| {
        let installation = opts.location.installation()?;
        let flags = TransactionFlags {
            no_pull: opts.no_pull,
            no_deploy: opts.no_deploy,
            no_static_deltas: opts.no_static_deltas,
            disable_related: opts.no_related,
            disable_dependencies: opts.no_deps,
            disable_interaction: opts.interaction.noninteractive,
            default_arch: opts.arch.clone(),
            ..Default::default()
        };
        let commit = opts
            .commit
            .as_deref()
            .map(ObjectId::parse)
            .transpose()
            .context("Parsing --commit")?;
        if commit.is_some() && opts.targets.len() != 1 {
            return Err(anyhow!("--commit requires exactly one REF"));
        }
        let mut txn = Transaction::new(&installation, flags, opts.interaction.frontend())
            .with_other_installations(opts.location.others());
        if opts.targets.is_empty() {
            for r in installation.list_installed_refs()? {
                txn.add_update(PartialRef::parse(r.as_str())?, None);
            }
        } else {
            for raw in &opts.targets {
                let target =
                    parse_target(raw, opts.app, opts.runtime, opts.arch.as_deref())?;
                txn.add_update(target, commit.clone());
            }
        }
        if txn.is_empty() {
            println!("Nothing to update");
            return Ok(summary_exit(
                TransactionSummary::default(),
                opts.skip_if_unchanged,
            ));
        }
        let summary = txn.run(cancel)?;
        Ok(summary_exit(summary, opts.skip_if_unchanged))
    })
    .await
}

async fn preinstall_cmd(opts: PreinstallOpts) -> Result<i32> {
    run_blocking(move |cancel| {
        let installation = opts.location.installation()?;
        let summary = preinstall::sync(
            &installation,
            &opts.list_dir,
            opts.sideload_repos.clone(),
            opts.include_sdk,
            opts.include_debug,
            cancel,
        )?;
        if summary == TransactionSummary::default() {
            println!("Nothing to preinstall");
        }
        Ok(0)
    })
    .await
}

async fn repair_cmd(opts: RepairCliOpts) -> Result<i32> {
    run_blocking(move |cancel| {
        let installation = opts.location.installation()?;
        let frontend = InteractiveFrontend::new(true);
        let result = repair(
            &installation,
            &frontend,
            &RepairOptions {
                dry_run: opts.dry_run,
                reinstall_appstream: opts.reinstall_all,
            },
            cancel,
        )?;
        let verb = if result.dry_run { "would be" } else { "were" };
        println!(
            "{} mirror refs, {} undeployed refs and {} damaged refs {verb} removed",
            result.mirror_refs_removed,
            result.refs_swept.len(),
            result.refs_deleted.len(),
        );
        if result.invalid_objects > 0 {
            println!("{} corrupt objects {verb} deleted", result.invalid_objects);
        }
        if !result.reinstalled.is_empty() {
            println!(
                "{} deployments {verb} re-materialized",
                result.reinstalled.len()
            );
        }
        Ok(0)
    })
    .await
}

fn config_cmd(opts: ConfigOpts) -> Result<i32> {
    let installation = opts.location.installation()?;
    if opts.list {
        for (k, v) in config::list(&installation)? {
            println!("{k}={v}");
        }
        return Ok(0);
    }
    if opts.get {
        let key = opts.args.first().ok_or_else(|| anyhow!("--get needs KEY"))?;
        match config::get(&installation, key)? {
            Some(v) => println!("{v}"),
            None => println!(),
        }
        return Ok(0);
    }
    if opts.set {
        let [key, value]: [&String; 2] = opts
            .args
            .iter()
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow!("--set needs KEY VALUE"))?;
        config::set(&installation, key, value)?;
        return Ok(0);
    }
    if opts.unset {
        let key = opts.args.first().ok_or_else(|| anyhow!("--unset needs KEY"))?;
        config::unset(&installation, key)?;
        return Ok(0);
    }
    Err(anyhow!("One of --list, --get, --set, --unset is required"))
}

fn list_cmd(opts: ListOpts) -> Result<i32> {
    let installation = opts.location.installation()?;
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(vec!["Ref", "Origin", "Commit", "Installed"]);
    for r in installation.list_installed_refs()? {
        if opts.app && !r.is_app() {
            continue;
        }
        if opts.runtime && !r.is_runtime() {
            continue;
        }
        if opts.arch.as_deref().is_some_and(|a| a != r.arch()) {
            continue;
        }
        let data = installation.load_deploy_data(&r)?;
        let commit_short: String = data.commit.as_str().chars().take(12).collect();
        table.add_row(vec![
            r.to_string(),
            data.origin,
            commit_short,
            HumanBytes(data.installed_size).to_string(),
        ]);
    }
    println!("{table}");
    Ok(0)
}

fn info_cmd(opts: InfoOpts) -> Result<i32> {
    let installation = opts.location.installation()?;
    let target = PartialRef::parse(&opts.target)?;
    let matches: Vec<Ref> = installation
        .list_installed_refs()?
        .into_iter()
        .filter(|r| target.matches(r))
        .collect();
    let r = match matches.as_slice() {
        [] => return Err(Error::NotInstalled(opts.target.clone()).into()),
        [one] => one,
        _ => return Err(Error::AmbiguousRef(opts.target.clone()).into()),
    };
    let data = installation.load_deploy_data(r)?;
    println!("Ref: {r}");
    println!("Origin: {}", data.origin);
    println!("Commit: {}", data.commit);
    if !data.subpaths.is_empty() {
        println!("Subpaths: {}", data.subpaths.join(" "));
    }
    println!("Installed size: {}", HumanBytes(data.installed_size));
    if let Some(rt) = &data.runtime_ref {
        println!("Runtime: {rt}");
    }
    if let Some(sdk) = &data.sdk_ref {
        println!("Sdk: {sdk}");
    }
    Ok(0)
}

fn pin_cmd(opts: PinOpts) -> Result<i32> {
    let installation = opts.location.installation()?;
    if opts.targets.is_empty() {
        for r in installation.list_pinned_refs()? {
            println!("{r}");
        }
        return Ok(0);
    }
    for raw in &opts.targets {
        let r = Ref::parse(raw)?;
        let changed = installation.set_pinned(&r, !opts.unpin)?;
        if !changed {
            println!(
                "{r} was already {}",
                if opts.unpin { "unpinned" } else { "pinned" }
            );
        }
    }
    Ok(0)
}

fn remote_list_cmd(opts: RemoteListOpts) -> Result<i32> {
    let installation = opts.location.installation()?;
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(vec!["Name", "Url", "Collection", "State"]);
    for r in installation.list_remotes()? {
        table.add_row(vec![
            r.name,
            r.url,
            r.collection_id.unwrap_or_else(|| "-".into()),
            if r.disabled { "disabled" } else { "enabled" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(0)
}

fn repo_info_cmd(location: LocationOpts) -> Result<i32> {
    let installation = location.installation()?;
    let Some(store) = installation.maybe_ensure_repo()? else {
        println!("No repository initialized");
        return Ok(0);
    };
    let refs = store.list_refs(None)?;
    let objects = store.list_objects()?;
    println!("Refs: {}", refs.len());
    println!("Objects: {}", objects.len());
    for (key, commit) in refs {
        println!("{key} {commit}");
    }
    Ok(0)
}

/// Parse the command line and run it; returns the process exit code.
pub async fn run_from_iter<I, T>(args: I) -> Result<i32>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    match opt {
        Opt::Install(opts) => install(opts).await,
        Opt::Uninstall(opts) => uninstall(opts).await,
        Opt::Update(opts) => update(opts).await,
        Opt::Preinstall(opts) => preinstall_cmd(opts).await,
        Opt::Repair(opts) => repair_cmd(opts).await,
        Opt::Config(opts) => config_cmd(opts),
        Opt::List(opts) => list_cmd(opts),
        Opt::Info(opts) => info_cmd(opts),
        Opt::Pin(opts) => pin_cmd(opts),
        Opt::RemoteList(opts) => remote_list_cmd(opts),
        Opt::Internals(InternalsOpts::RepoInfo { location }) => repo_info_cmd(location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_install() {
        let opt = Opt::parse_from([
            "appdepot",
            "install",
            "--user",
            "-y",
            "origin",
            "org.acme.Draw",
        ]);
        let Opt::Install(opts) = opt else {
            panic!("wrong verb")
        };
        assert!(opts.location.user);
        assert!(opts.interaction.assumeyes);
        assert_eq!(opts.targets, vec!["origin", "org.acme.Draw"]);
    }

    #[test]
    fn test_parse_uninstall_unused() {
        let opt = Opt::parse_from(["appdepot", "uninstall", "--unused", "--noninteractive"]);
        let Opt::Uninstall(opts) = opt else {
            panic!("wrong verb")
        };
        assert!(opts.unused);
        assert!(opts.interaction.noninteractive);
        assert!(opts.targets.is_empty());
    }

    #[test]
    fn test_parse_update_alias() {
        let opt = Opt::parse_from(["appdepot", "upgrade"]);
        assert!(matches!(opt, Opt::Update(_)));
    }

    #[test]
    fn test_parse_target_kinds() {
        let t = parse_target("org.acme.Draw", true, false, Some("x86_64")).unwrap();
        assert_eq!(t.kind, Some(RefKind::App));
        assert_eq!(t.arch.as_deref(), Some("x86_64"));
        // An explicit kind prefix survives
        let t = parse_target("runtime/org.acme.Platform", false, false, None).unwrap();
        assert_eq!(t.kind, Some(RefKind::Runtime));
    }
}
