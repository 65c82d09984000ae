//! Preinstall sync: materialize the set of refs the OS declares as
//! required, quietly.
//!
//! The list is one keyfile per entry under `preinstall.d`:
//!
//! ```ini
//! [Preinstall]
//! Ref=app/org.acme.Base
//! Branch=stable
//! ```

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::frontend::QuietFrontend;
use crate::installation::Installation;
use crate::refname::PartialRef;
use crate::transaction::{Transaction, TransactionFlags, TransactionSummary};

/// The default OS-provided preinstall list location.
pub const DEFAULT_DIR: &str = "/usr/share/appdepot/preinstall.d";

/// Read every preinstall entry under `dir`; a missing directory is an
/// empty list.
#[context("Loading preinstall entries from {dir}")]
pub fn load_entries(dir: &Utf8Path) -> Result<Vec<PartialRef>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir.as_std_path()) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("Reading {dir}")),
    };
    let mut paths: Vec<Utf8PathBuf> = Vec::new();
    for ent in entries {
        let ent = ent?;
        let path = Utf8PathBuf::try_from(ent.path()).context("Non-UTF8 entry")?;
        if path.extension() == Some("preinstall") {
            paths.push(path);
        }
    }
    paths.sort();
    for path in paths {
        let contents = std::fs::read_to_string(path.as_std_path())
            .with_context(|| format!("Reading {path}"))?;
        let ini = tini::Ini::from_string(&contents)
            .with_context(|| format!("Parsing {path}"))?;
        let refname: String = ini
            .get("Preinstall", "Ref")
            .ok_or_else(|| anyhow!("{path}: missing Ref field"))?;
        let mut target = PartialRef::parse(&refname).with_context(|| format!("In {path}"))?;
        if target.branch.is_none() {
            target.branch = ini.get("Preinstall", "Branch");
        }
        if target.arch.is_none() {
            target.arch = ini.get("Preinstall", "Arch");
        }
        out.push(target);
    }
    Ok(out)
}

/// Install every declared ref that is missing, through the quiet
/// frontend. Sideload repositories given on the command line are
/// preferred over the network.
#[context("Preinstall sync")]
pub fn sync(
    installation: &Installation,
    list_dir: &Utf8Path,
    extra_sideloads: Vec<Utf8PathBuf>,
    include_sdk: bool,
    include_debug: bool,
    cancel: &CancellationToken,
) -> Result<TransactionSummary> {
    let entries = load_entries(list_dir)?;
    if entries.is_empty() {
        tracing::debug!("no preinstall entries");
        return Ok(TransactionSummary::default());
    }
    let flags = TransactionFlags {
        disable_interaction: true,
        auto_install_sdk: include_sdk,
        auto_install_debug: include_debug,
        ..Default::default()
    };
    let mut txn = Transaction::new(installation, flags, Box::new(QuietFrontend))
        .with_extra_sideloads(extra_sideloads);
    txn.add_sync_preinstalled(&entries)?;
    if txn.is_empty() {
        tracing::debug!("preinstall set already satisfied");
        return Ok(TransactionSummary::default());
    }
    txn.run(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;

    #[test]
    fn test_load_entries() {
        let fx = Fixture::new().unwrap();
        let dir = fx.path.join("preinstall.d");
        std::fs::create_dir_all(dir.as_std_path()).unwrap();
        std::fs::write(
            dir.join("base.preinstall").as_std_path(),
            "[Preinstall]\nRef=app/org.acme.Base\nBranch=stable\n",
        )
        .unwrap();
        std::fs::write(dir.join("README").as_std_path(), "not an entry").unwrap();
        let entries = load_entries(&dir).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "org.acme.Base");
        assert_eq!(entries[0].branch.as_deref(), Some("stable"));
        // Missing directory is an empty list
        assert!(load_entries(&fx.path.join("nope")).unwrap().is_empty());
    }
}
