//! Remote configuration and the per-transaction remote state snapshot.
//!
//! The persistent configuration is one keyfile per remote under the
//! installation's `remotes.d/`. The ephemeral [`RemoteState`] is built
//! once at transaction start from the remote's signed summary and is
//! immutable (and freely shareable) for the transaction's lifetime.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::refname::{PartialRef, Ref};
use crate::store::pull::{with_retries, RepoBackend};
use crate::store::{ObjectId, ObjectStore};
use crate::Error;

/// Persistent configuration of one remote.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    /// Remote name.
    pub name: String,
    /// Repository location (`file://...` or a transport URL).
    pub url: String,
    /// Collection id, required for sideload matching.
    pub collection_id: Option<String>,
    /// Whether the summary signature must verify.
    pub gpg_verify: bool,
    /// Client-side trust anchor for the summary signature.
    pub trusted_key: Option<String>,
    /// Branch used when a ref argument omits one.
    pub default_branch: Option<String>,
    /// Ref ids hidden from resolution.
    pub filter: Vec<String>,
    /// Remote is configured but must not be used.
    pub disabled: bool,
    /// Local object sources searched before the network.
    pub sideload_dirs: Vec<Utf8PathBuf>,
}

impl RemoteConfig {
    const SECTION: &'static str = "Remote";

    /// Parse a `remotes.d` keyfile.
    #[context("Parsing remote {name}")]
    pub fn parse(name: &str, contents: &str) -> Result<Self> {
        let ini = tini::Ini::from_string(contents).context("Parse to ini")?;
        let url: String = ini
            .get(Self::SECTION, "Url")
            .ok_or_else(|| anyhow::anyhow!("Missing Url field"))?;
        let filter = ini
            .get::<String>(Self::SECTION, "Filter")
            .map(|f| {
                f.split(';')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let sideload_dirs = ini
            .get::<String>(Self::SECTION, "SideloadDirs")
            .map(|f| {
                f.split(';')
                    .filter(|s| !s.is_empty())
                    .map(Utf8PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name: name.to_string(),
            url,
            collection_id: ini.get(Self::SECTION, "CollectionId"),
            gpg_verify: ini.get(Self::SECTION, "GpgVerify").unwrap_or(false),
            trusted_key: ini.get(Self::SECTION, "TrustedKey"),
            default_branch: ini.get(Self::SECTION, "DefaultBranch"),
            filter,
            disabled: ini.get(Self::SECTION, "Disabled").unwrap_or(false),
            sideload_dirs,
        })
    }

    /// Serialize to the `remotes.d` keyfile form.
    pub fn to_ini(&self) -> String {
        let mut out = format!("[{}]\nUrl={}\n", Self::SECTION, self.url);
        if let Some(c) = &self.collection_id {
            out.push_str(&format!("CollectionId={c}\n"));
        }
        if self.gpg_verify {
            out.push_str("GpgVerify=true\n");
        }
        if let Some(k) = &self.trusted_key {
            out.push_str(&format!("TrustedKey={k}\n"));
        }
        if let Some(b) = &self.default_branch {
            out.push_str(&format!("DefaultBranch={b}\n"));
        }
        if !self.filter.is_empty() {
            out.push_str(&format!("Filter={}\n", self.filter.join(";")));
        }
        if self.disabled {
            out.push_str("Disabled=true\n");
        }
        if !self.sideload_dirs.is_empty() {
            let dirs: Vec<&str> = self.sideload_dirs.iter().map(|p| p.as_str()).collect();
            out.push_str(&format!("SideloadDirs={}\n", dirs.join(";")));
        }
        out
    }
}

/// A related ref declared by a primary ref's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedRef {
    /// Full ref string of the related ref.
    pub refname: String,
    /// Whether installs of the primary should also fetch this.
    #[serde(default = "default_true")]
    pub should_download: bool,
    /// Whether uninstalls of the primary should also remove this.
    #[serde(default = "default_true")]
    pub delete_with_primary: bool,
    /// Whether the unused-sweep may remove it once the primary is gone.
    #[serde(default)]
    pub autoprune: bool,
    /// Subpaths to restrict the related deployment to.
    #[serde(default)]
    pub subpaths: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Per-ref entry of a remote's summary index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRef {
    /// Commit the ref currently points at.
    pub commit: ObjectId,
    /// Estimated transfer size.
    pub download_size: u64,
    /// Estimated checkout size.
    pub installed_size: u64,
    /// Runtime required by this (app) ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_ref: Option<String>,
    /// Sdk recorded for this (app) ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_ref: Option<String>,
    /// Related refs declared by this primary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<RelatedRef>,
    /// Application metadata blob.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Sparse per-ref cache: end-of-life markers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseRefInfo {
    /// Human-readable end-of-life reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol: Option<String>,
    /// Full ref string of the successor ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eol_rebase: Option<String>,
}

/// The signed summary payload a remote publishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    /// Collection id of the publishing repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Index of published refs.
    #[serde(default)]
    pub refs: BTreeMap<String, SummaryRef>,
    /// Sparse metadata keyed by ref.
    #[serde(default)]
    pub sparse: BTreeMap<String, SparseRefInfo>,
}

/// A local object source used before the network.
#[derive(Debug)]
pub struct SideloadSource {
    /// Where the medium is mounted.
    pub path: Utf8PathBuf,
    /// Its object store.
    pub store: ObjectStore,
    /// Collection id, from the sideload's own (unverified) summary.
    pub collection_id: Option<String>,
    key: Option<Vec<u8>>,
}

impl SideloadSource {
    /// Open a sideload repository directory.
    #[context("Opening sideload {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let store = ObjectStore::open(path)?;
        let collection_id = match store.dir().read("summary") {
            Ok(data) => serde_json::from_slice::<Summary>(&data)
                .ok()
                .and_then(|s| s.collection_id),
            Err(_) => None,
        };
        let key = match store.dir().read("key") {
            Ok(k) => Some(k),
            Err(_) => None,
        };
        Ok(Self {
            path: path.to_owned(),
            store,
            collection_id,
            key,
        })
    }

    /// Verify a summary signature against this sideload's own key set.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let Some(key) = &self.key else {
            return Ok(false);
        };
        let expected = crate::store::pull::sign_payload(key, payload)?;
        Ok(expected.as_bytes() == signature)
    }

    /// Read the sideload's own summary, if it carries one.
    pub fn read_summary(&self) -> Result<Option<Summary>> {
        match self.store.dir().read("summary") {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("Reading sideload summary"),
        }
    }
}

/// Immutable per-remote snapshot used for one transaction.
#[derive(Debug)]
pub struct RemoteState {
    /// Remote name.
    pub name: String,
    /// Collection id from the verified summary (or configuration).
    pub collection_id: Option<String>,
    /// Branch used when a ref argument omits one.
    pub default_branch: Option<String>,
    /// Per-ref index.
    pub refs: BTreeMap<String, SummaryRef>,
    /// Sparse per-ref metadata (EOL markers).
    pub sparse: BTreeMap<String, SparseRefInfo>,
    /// Sideload sources whose collection matches this remote.
    pub sideloads: Vec<SideloadSource>,
    backend: Box<dyn RepoBackend>,
}

impl RemoteState {
    /// Build the frozen state for one remote: load and verify the
    /// summary (falling back to matching sideloads when the network is
    /// unavailable) and open sideload sources.
    #[context("Loading state of remote {}", config.name)]
    pub fn build(
        config: &RemoteConfig,
        backend: Box<dyn RepoBackend>,
        extra_sideload_dirs: &[Utf8PathBuf],
    ) -> Result<Self> {
        if config.disabled {
            return Err(Error::RemoteDisabled(config.name.clone()).into());
        }

        let mut sideloads = Vec::new();
        for dir in config.sideload_dirs.iter().chain(extra_sideload_dirs) {
            match SideloadSource::open(dir) {
                Ok(s) => sideloads.push(s),
                Err(e) => tracing::warn!("Skipping sideload {dir}: {e:#}"),
            }
        }
        // Only sideloads carrying this remote's collection participate
        if let Some(cid) = &config.collection_id {
            sideloads.retain(|s| s.collection_id.as_deref() == Some(cid.as_str()));
        }

        let fetched = with_retries("fetching summary", || backend.fetch_summary());
        let (payload, signature, from_sideload) = match fetched {
            Ok((p, s)) => (p, s, false),
            Err(e) => {
                // Network gone: any matching sideload summary will do
                let mut found = None;
                for s in &sideloads {
                    if let Ok(data) = s.store.dir().read("summary") {
                        let sig = s.store.dir().read("summary.sig").ok();
                        found = Some((data, sig, true));
                        break;
                    }
                }
                match found {
                    Some(f) => f,
                    None => return Err(e),
                }
            }
        };

        if config.gpg_verify {
            let signature = signature
                .as_deref()
                .ok_or_else(|| Error::GpgUntrusted(config.name.clone()))?;
            let mut ok = backend.verify(&payload, signature)?;
            if !ok && from_sideload {
                for s in &sideloads {
                    if s.verify(&payload, signature)? {
                        ok = true;
                        break;
                    }
                }
            }
            if !ok {
                return Err(Error::GpgUntrusted(config.name.clone()).into());
            }
        }

        let summary: Summary = serde_json::from_slice(&payload).context("Parsing summary")?;
        let mut refs = summary.refs;
        if !config.filter.is_empty() {
            refs.retain(|refname, _| {
                !Ref::parse(refname)
                    .map(|r| config.filter.iter().any(|f| f == r.id()))
                    .unwrap_or(false)
            });
        }
        Ok(Self {
            name: config.name.clone(),
            collection_id: summary.collection_id.or_else(|| config.collection_id.clone()),
            default_branch: config.default_branch.clone(),
            refs,
            sparse: summary.sparse,
            sideloads,
            backend,
        })
    }

    /// The transport/trust backend for this remote.
    pub fn backend(&self) -> &dyn RepoBackend {
        self.backend.as_ref()
    }

    /// Look up one published ref.
    pub fn lookup_ref(&self, refname: &str) -> Option<&SummaryRef> {
        self.refs.get(refname)
    }

    /// Sparse metadata for one ref, if any.
    pub fn sparse_info(&self, refname: &str) -> Option<&SparseRefInfo> {
        self.sparse.get(refname)
    }

    /// All published refs matching a partial ref argument.
    pub fn matching_refs(&self, partial: &PartialRef) -> Vec<Ref> {
        let mut out = Vec::new();
        for refname in self.refs.keys() {
            if let Ok(r) = Ref::parse(refname) {
                if partial.matches(&r) {
                    out.push(match &self.collection_id {
                        Some(c) => r.with_collection(c),
                        None => r,
                    });
                }
            }
        }
        out
    }

    /// Sideload stores, for the pull path.
    pub fn sideload_stores(&self) -> Vec<&ObjectStore> {
        self.sideloads.iter().map(|s| &s.store).collect()
    }
}
