//! Object model for the content-addressed store.
//!
//! Four object kinds exist: commits, dirtrees, dirmetas and files.
//! Metadata objects serialize to canonical JSON; the object id is the
//! SHA-256 of the serialized bytes (for files, of the raw content).

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use openssl::hash::{hash, MessageDigest};
use serde::{Deserialize, Serialize};

/// The kind of a stored object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A commit naming one snapshot of one ref.
    Commit,
    /// A directory tree: named file and subdirectory entries.
    DirTree,
    /// Directory metadata: ownership, mode, xattrs.
    DirMeta,
    /// Raw file content.
    File,
}

impl ObjectKind {
    /// The on-disk object filename extension.
    pub fn ext(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::DirTree => "dirtree",
            ObjectKind::DirMeta => "dirmeta",
            ObjectKind::File => "file",
        }
    }

    /// Map a filename extension back to a kind. `filez` is accepted
    /// as a (legacy, compressed) file object spelling.
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "commit" => Some(ObjectKind::Commit),
            "dirtree" => Some(ObjectKind::DirTree),
            "dirmeta" => Some(ObjectKind::DirMeta),
            "file" | "filez" => Some(ObjectKind::File),
            _ => None,
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.ext())
    }
}

/// A content hash naming one object: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Box<str>);

impl ObjectId {
    /// Compute the id of the given object content.
    pub fn digest(data: &[u8]) -> Result<Self> {
        let d = hash(MessageDigest::sha256(), data).context("Hashing object")?;
        Ok(Self(hex::encode(d).into()))
    }

    /// Parse and validate a hex id.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(anyhow!("Invalid object id {s:?}"));
        }
        Ok(Self(s.into()))
    }

    /// The hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the two-character fanout prefix and the rest, the
    /// shape the objects directory is keyed by.
    pub fn fanout(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Root directory tree.
    pub tree: ObjectId,
    /// Root directory metadata.
    pub dirmeta: ObjectId,
    /// Parent commit, absent for the first commit of a ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ObjectId>,
    /// Commit time, seconds since the epoch.
    pub timestamp: i64,
    /// One-line summary.
    pub subject: String,
    /// Free-form body.
    #[serde(default)]
    pub body: String,
    /// Key/value metadata (runtime and sdk requirements, related refs,
    /// sizes, the app metadata blob).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Commit {
    /// Canonical serialized form (the bytes that are hashed).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Serializing commit")
    }

    /// Parse a serialized commit.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Parsing commit")
    }

    /// Look up a string-valued metadata key.
    pub fn metadata_string(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Mutable state attached to a commit outside its content hash.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CommitState {
    /// Set when subpaths were restricted at pull time; a partial commit
    /// may be missing objects outside the chosen subpaths.
    pub partial: bool,
}

/// A named file entry in a dirtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (no slashes).
    pub name: String,
    /// Content object.
    pub object: ObjectId,
    /// Unix mode bits for the checkout.
    pub mode: u32,
}

/// A named subdirectory entry in a dirtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (no slashes).
    pub name: String,
    /// The subdirectory's tree object.
    pub tree: ObjectId,
    /// The subdirectory's metadata object.
    pub meta: ObjectId,
}

/// A directory tree object. Entries are kept name-sorted so the
/// serialized form (and therefore the content hash) is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    /// File entries, sorted by name.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Subdirectory entries, sorted by name.
    #[serde(default)]
    pub dirs: Vec<DirEntry>,
}

impl DirTree {
    /// Canonical serialized form. Fails on unsorted or duplicate
    /// entries rather than silently hashing a non-canonical tree.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        for w in self.files.windows(2) {
            if w[0].name >= w[1].name {
                return Err(anyhow!("Unsorted dirtree file entry {:?}", w[1].name));
            }
        }
        for w in self.dirs.windows(2) {
            if w[0].name >= w[1].name {
                return Err(anyhow!("Unsorted dirtree dir entry {:?}", w[1].name));
            }
        }
        serde_json::to_vec(self).context("Serializing dirtree")
    }

    /// Parse a serialized dirtree.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Parsing dirtree")
    }

    /// Sort entries into canonical order.
    pub fn sort(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.dirs.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// A directory metadata object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Unix mode bits.
    pub mode: u32,
    /// Extended attributes.
    #[serde(default)]
    pub xattrs: BTreeMap<String, String>,
}

impl DirMeta {
    /// The conventional default for checkouts owned by the invoking user.
    pub fn default_dir() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: BTreeMap::new(),
        }
    }

    /// Canonical serialized form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Serializing dirmeta")
    }

    /// Parse a serialized dirmeta.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Parsing dirmeta")
    }
}

/// Result of checking one object's stored bytes against its id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectStatus {
    /// Present and content-addressed correctly.
    Ok,
    /// Not present in the store.
    Missing,
    /// Present but the stored bytes are corrupted.
    Invalid,
}
