//! Static deltas: precomputed object bundles shipping every object
//! needed to go from one commit (or from nothing) to another in a
//! single fetch.

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use super::{ObjectId, ObjectKind, ObjectStore};

mod hexdata {
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One object carried by a static delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object id the payload must hash to.
    pub id: ObjectId,
    /// Raw object bytes.
    #[serde(with = "hexdata")]
    pub data: Vec<u8>,
}

/// A static delta between two commits (`from == None` means a delta
/// from the empty commit, i.e. a self-contained payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDelta {
    /// Base commit, when this is an incremental delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ObjectId>,
    /// Target commit.
    pub to: ObjectId,
    /// Every object needed on top of `from`.
    pub objects: Vec<DeltaEntry>,
}

impl StaticDelta {
    /// The on-disk delta directory for a `(from, to)` pair, relative to
    /// the store root.
    pub fn relpath(from: Option<&ObjectId>, to: &ObjectId) -> Utf8PathBuf {
        let (t2, trest) = to.fanout();
        match from {
            Some(f) => {
                let (f2, frest) = f.fanout();
                format!("deltas/{f2}/{frest}-{t2}/{trest}").into()
            }
            None => format!("deltas/{t2}/{trest}").into(),
        }
    }

    /// Assemble a delta from a local store by walking `to` and skipping
    /// everything already reachable from `from`.
    #[context("Building static delta")]
    pub fn build(store: &ObjectStore, from: Option<&ObjectId>, to: &ObjectId) -> Result<Self> {
        let mut have = std::collections::HashSet::new();
        if let Some(from) = from {
            store.walk(from, &mut |kind, id| {
                have.insert((kind, id.clone()));
                Ok(true)
            })?;
        }
        let mut objects = Vec::new();
        store.walk(to, &mut |kind, id| {
            if !have.contains(&(kind, id.clone())) {
                objects.push(DeltaEntry {
                    kind,
                    id: id.clone(),
                    data: store.read_object(kind, id)?,
                });
            }
            Ok(true)
        })?;
        Ok(Self {
            from: from.cloned(),
            to: to.clone(),
            objects,
        })
    }

    /// Serialize into the given store's delta directory.
    pub fn write_to(&self, store: &ObjectStore) -> Result<()> {
        let dir = Self::relpath(self.from.as_ref(), &self.to);
        store.dir().create_dir_all(&dir)?;
        let data = serde_json::to_vec(self).context("Serializing delta")?;
        use cap_std_ext::dirext::CapStdExtDirExt;
        store
            .dir()
            .atomic_write(dir.join("superblock"), &data)
            .context("Writing delta superblock")?;
        Ok(())
    }

    /// Load a delta from a store's delta directory, `None` when absent.
    pub fn load_from(
        store: &ObjectStore,
        from: Option<&ObjectId>,
        to: &ObjectId,
    ) -> Result<Option<Self>> {
        let p = Self::relpath(from, to).join("superblock");
        match store.dir().read(&p) {
            Ok(data) => Ok(Some(
                serde_json::from_slice(&data).context("Parsing delta superblock")?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {p}")),
        }
    }

    /// Unpack every carried object into the store, verifying content
    /// addresses, and return the number of objects written.
    #[context("Applying static delta")]
    pub fn apply(&self, store: &ObjectStore) -> Result<u64> {
        if let Some(from) = &self.from {
            if !store.has_object(ObjectKind::Commit, from)? {
                return Err(anyhow!("Delta base commit {from} not present"));
            }
        }
        let mut n = 0;
        for entry in &self.objects {
            store.write_object_checked(entry.kind, &entry.id, &entry.data)?;
            n += 1;
        }
        if !store.has_object(ObjectKind::Commit, &self.to)? {
            return Err(anyhow!("Delta did not carry its target commit {}", self.to));
        }
        Ok(n)
    }
}
