//! Single-file bundles and ref description files.
//!
//! A bundle is a self-contained static delta against the empty commit,
//! signed, carried as one file. A ref description (`.appref`) is a
//! small keyfile pointing at a remote-hosted ref.

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::refname::Ref;
use crate::store::pull::sign_payload;
use crate::store::{ObjectId, StaticDelta};

/// A single-file bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// The ref this bundle deploys.
    pub refname: Ref,
    /// URL of the repository that published the bundle, used to set up
    /// an origin remote for later updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    /// URL of a repository carrying the runtime, for dependency
    /// resolution hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_repo: Option<String>,
    /// Detached signature over the target commit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// The payload: every object of the target commit.
    pub delta: StaticDelta,
}

impl Bundle {
    /// Load a bundle file.
    #[context("Loading bundle {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let data = std::fs::read(path.as_std_path())
            .with_context(|| format!("Reading {path}"))?;
        let bundle: Bundle = serde_json::from_slice(&data).context("Parsing bundle")?;
        if bundle.delta.from.is_some() {
            return Err(anyhow!("Bundle delta must be self-contained"));
        }
        Ok(bundle)
    }

    /// Serialize to a bundle file.
    #[context("Writing bundle {path}")]
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        let data = serde_json::to_vec(self).context("Serializing bundle")?;
        std::fs::write(path.as_std_path(), data).with_context(|| format!("Writing {path}"))?;
        Ok(())
    }

    /// The commit the bundle deploys.
    pub fn commit(&self) -> &ObjectId {
        &self.delta.to
    }

    /// Verify the bundle signature against a set of trusted keys.
    pub fn verify(&self, trusted_keys: &[Vec<u8>]) -> Result<bool> {
        let Some(signature) = &self.signature else {
            return Ok(false);
        };
        for key in trusted_keys {
            if sign_payload(key, self.commit().as_str().as_bytes())? == *signature {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sign the bundle with a key (publisher side).
    pub fn sign(&mut self, key: &[u8]) -> Result<()> {
        self.signature = Some(sign_payload(key, self.delta.to.as_str().as_bytes())?);
        Ok(())
    }
}

/// A parsed ref description file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDescription {
    /// Application or runtime id.
    pub name: String,
    /// Branch, when given.
    pub branch: Option<String>,
    /// Repository URL to install from.
    pub url: String,
    /// Optional URL of a repository carrying the runtime.
    pub runtime_repo: Option<String>,
    /// Whether the described ref is a runtime.
    pub is_runtime: bool,
    /// Optional human-readable title.
    pub title: Option<String>,
}

impl RefDescription {
    const SECTION: &'static str = "Depot Ref";

    /// Parse the keyfile bytes of a description.
    #[context("Parsing ref description")]
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).context("Description is not UTF-8")?;
        let ini = tini::Ini::from_string(text).context("Parse to ini")?;
        let name: String = ini
            .get(Self::SECTION, "Name")
            .ok_or_else(|| anyhow!("Missing Name field"))?;
        let url: String = ini
            .get(Self::SECTION, "Url")
            .ok_or_else(|| anyhow!("Missing Url field"))?;
        Ok(Self {
            name,
            branch: ini.get(Self::SECTION, "Branch"),
            url,
            runtime_repo: ini.get(Self::SECTION, "RuntimeRepo"),
            is_runtime: ini.get(Self::SECTION, "IsRuntime").unwrap_or(false),
            title: ini.get(Self::SECTION, "Title"),
        })
    }

    /// Serialize back to keyfile form.
    pub fn to_ini(&self) -> String {
        let mut out = format!("[{}]\nName={}\nUrl={}\n", Self::SECTION, self.name, self.url);
        if let Some(b) = &self.branch {
            out.push_str(&format!("Branch={b}\n"));
        }
        if let Some(r) = &self.runtime_repo {
            out.push_str(&format!("RuntimeRepo={r}\n"));
        }
        if self.is_runtime {
            out.push_str("IsRuntime=true\n");
        }
        if let Some(t) = &self.title {
            out.push_str(&format!("Title={t}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_description_parse() {
        let d = RefDescription::parse(
            indoc! {"
            [Depot Ref]
            Name=org.acme.Draw
            Branch=stable
            Url=https://apps.acme.org/repo
            RuntimeRepo=https://runtimes.acme.org/repo
            Title=Acme Draw
        "}
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(d.name, "org.acme.Draw");
        assert_eq!(d.branch.as_deref(), Some("stable"));
        assert!(!d.is_runtime);
        assert_eq!(RefDescription::parse(d.to_ini().as_bytes()).unwrap(), d);
    }

    #[test]
    fn test_description_requires_fields() {
        assert!(RefDescription::parse(b"[Depot Ref]\nName=x\n").is_err());
        assert!(RefDescription::parse(b"[Depot Ref]\nUrl=x\n").is_err());
        assert!(RefDescription::parse(&[0xff, 0xfe]).is_err());
    }
}
