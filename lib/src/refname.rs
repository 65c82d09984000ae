//! Canonical identity of an installable object.
//!
//! A ref names one deployable object as `kind/id/arch/branch`, e.g.
//! `app/org.acme.Draw/x86_64/stable`. The parsed form keeps the
//! original string plus cached component offsets; comparisons are
//! defined on the components, never on the raw string.

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::Error;

/// Kinds of installable objects.
///
/// The derived ordering deliberately sorts runtimes first; plan
/// linearization relies on that for its stable tie-break.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    /// A shared runtime image.
    Runtime,
    /// An application image.
    App,
}

impl RefKind {
    /// The string form used in refs and on-disk paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Runtime => "runtime",
            RefKind::App => "app",
        }
    }
}

impl FromStr for RefKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "app" => Ok(RefKind::App),
            "runtime" => Ok(RefKind::Runtime),
            o => Err(Error::InvalidRef {
                reference: o.to_string(),
                reason: "kind must be app or runtime".to_string(),
            }),
        }
    }
}

impl Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap())
}

fn branch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Branches additionally may not lead with a separator character
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap())
}

fn validate_component(input: &str, component: &str, part: &str) -> Result<(), Error> {
    if part.is_empty() {
        return Err(Error::InvalidRef {
            reference: input.to_string(),
            reason: format!("empty {component}"),
        });
    }
    if !component_re().is_match(part) {
        return Err(Error::InvalidRef {
            reference: input.to_string(),
            reason: format!("forbidden characters in {component} {part:?}"),
        });
    }
    Ok(())
}

fn validate_branch(part: &str) -> Result<(), Error> {
    if !branch_re().is_match(part) {
        return Err(Error::InvalidBranch(part.to_string()));
    }
    Ok(())
}

/// A fully-resolved `(kind, id, arch, branch)` ref, optionally carrying
/// the collection id it was found under.
#[derive(Debug, Clone)]
pub struct Ref {
    // Invariant: full is "kind/id/arch/branch" with seps at the slashes
    full: Box<str>,
    kind: RefKind,
    seps: [u16; 3],
    collection: Option<Box<str>>,
}

impl Ref {
    /// Parse a full `kind/id/arch/branch` string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.len() > usize::from(u16::MAX) {
            return Err(Error::InvalidRef {
                reference: s.chars().take(64).collect(),
                reason: "ref too long".to_string(),
            });
        }
        let parts: Vec<&str> = s.split('/').collect();
        let [kind, id, arch, branch]: [&str; 4] = parts.try_into().map_err(|_| Error::InvalidRef {
            reference: s.to_string(),
            reason: "expected kind/id/arch/branch".to_string(),
        })?;
        let kind = RefKind::from_str(kind)?;
        validate_component(s, "id", id)?;
        validate_component(s, "arch", arch)?;
        validate_component(s, "branch", branch)?;
        validate_branch(branch)?;
        let s0 = kind.as_str().len() as u16;
        let s1 = s0 + 1 + id.len() as u16;
        let s2 = s1 + 1 + arch.len() as u16;
        Ok(Self {
            full: s.into(),
            kind,
            seps: [s0, s1, s2],
            collection: None,
        })
    }

    /// Construct from components, validating each.
    pub fn new(kind: RefKind, id: &str, arch: &str, branch: &str) -> Result<Self, Error> {
        Self::parse(&format!("{}/{id}/{arch}/{branch}", kind.as_str()))
    }

    /// Attach the collection id this ref was found under.
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// The canonical `kind/id/arch/branch` string.
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The ref kind.
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    /// The application or runtime id, e.g. `org.acme.Draw`.
    pub fn id(&self) -> &str {
        &self.full[usize::from(self.seps[0]) + 1..usize::from(self.seps[1])]
    }

    /// The architecture component.
    pub fn arch(&self) -> &str {
        &self.full[usize::from(self.seps[1]) + 1..usize::from(self.seps[2])]
    }

    /// The branch component.
    pub fn branch(&self) -> &str {
        &self.full[usize::from(self.seps[2]) + 1..]
    }

    /// The collection id, if one is attached.
    pub fn collection_id(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Whether this is an app ref.
    pub fn is_app(&self) -> bool {
        self.kind == RefKind::App
    }

    /// Whether this is a runtime ref.
    pub fn is_runtime(&self) -> bool {
        self.kind == RefKind::Runtime
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for Ref {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::parse(s)
    }
}

// Equality, ordering and hashing are on the decomposed tuple; the
// collection id is advisory and excluded.
impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Ref {}

impl PartialOrd for Ref {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ref {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.kind, self.id(), self.arch(), self.branch()).cmp(&(
            other.kind,
            other.id(),
            other.arch(),
            other.branch(),
        ))
    }
}

impl Hash for Ref {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.id().hash(state);
        self.arch().hash(state);
        self.branch().hash(state);
    }
}

impl serde::Serialize for Ref {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for Ref {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ref::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A partial ref argument: the shape of a ref with trailing components
/// optional, used to fan out matches over installed or published refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRef {
    /// Restrict to one kind, when the user passed `app/` / `runtime/`
    /// (or the equivalent command line flags).
    pub kind: Option<RefKind>,
    /// The (mandatory) id component.
    pub id: String,
    /// Restrict to one architecture.
    pub arch: Option<String>,
    /// Restrict to one branch.
    pub branch: Option<String>,
}

impl PartialRef {
    /// Parse a partial ref argument such as `org.acme.Draw`,
    /// `org.acme.Draw//beta` or `app/org.acme.Draw/x86_64/stable`.
    /// Empty middle components are wildcards.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut parts: Vec<&str> = s.split('/').collect();
        let kind = match parts.first() {
            Some(&"app") => {
                parts.remove(0);
                Some(RefKind::App)
            }
            Some(&"runtime") => {
                parts.remove(0);
                Some(RefKind::Runtime)
            }
            _ => None,
        };
        if parts.is_empty() || parts.len() > 3 {
            return Err(Error::InvalidRef {
                reference: s.to_string(),
                reason: "expected [kind/]id[/arch[/branch]]".to_string(),
            });
        }
        let id = parts[0];
        validate_component(s, "id", id)?;
        let arch = parts.get(1).filter(|a| !a.is_empty());
        if let Some(arch) = arch {
            validate_component(s, "arch", arch)?;
        }
        let branch = parts.get(2).filter(|b| !b.is_empty());
        if let Some(branch) = branch {
            validate_component(s, "branch", branch)?;
            validate_branch(branch)?;
        }
        Ok(Self {
            kind,
            id: id.to_string(),
            arch: arch.map(|a| a.to_string()),
            branch: branch.map(|b| b.to_string()),
        })
    }

    /// Whether the given ref satisfies every present component.
    pub fn matches(&self, r: &Ref) -> bool {
        if self.kind.is_some_and(|k| k != r.kind()) {
            return false;
        }
        if self.id != r.id() {
            return false;
        }
        if self.arch.as_deref().is_some_and(|a| a != r.arch()) {
            return false;
        }
        if self.branch.as_deref().is_some_and(|b| b != r.branch()) {
            return false;
        }
        true
    }

    /// Whether every component of the ref was given explicitly.
    pub fn is_exact(&self) -> bool {
        self.kind.is_some() && self.arch.is_some() && self.branch.is_some()
    }
}

impl Display for PartialRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(kind) = self.kind {
            write!(f, "{kind}/")?;
        }
        f.write_str(&self.id)?;
        match (self.arch.as_deref(), self.branch.as_deref()) {
            (Some(a), Some(b)) => write!(f, "/{a}/{b}"),
            (Some(a), None) => write!(f, "/{a}"),
            (None, Some(b)) => write!(f, "//{b}"),
            (None, None) => Ok(()),
        }
    }
}

/// The architecture of the running machine, in distribution naming.
pub fn default_arch() -> &'static str {
    std::env::consts::ARCH
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Ref: Send, Sync, Clone, Ord);

    const DRAW: &str = "app/org.acme.Draw/x86_64/stable";

    #[test]
    fn test_parse_roundtrip() {
        let r = Ref::parse(DRAW).unwrap();
        assert_eq!(r.kind(), RefKind::App);
        assert_eq!(r.id(), "org.acme.Draw");
        assert_eq!(r.arch(), "x86_64");
        assert_eq!(r.branch(), "stable");
        assert_eq!(r.to_string(), DRAW);
        assert!(r.is_app());
        assert!(!r.is_runtime());
        assert_eq!(r, Ref::new(RefKind::App, "org.acme.Draw", "x86_64", "stable").unwrap());
    }

    #[test]
    fn test_parse_invalid() {
        for bad in [
            "",
            "app",
            "app/org.x/x86_64",
            "app/org.x/x86_64/stable/extra",
            "application/org.x/x86_64/stable",
            "app//x86_64/stable",
            "app/org x/x86_64/stable",
            "app/org.x//stable",
        ] {
            assert!(Ref::parse(bad).is_err(), "should reject {bad:?}");
        }
        // Leading separator in the branch is specifically an invalid branch
        assert!(matches!(
            Ref::parse("app/org.x/x86_64/.hidden"),
            Err(Error::InvalidBranch(_))
        ));
    }

    #[test]
    fn test_ordering() {
        let app = Ref::parse(DRAW).unwrap();
        let rt = Ref::parse("runtime/org.acme.Platform/x86_64/24.08").unwrap();
        // Runtimes sort before apps
        assert!(rt < app);
        let a = Ref::parse("app/org.a.A/x86_64/stable").unwrap();
        let b = Ref::parse("app/org.b.B/x86_64/stable").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_collection_excluded_from_eq() {
        let plain = Ref::parse(DRAW).unwrap();
        let collected = Ref::parse(DRAW).unwrap().with_collection("org.acme.Apps");
        assert_eq!(plain, collected);
        assert_eq!(collected.collection_id(), Some("org.acme.Apps"));
        assert_eq!(plain.collection_id(), None);
    }

    #[test]
    fn test_partial_forms() {
        let r = Ref::parse(DRAW).unwrap();
        for (s, matched) in [
            ("org.acme.Draw", true),
            ("app/org.acme.Draw", true),
            ("runtime/org.acme.Draw", false),
            ("org.acme.Draw/x86_64", true),
            ("org.acme.Draw//stable", true),
            ("org.acme.Draw//beta", false),
            ("org.acme.Draw/i386", false),
            ("app/org.acme.Draw/x86_64/stable", true),
        ] {
            let p = PartialRef::parse(s).unwrap();
            assert_eq!(p.matches(&r), matched, "{s}");
            assert_eq!(p.to_string(), s);
        }
        assert!(PartialRef::parse("app/org.acme.Draw/x86_64/stable").unwrap().is_exact());
        assert!(!PartialRef::parse("org.acme.Draw").unwrap().is_exact());
    }

    #[test]
    fn test_serde() {
        let r = Ref::parse(DRAW).unwrap();
        let j = serde_json::to_string(&r).unwrap();
        assert_eq!(j, format!("\"{DRAW}\""));
        let back: Ref = serde_json::from_str(&j).unwrap();
        assert_eq!(back, r);
    }
}
