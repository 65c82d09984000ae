//! The closed failure taxonomy surfaced to users.
//!
//! Component code generally flows through `anyhow` with added context;
//! conditions that callers need to react to programmatically (exit
//! codes, stderr suppression, retry decisions) are carried as a typed
//! source error from this module.

/// All conditions the tool can fail with, as a closed set.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested ref is not present in the targeted installation.
    #[error("{0} is not installed")]
    NotInstalled(String),
    /// Install (without reinstall) of a currently-installed ref.
    #[error("{0} is already installed")]
    AlreadyInstalled(String),
    /// The ref string failed validation.
    #[error("invalid ref {reference}: {reason}")]
    InvalidRef {
        /// The offending input.
        reference: String,
        /// Which part was rejected.
        reason: String,
    },
    /// The branch component failed the (stricter) branch validation.
    #[error("invalid branch {0}")]
    InvalidBranch(String),
    /// A configuration key was given a value outside its grammar.
    #[error("invalid value for configuration key {key}: {value:?}")]
    InvalidConfigValue {
        /// The key being set.
        key: String,
        /// The rejected value.
        value: String,
    },
    /// A bare name matched both an app and a runtime (or several refs)
    /// and interaction is disabled.
    #[error("ref {0} is ambiguous")]
    AmbiguousRef(String),
    /// The same ref matched in several installations.
    #[error("{reference} matches in multiple installations: {}", candidates.join(", "))]
    MultipleMatches {
        /// The offending input.
        reference: String,
        /// Names of the installations that matched.
        candidates: Vec<String>,
    },
    /// Remote metadata contradicts itself; defensive.
    #[error("dependency cycle involving {0}")]
    DependencyCycle(String),
    /// Signature verification failed. Never retried, never tolerated.
    #[error("untrusted signature from remote {0}")]
    GpgUntrusted(String),
    /// The remote exists but is disabled in configuration.
    #[error("remote {0} is disabled")]
    RemoteDisabled(String),
    /// No remote with that name is configured.
    #[error("no remote named {0}")]
    RemoteMissing(String),
    /// Transient transport failure; surfaced after backend retries.
    #[error("network failure: {0}")]
    NetworkError(String),
    /// Object store invariants are violated; invites `repair`.
    #[error("object store corrupt: {0}")]
    StoreCorrupt(String),
    /// The transaction was cancelled by the user or the frontend.
    /// Must not print to stderr by default.
    #[error("aborted")]
    Aborted,
    /// Another process holds the installation lock.
    #[error("installation {0} is busy (locked by another process)")]
    Busy(String),
}

/// Whether the error chain bottoms out in a user abort; the CLI keeps
/// stderr quiet for those.
pub fn is_aborted(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::Aborted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_aborted_through_context() {
        let e = anyhow::Error::from(Error::Aborted).context("running transaction");
        assert!(is_aborted(&e));
        let e = anyhow::Error::from(Error::NotInstalled("x".into()));
        assert!(!is_aborted(&e));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Error::RemoteMissing("depot-origin".into()).to_string(),
            "no remote named depot-origin"
        );
        let e = Error::MultipleMatches {
            reference: "org.a.B".into(),
            candidates: vec!["system".into(), "user".into()],
        };
        assert_eq!(
            e.to_string(),
            "org.a.B matches in multiple installations: system, user"
        );
    }
}
