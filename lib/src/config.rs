//! Installation configuration keys.
//!
//! Two keys exist: `languages` (which per-language extensions get
//! installed; `*` or `*all*` means all) and `extra-languages` (locale
//! codes added on top). Values are `;`-separated.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::installation::Installation;
use crate::Error;

/// The `languages` key.
pub const KEY_LANGUAGES: &str = "languages";
/// The `extra-languages` key.
pub const KEY_EXTRA_LANGUAGES: &str = "extra-languages";

const SECTION: &str = "Core";

/// All known configuration keys.
pub fn known_keys() -> [&'static str; 2] {
    [KEY_LANGUAGES, KEY_EXTRA_LANGUAGES]
}

fn language_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+$").unwrap())
}

fn locale_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // language(_TERRITORY)?(.codeset)?(@modifier)?
    RE.get_or_init(|| {
        Regex::new(r"^[a-z]+(_[A-Z]+)?(\.[A-Za-z0-9-]+)?(@[A-Za-z0-9]+)?$").unwrap()
    })
}

fn validate_language(v: &str) -> bool {
    matches!(v, "C" | "POSIX" | "*" | "*all*") || language_re().is_match(v)
}

fn validate_locale(v: &str) -> bool {
    locale_re().is_match(v)
}

fn validate(key: &str, value: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidConfigValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    let ok = match key {
        KEY_LANGUAGES => value.split(';').filter(|s| !s.is_empty()).all(validate_language),
        KEY_EXTRA_LANGUAGES => value.split(';').filter(|s| !s.is_empty()).all(validate_locale),
        _ => return Err(invalid()),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn read_all(installation: &Installation) -> Result<Vec<(String, String)>> {
    let Some(contents) = installation.read_config()? else {
        return Ok(Vec::new());
    };
    let ini = tini::Ini::from_string(&contents).context("Parse to ini")?;
    let mut out = Vec::new();
    for key in known_keys() {
        if let Some(v) = ini.get::<String>(SECTION, key) {
            out.push((key.to_string(), v));
        }
    }
    Ok(out)
}

fn write_all(installation: &Installation, entries: &[(String, String)]) -> Result<()> {
    let mut buf = format!("[{SECTION}]\n");
    for (k, v) in entries {
        buf.push_str(&format!("{k}={v}\n"));
    }
    installation.write_config(&buf)
}

/// Get one configuration key's value.
pub fn get(installation: &Installation, key: &str) -> Result<Option<String>> {
    if !known_keys().contains(&key) {
        return Err(Error::InvalidConfigValue {
            key: key.to_string(),
            value: String::new(),
        }
        .into());
    }
    Ok(read_all(installation)?
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v))
}

/// Set one configuration key, validating the value grammar.
pub fn set(installation: &Installation, key: &str, value: &str) -> Result<()> {
    validate(key, value)?;
    let mut entries = read_all(installation)?;
    entries.retain(|(k, _)| k != key);
    entries.push((key.to_string(), value.to_string()));
    entries.sort();
    write_all(installation, &entries)
}

/// Remove one configuration key.
pub fn unset(installation: &Installation, key: &str) -> Result<()> {
    if !known_keys().contains(&key) {
        return Err(Error::InvalidConfigValue {
            key: key.to_string(),
            value: String::new(),
        }
        .into());
    }
    let mut entries = read_all(installation)?;
    entries.retain(|(k, _)| k != key);
    write_all(installation, &entries)
}

/// List all set keys with their values.
pub fn list(installation: &Installation) -> Result<Vec<(String, String)>> {
    read_all(installation)
}

/// The effective language policy for an installation.
#[derive(Debug, Clone, Default)]
pub struct LanguageConfig {
    languages: Vec<String>,
    extra: Vec<String>,
}

impl LanguageConfig {
    /// Load from the installation config; an unset `languages` key
    /// means every language.
    pub fn load(installation: &Installation) -> Result<Self> {
        let mut r = Self::default();
        if let Some(v) = get(installation, KEY_LANGUAGES)? {
            r.languages = v.split(';').filter(|s| !s.is_empty()).map(Into::into).collect();
        }
        if let Some(v) = get(installation, KEY_EXTRA_LANGUAGES)? {
            r.extra = v.split(';').filter(|s| !s.is_empty()).map(Into::into).collect();
        }
        Ok(r)
    }

    /// Whether every language is selected.
    pub fn all(&self) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == "*" || l == "*all*")
    }

    /// Whether a per-language extension for `locale` (e.g. `de` or
    /// `de_DE`) should be installed.
    pub fn matches_locale(&self, locale: &str) -> bool {
        if self.all() {
            return true;
        }
        let lang = locale
            .split(['_', '.', '@'])
            .next()
            .unwrap_or(locale);
        self.languages.iter().any(|l| l == lang)
            || self
                .extra
                .iter()
                .any(|l| l == locale || l.split(['_', '.', '@']).next() == Some(lang))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;

    #[test]
    fn test_validation() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        set(&inst, KEY_LANGUAGES, "en;de;C").unwrap();
        set(&inst, KEY_LANGUAGES, "*").unwrap();
        set(&inst, KEY_EXTRA_LANGUAGES, "de_DE;pt_BR.utf8;sr@latin").unwrap();
        for (k, v) in [
            (KEY_LANGUAGES, "DE"),
            (KEY_LANGUAGES, "de_DE"),
            (KEY_EXTRA_LANGUAGES, "DE_de"),
            ("colors", "red"),
        ] {
            let e = set(&inst, k, v).unwrap_err();
            assert!(
                matches!(e.downcast_ref(), Some(Error::InvalidConfigValue { .. })),
                "{k}={v}"
            );
        }
    }

    #[test]
    fn test_get_set_unset_list() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        assert_eq!(get(&inst, KEY_LANGUAGES).unwrap(), None);
        set(&inst, KEY_LANGUAGES, "en;fr").unwrap();
        set(&inst, KEY_EXTRA_LANGUAGES, "de_DE").unwrap();
        assert_eq!(get(&inst, KEY_LANGUAGES).unwrap().as_deref(), Some("en;fr"));
        assert_eq!(list(&inst).unwrap().len(), 2);
        unset(&inst, KEY_EXTRA_LANGUAGES).unwrap();
        assert_eq!(get(&inst, KEY_EXTRA_LANGUAGES).unwrap(), None);
        assert_eq!(list(&inst).unwrap().len(), 1);
    }

    #[test]
    fn test_language_matching() {
        let fx = Fixture::new().unwrap();
        let inst = fx.installation().unwrap();
        // Unset means everything
        let cfg = LanguageConfig::load(&inst).unwrap();
        assert!(cfg.matches_locale("zh"));

        set(&inst, KEY_LANGUAGES, "en;de").unwrap();
        set(&inst, KEY_EXTRA_LANGUAGES, "pt_BR").unwrap();
        let cfg = LanguageConfig::load(&inst).unwrap();
        assert!(cfg.matches_locale("de"));
        assert!(cfg.matches_locale("de_AT"));
        assert!(cfg.matches_locale("pt_BR"));
        assert!(cfg.matches_locale("pt"));
        assert!(!cfg.matches_locale("fr"));

        set(&inst, KEY_LANGUAGES, "*all*").unwrap();
        let cfg = LanguageConfig::load(&inst).unwrap();
        assert!(cfg.matches_locale("fr"));
    }
}
