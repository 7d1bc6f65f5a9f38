use anyhow::{Context, Result};
use std::{borrow::Cow, fs, path::Path};

pub const DEFAULT_RULEBOOK_NAME: &str = "default_rulebook.toml";
pub const DEFAULT_RULEBOOK_TOML: &str = include_str!("../assets/default_rulebook.toml");

/// Rulebooks compiled into the crate, by file name.
const EMBEDDED: &[(&str, &str)] = &[(DEFAULT_RULEBOOK_NAME, DEFAULT_RULEBOOK_TOML)];

/// Return the embedded text for a known rulebook, if any.
pub fn default_rulebook_text(name: &str) -> Option<&'static str> {
    EMBEDDED.iter().find(|(n, _)| *n == name).map(|(_, text)| *text)
}

/// Seed missing embedded rulebooks into `dir`. Existing files are left alone.
/// Returns the names that were created.
pub fn write_default_rulebooks(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create_dir_all({:?})", dir))?;
    let mut created = Vec::new();
    for (name, text) in EMBEDDED {
        let path = dir.join(name);
        if path.exists() {
            continue;
        }
        fs::write(&path, text).with_context(|| format!("write {:?}", path))?;
        created.push(name.to_string());
    }
    Ok(created)
}

/// Where the rulebook text handed back by [`read_verified_or_embedded`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulebookSource {
    /// On-disk copy is byte-identical to the embedded one.
    Verified,
    /// On-disk copy had drifted and `locked` put the embedded one back.
    Restored,
    /// On-disk copy differs and local edits are allowed.
    LocalEdit,
    /// File was missing; the embedded copy was used (and seeded if possible).
    Seeded,
    /// No embedded baseline exists for this name; file read as-is.
    Unverified,
}

#[derive(Debug, Clone)]
pub struct LoadedRulebook {
    pub text: Cow<'static, str>,
    pub source: RulebookSource,
}

/// Read a rulebook, checking it against the embedded copy when one exists.
///
/// With `locked`, a drifted file is overwritten with the embedded text. A name
/// with no embedded copy must exist on disk.
pub fn read_verified_or_embedded(path: &Path, name: &str, locked: bool) -> Result<LoadedRulebook> {
    let embedded = default_rulebook_text(name);

    if !path.exists() {
        let Some(text) = embedded else {
            anyhow::bail!("rulebook {:?} not found and no embedded copy for {name}", path);
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).ok();
        }
        // Caller still gets the embedded copy if the seed write fails.
        let _ = fs::write(path, text);
        return Ok(LoadedRulebook { text: Cow::Borrowed(text), source: RulebookSource::Seeded });
    }

    let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
    let local = || Cow::Owned(String::from_utf8_lossy(&bytes).into_owned());
    let loaded = match embedded {
        None => LoadedRulebook { text: local(), source: RulebookSource::Unverified },
        Some(text) if blake3::hash(&bytes) == blake3::hash(text.as_bytes()) => {
            LoadedRulebook { text: Cow::Borrowed(text), source: RulebookSource::Verified }
        }
        Some(text) if locked => {
            fs::write(path, text).with_context(|| format!("restore embedded {:?}", path))?;
            LoadedRulebook { text: Cow::Borrowed(text), source: RulebookSource::Restored }
        }
        Some(_) => LoadedRulebook { text: local(), source: RulebookSource::LocalEdit },
    };
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_mode_restores_drifted_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_RULEBOOK_NAME);
        fs::write(&path, "name = \"edited\"\nversion = \"9\"\n").expect("write");

        let open = read_verified_or_embedded(&path, DEFAULT_RULEBOOK_NAME, false).expect("read");
        assert_eq!(open.source, RulebookSource::LocalEdit);
        assert!(open.text.contains("edited"));

        let locked = read_verified_or_embedded(&path, DEFAULT_RULEBOOK_NAME, true).expect("read");
        assert_eq!(locked.source, RulebookSource::Restored);
        assert_eq!(fs::read_to_string(&path).expect("reread"), DEFAULT_RULEBOOK_TOML);

        let again = read_verified_or_embedded(&path, DEFAULT_RULEBOOK_NAME, true).expect("read");
        assert_eq!(again.source, RulebookSource::Verified);
    }

    #[test]
    fn missing_known_file_is_seeded_unknown_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rules").join(DEFAULT_RULEBOOK_NAME);
        let seeded = read_verified_or_embedded(&path, DEFAULT_RULEBOOK_NAME, false).expect("seed");
        assert_eq!(seeded.source, RulebookSource::Seeded);
        assert!(path.exists());

        assert!(read_verified_or_embedded(&dir.path().join("custom.toml"), "custom.toml", false).is_err());
        assert_eq!(write_default_rulebooks(dir.path().join("rules")).expect("seed"), Vec::<String>::new());
    }
}
