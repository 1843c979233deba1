//! Path helpers.

use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Expands a leading `~/` in the given path to the current user's home
/// directory. Paths without the prefix are returned unchanged.
pub fn expand_tilde(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

/// Returns true if the string looks like a filesystem path rather than a
/// `<host>/<repo>` registry path.
pub fn looks_like_filesystem_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with("./") || s.starts_with("../")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/checkpoints");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("checkpoints"));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_looks_like_filesystem_path() {
        assert!(looks_like_filesystem_path("/var/tmp"));
        assert!(looks_like_filesystem_path("./repo"));
        assert!(looks_like_filesystem_path("../repo"));
        assert!(!looks_like_filesystem_path("ghcr.io/acme/app"));
    }
}
