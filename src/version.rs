//! Version information for the appool binary.
//!
//! Release builds from packaging can stamp a git revision by setting the
//! `APPOOL_GIT_REV` environment variable at compile time.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision from the build environment (empty string if not set).
pub const GIT_REV: &str = match option_env!("APPOOL_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

/// Returns `"X.Y.Z"` or `"X.Y.Z (abcdef0)"` when a git revision was
/// stamped in.
pub fn full_version() -> &'static str {
    FULL_VERSION.as_str()
}

/// Version string for clap's `--version` flag.
pub fn clap_version() -> &'static str {
    PKG_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pkg_version_matches_cargo() {
        assert_eq!(PKG_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_full_version_contains_pkg_version() {
        assert!(full_version().contains(PKG_VERSION));
    }

    #[test]
    fn test_full_version_format() {
        let version = full_version();
        if GIT_REV.is_empty() {
            assert_eq!(version, PKG_VERSION);
        } else {
            assert!(version.contains('(') && version.contains(GIT_REV));
        }
    }
}
