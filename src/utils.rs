//! Utility functions for file operations and path manipulation

use std::path::{Path, PathBuf};

/// Suffix used for in-progress transfers next to their destination
pub const PARTIAL_SUFFIX: &str = ".part";

/// Reduce an arbitrary name to something safe to use as one path component
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
/// An empty result (or one made only of dots) becomes `"unnamed"`.
///
/// # Examples
///
/// ```
/// use release_miner::utils::sanitize_component;
///
/// assert_eq!(sanitize_component("2022.3.1f1/linux x64"), "2022.3.1f1_linux_x64");
/// assert_eq!(sanitize_component(".."), "unnamed");
/// ```
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Sibling path a transfer streams into before it is renamed over `destination`
///
/// # Examples
///
/// ```
/// use release_miner::utils::partial_path;
/// use std::path::{Path, PathBuf};
///
/// assert_eq!(
///     partial_path(Path::new("/dl/Unity.pkg")),
///     PathBuf::from("/dl/Unity.pkg.part")
/// );
/// ```
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Path relative to `base` with `/` separators, as matched by path filters
#[must_use]
pub fn relative_slash_path(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
