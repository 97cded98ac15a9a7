//! Path helpers for config values that may start with `~`.

use std::path::{Path, PathBuf};

/// Resolve a leading `~` or `~/` against the user's home directory.
///
/// `~user` forms are not expanded. Without a home directory the path is
/// returned as written.
pub fn home_path(raw: &str) -> PathBuf {
    resolve_home(raw, dirs::home_dir().as_deref())
}

fn resolve_home(raw: &str, home: Option<&Path>) -> PathBuf {
    let rest = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(raw),
    };
    match home {
        Some(home) if rest.is_empty() => home.to_path_buf(),
        Some(home) => home.join(rest),
        None => PathBuf::from(raw),
    }
}

/// Join `name` onto `base` unless `name` is already absolute or
/// home-relative.
pub fn resolve_under(base: &Path, name: &str) -> PathBuf {
    let name_path = home_path(name);
    if name_path.is_absolute() {
        name_path
    } else {
        base.join(name_path)
    }
}
