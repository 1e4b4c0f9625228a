//! Path handling inside the archive.
//!
//! Paths are always absolute and `/` separated. A path is split into tokens,
//! one per non-empty component; the root directory is the empty token list.

use crate::{Error, Result};

/// Components of `path`, empty ones (repeated or trailing `/`) skipped
pub(crate) fn tokenize(path: &str) -> Vec<&str> {
    path.split('/').filter(|token| !token.is_empty()).collect()
}

/// Absolute path made of `tokens`
pub(crate) fn concat_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut path = String::new();
    for token in tokens {
        path.push('/');
        path.push_str(token.as_ref());
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Absolute form of `target`, a path relative to the directory containing `base`.
/// `.` components are dropped and `..` removes the previous component without
/// going above the root. An absolute `target` does not depend on `base`
pub(crate) fn get_abs_path(base: &str, target: &str) -> String {
    let mut tokens = if target.starts_with('/') {
        Vec::new()
    } else {
        let mut tokens = tokenize(base);
        tokens.pop();
        tokens
    };

    for token in tokenize(target) {
        match token {
            "." => {}
            ".." => {
                tokens.pop();
            }
            _ => tokens.push(token),
        }
    }

    concat_tokens(&tokens)
}

/// Split `path` into its directory and its last component.
/// `"/a/b/c.txt"` gives `("/a/b", "c.txt")` and `"c.txt"` gives `("/", "c.txt")`
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

/// Absolute path designated by the symlink found at `base` whose target is `target`
pub(crate) fn resolve_symlink(target: &[u8], base: &str) -> Result<String> {
    let target = std::str::from_utf8(target)
        .map_err(|_| Error::format(format!("symlink {base} has a non UTF-8 target")))?;
    Ok(get_abs_path(base, target))
}
