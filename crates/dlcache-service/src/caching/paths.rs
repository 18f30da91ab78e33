use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A cache path that would end up outside of its tier directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cache path `{}` is outside of `{}`", path.display(), root.display())]
pub struct PathEscapeError {
    pub root: PathBuf,
    pub path: PathBuf,
}

/// Joins `name` onto `root`, making sure the result is strictly inside of `root`.
///
/// This is purely lexical: `.` and `..` are resolved without touching the file system, and
/// symlinks are not followed. Relative roots stay relative, callers that need an absolute path
/// should pass an absolute root.
pub fn safe_join(root: &Path, name: &str) -> Result<PathBuf, PathEscapeError> {
    let root_normalized = normalize(root);
    let path = normalize(&root_normalized.join(name));

    if path != root_normalized && path.starts_with(&root_normalized) {
        Ok(path)
    } else {
        Err(PathEscapeError {
            root: root.to_owned(),
            path,
        })
    }
}

/// Lexically resolves `.` and `..` components.
///
/// `..` at the root stays at the root, like it does on a real file system. Leading `..` of a
/// relative path are kept.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component)
            }
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::Prefix(_) | Component::RootDir) => {}
                Some(Component::ParentDir | Component::CurDir) | None => {
                    normalized.push(component)
                }
            },
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inside() {
        let path = safe_join(Path::new("/var/cache/short"), "abc.cache").unwrap();
        assert_eq!(path, PathBuf::from("/var/cache/short/abc.cache"));

        let path = safe_join(Path::new("/var/cache/./short/../short"), "abc.cache").unwrap();
        assert_eq!(path, PathBuf::from("/var/cache/short/abc.cache"));

        let path = safe_join(Path::new("/var/cache/short"), "sub/../abc.cache").unwrap();
        assert_eq!(path, PathBuf::from("/var/cache/short/abc.cache"));
    }

    #[test]
    fn test_relative_root() {
        // Relative roots are compared as they are, the working directory is never consulted.
        let path = safe_join(Path::new("cache/long"), "abc.cache").unwrap();
        assert_eq!(path, PathBuf::from("cache/long/abc.cache"));

        let path = safe_join(Path::new("../cache/./long"), "abc.cache").unwrap();
        assert_eq!(path, PathBuf::from("../cache/long/abc.cache"));

        assert!(safe_join(Path::new("cache/long"), "../abc.cache").is_err());
        assert!(safe_join(Path::new("cache"), "../../cache/abc.cache").is_err());
    }

    #[test]
    fn test_escapes() {
        let root = Path::new("/var/cache/short");
        for name in [
            "../abc.cache",
            "../../../etc/passwd",
            "/etc/passwd",
            "..",
            ".",
            "",
            "sub/../../short2/abc.cache",
        ] {
            let err = safe_join(root, name).unwrap_err();
            assert_eq!(err.root, root, "{name} should escape");
        }
    }

    #[test]
    fn test_sibling_with_common_prefix() {
        // `/var/cache/shorter` starts with the string `/var/cache/short`, but is not inside it.
        let err = safe_join(Path::new("/var/cache/short"), "../shorter/abc.cache").unwrap_err();
        assert_eq!(err.path, PathBuf::from("/var/cache/shorter/abc.cache"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("/a/b/..")), PathBuf::from("/a"));
        assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize(Path::new("./a/..")), PathBuf::new());
    }
}
