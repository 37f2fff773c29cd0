use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Normalizes a logical path into the cache key form: segments joined by `/`,
/// no leading or trailing slash, root is the empty string.
pub fn normalize(path: &str) -> Result<String, PathError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(path.to_string())),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Joins a normalized parent path and a leaf name.
pub fn join(parent: &str, leaf: &str) -> String {
    if parent.is_empty() {
        leaf.to_string()
    } else {
        format!("{parent}/{leaf}")
    }
}

/// Splits a normalized path into its parent and leaf. The root has no parent.
pub fn split_leaf(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').unwrap_or(("", path)))
}

/// True when `path` is `ancestor` itself or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor.is_empty() {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_slashes_and_dots() {
        assert_eq!(normalize("/Docs//Work/./").unwrap(), "Docs/Work");
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("/").unwrap(), "");
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(matches!(
            normalize("Docs/../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn splits_and_joins_leaves() {
        assert_eq!(split_leaf("a/b/c"), Some(("a/b", "c")));
        assert_eq!(split_leaf("a"), Some(("", "a")));
        assert_eq!(split_leaf(""), None);
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
    }

    #[test]
    fn descendant_check_respects_segment_boundaries() {
        assert!(is_within("a/b", "a"));
        assert!(is_within("a", "a"));
        assert!(!is_within("ab", "a"));
        assert!(is_within("anything", ""));
    }
}
