//! Pure path helpers. Paths are `/`-separated, relative to the bucket root.

use crate::errors::{HarborError, HarborResult};

/// Longest permitted single path segment, in characters.
pub const MAX_NAME_LEN: usize = 255;

/// Trim `/` from both ends and drop empty segments, so `"/a//b/"` is `"a/b"`.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split at the rightmost `/` into `(parent, leaf)`. Root yields two empty strings.
pub fn split(path: &str) -> (String, String) {
    let normalized = normalize(path);
    match normalized.rsplit_once('/') {
        Some((parent, leaf)) => (parent.to_string(), leaf.to_string()),
        None => (String::new(), normalized),
    }
}

/// `(segment, cumulative path)` pairs in root-to-leaf order.
pub fn breadcrumb(path: &str) -> Vec<(String, String)> {
    let mut crumbs = Vec::new();
    let mut cumulative = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !cumulative.is_empty() {
            cumulative.push('/');
        }
        cumulative.push_str(segment);
        crumbs.push((segment.to_string(), cumulative.clone()));
    }
    crumbs
}

pub fn join(parent: &str, name: &str) -> String {
    let parent = normalize(parent);
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

pub fn path_hash(path: &str) -> String {
    format!("{:x}", md5::compute(path.as_bytes()))
}

/// A leaf name must be non-empty, contain no `/` and be at most 255 chars.
pub fn validate_leaf(name: &str) -> HarborResult<()> {
    if name.is_empty() {
        return Err(HarborError::InvalidRequest("name must not be empty".into()));
    }
    if name.contains('/') {
        return Err(HarborError::InvalidRequest(format!(
            "name `{}` must not contain `/`",
            name
        )));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(HarborError::InvalidRequest(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn split_and_breadcrumb() {
        assert_eq!(split("/a/b/c.txt"), ("a/b".to_string(), "c.txt".to_string()));
        assert_eq!(split("top"), (String::new(), "top".to_string()));
        assert_eq!(split("/"), (String::new(), String::new()));
        assert_eq!(
            breadcrumb("a/b/c"),
            vec![
                ("a".to_string(), "a".to_string()),
                ("b".to_string(), "a/b".to_string()),
                ("c".to_string(), "a/b/c".to_string()),
            ]
        );
        assert!(breadcrumb("").is_empty());
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a/b/", "x"), "a/b/x");
    }

    #[test]
    fn leaf_validation() {
        assert!(validate_leaf("report.pdf").is_ok());
        assert_matches!(validate_leaf(""), Err(HarborError::InvalidRequest(_)));
        assert_matches!(validate_leaf("a/b"), Err(HarborError::InvalidRequest(_)));
        assert!(validate_leaf(&"x".repeat(255)).is_ok());
        assert_matches!(
            validate_leaf(&"x".repeat(256)),
            Err(HarborError::InvalidRequest(_))
        );
    }

    proptest! {
        #[test]
        fn split_then_join_restores_normalized(path in "[a-z/]{0,40}") {
            let (parent, leaf) = split(&path);
            let normalized = normalize(&path);
            if normalized.is_empty() {
                prop_assert!(leaf.is_empty());
            } else {
                prop_assert_eq!(join(&parent, &leaf), normalized.clone());
                let crumbs = breadcrumb(&path);
                prop_assert_eq!(&crumbs.last().unwrap().1, &normalized);
            }
        }
    }
}
