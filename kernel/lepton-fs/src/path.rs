//! Path manipulation helpers.

use alloc::string::String;

/// Returns `true` if the path starts with `/`.
#[inline]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Returns `true` if the path is exactly the root.
#[inline]
pub fn is_root(path: &str) -> bool {
    !path.is_empty() && path.chars().all(|c| c == '/')
}

/// Iterates the non-empty components of a path.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Returns the final component, or `"/"` for the root.
pub fn basename(path: &str) -> &str {
    if is_root(path) {
        return "/";
    }
    components(path).last().unwrap_or("/")
}

/// Returns the path with the final component removed, or `"/"`.
pub fn dirname(path: &str) -> &str {
    if is_root(path) {
        return "/";
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(pos) => &trimmed[..pos],
        None => ".",
    }
}

/// Joins a directory path and a name with a single separator.
pub fn join(dir: &str, name: &str) -> String {
    let mut out = String::from(dir.trim_end_matches('/'));
    out.push('/');
    out.push_str(name);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_and_root() {
        assert!(is_absolute("/a/b"));
        assert!(!is_absolute("a/b"));
        assert!(is_root("/"));
        assert!(is_root("//"));
        assert!(!is_root("/a"));
    }

    #[test]
    fn component_iteration() {
        let parts: Vec<_> = components("/a//b/c/").collect();
        assert_eq!(parts, ["a", "b", "c"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn base_and_dir_names() {
        assert_eq!(basename("/a/b/c"), "c");
        assert_eq!(basename("/"), "/");
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
    }

    #[test]
    fn join_paths() {
        assert_eq!(join("/a/b", "c"), "/a/b/c");
        assert_eq!(join("/", "c"), "/c");
    }
}
