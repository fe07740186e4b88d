//! Namespace path helpers.

use tracing::debug;

use crate::{CoordinationClient, CoordinationError, CreateMode, ErrorCode, Result};

/// Check that `path` is absolute, has no empty segments and no trailing slash.
pub fn validate(path: &str) -> Result<()> {
    let invalid = || CoordinationError::server(ErrorCode::BadArguments, path);

    if !path.starts_with('/') {
        return Err(invalid());
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') || path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(invalid());
    }
    Ok(())
}

/// Join a child name onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        None => None,
        Some(_) if path == "/" => None,
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
    }
}

/// Final segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Create every missing persistent node along `path`.
pub async fn ensure_path(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    validate(path)?;
    if path == "/" {
        return Ok(());
    }

    let mut current = String::new();
    for segment in path[1..].split('/') {
        current.push('/');
        current.push_str(segment);

        if client.exists(&current).await?.is_some() {
            continue;
        }
        match client.create(&current, &[], CreateMode::Persistent).await {
            Ok(_) => debug!(path = %current, "Created namespace node"),
            Err(e) if e.is_node_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryCoordination;
    use rstest::rstest;

    #[rstest]
    #[case("/", true)]
    #[case("/nexus", true)]
    #[case("/nexus/master", true)]
    #[case("nexus", false)]
    #[case("/nexus/", false)]
    #[case("//nexus", false)]
    #[case("", false)]
    fn test_validate(#[case] path: &str, #[case] ok: bool) {
        assert_eq!(validate(path).is_ok(), ok);
    }

    #[test]
    fn test_join_and_parent() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/a/member_0000000001"), "member_0000000001");
    }

    #[tokio::test]
    async fn test_ensure_path_creates_ancestors() {
        let client = InMemoryCoordination::new();
        ensure_path(&client, "/nexus/scheduler/prod").await.unwrap();
        assert!(client.exists("/nexus").await.unwrap().is_some());
        assert!(client.exists("/nexus/scheduler/prod").await.unwrap().is_some());

        // Idempotent
        ensure_path(&client, "/nexus/scheduler/prod").await.unwrap();
    }
}
