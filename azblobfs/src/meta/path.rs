//! Mapping of filesystem paths onto the two-level container/blob namespace.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Cache key of the account root.
pub const ROOT_KEY: &str = "/";

static CONTAINER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("container name pattern is valid")
});

/// 3 to 63 characters of lowercase letters, digits and single inner dashes.
pub fn is_valid_container_name(name: &str) -> bool {
    (3..=63).contains(&name.len()) && CONTAINER_NAME.is_match(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodePath {
    Root,
    Container { name: String },
    /// Everything after the first segment is the blob name.
    Blob { container: String, name: String },
}

impl NodePath {
    pub fn is_dir(&self) -> bool {
        !matches!(self, NodePath::Blob { .. })
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            NodePath::Root => None,
            NodePath::Container { name } => Some(name),
            NodePath::Blob { container, .. } => Some(container),
        }
    }

    /// `"/"` for the root, `"/<container>"` otherwise.
    pub fn container_key(&self) -> String {
        match self.container() {
            Some(name) => container_key(name),
            None => ROOT_KEY.to_string(),
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodePath::Root => f.write_str("/"),
            NodePath::Container { name } => write!(f, "/{name}"),
            NodePath::Blob { container, name } => write!(f, "/{container}/{name}"),
        }
    }
}

pub fn container_key(name: &str) -> String {
    format!("/{name}")
}

/// `"/"` is the root, one segment a container, anything deeper a blob inside
/// the first segment's container. A trailing slash is ignored.
pub fn resolve_path(path: &str) -> NodePath {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return NodePath::Root;
    }
    match trimmed.split_once('/') {
        None => NodePath::Container {
            name: trimmed.to_string(),
        },
        Some((container, name)) => NodePath::Blob {
            container: container.to_string(),
            name: name.to_string(),
        },
    }
}

/// Join a directory path and an entry name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT_KEY || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}
