//! In-memory file tree the archive is assembled from.
//!
//! The tree holds regular files, directories, and symlinks. Traversal is
//! deterministic: parents before children, siblings in insertion order.
//! The CPIO writer relies on that contract.

use std::io::Read;

use camino::Utf8Path;

/// Produces a fresh reader for a regular file's content.
pub type OpenFn = Box<dyn Fn() -> std::io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Errors from tree construction.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// A node of a different kind already exists at the path.
    #[error("path exists with a different kind: {0}")]
    ExistsDifferentKind(String),

    /// A leaf entry with that name already exists.
    #[error("path already exists: {0}")]
    Exists(String),

    /// The path leaves the tree root, e.g. via `..`.
    #[error("path escapes the tree root: {0}")]
    PathEscapes(String),

    /// The path has no usable components.
    #[error("empty file name")]
    EmptyName,
}

/// A regular file entry.
pub struct FileNode {
    pub open: OpenFn,
    /// Payload length in bytes. Must match what `open` yields; the archive
    /// header is written before the payload.
    pub size: u64,
    /// Permission bits in the guest.
    pub mode: u32,
}

/// A node in the tree.
pub enum Node {
    File(FileNode),
    Dir(DirNode),
    Symlink { target: String },
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::File(_) => "file",
            Node::Dir(_) => "directory",
            Node::Symlink { .. } => "symlink",
        }
    }
}

/// A directory entry. Children keep insertion order.
#[derive(Default)]
pub struct DirNode {
    children: Vec<(String, Node)>,
}

impl DirNode {
    fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children
            .iter_mut()
            .find_map(|(n, node)| (n == name).then_some(node))
    }
}

/// The tree itself, rooted at an unnamed directory.
#[derive(Default)]
pub struct Tree {
    root: DirNode,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular file, creating intermediate directories as needed.
    pub fn add_file(
        &mut self,
        path: &Utf8Path,
        open: OpenFn,
        size: u64,
        mode: u32,
    ) -> Result<(), TreeError> {
        self.insert(path, Node::File(FileNode { open, size, mode }))
    }

    /// Add a symlink, creating intermediate directories as needed.
    ///
    /// The target is stored verbatim; it is resolved by the guest kernel,
    /// never at build time.
    pub fn add_symlink(&mut self, path: &Utf8Path, target: &str) -> Result<(), TreeError> {
        self.insert(
            path,
            Node::Symlink {
                target: target.to_owned(),
            },
        )
    }

    /// Ensure a directory exists at the path.
    pub fn add_dir(&mut self, path: &Utf8Path) -> Result<(), TreeError> {
        let components = normalize(path)?;
        let mut dir = &mut self.root;
        for name in components {
            dir = descend(dir, &name)?;
        }
        Ok(())
    }

    fn insert(&mut self, path: &Utf8Path, node: Node) -> Result<(), TreeError> {
        let mut components = normalize(path)?;
        let leaf = components.pop().ok_or(TreeError::EmptyName)?;

        let mut dir = &mut self.root;
        for name in components {
            dir = descend(dir, &name)?;
        }

        match dir.child_mut(&leaf) {
            None => {
                dir.children.push((leaf, node));
                Ok(())
            }
            Some(existing) if existing.kind() == node.kind() => {
                Err(TreeError::Exists(path.to_string()))
            }
            Some(_) => Err(TreeError::ExistsDifferentKind(path.to_string())),
        }
    }

    /// Visit all nodes in pre-order: parents before children, siblings in
    /// insertion order. Paths are relative to the root, without a leading
    /// slash. The root itself is not visited.
    pub fn walk<E, F>(&self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(&str, &Node) -> Result<(), E>,
    {
        walk_dir(&self.root, String::new(), visit)
    }
}

fn walk_dir<E, F>(dir: &DirNode, prefix: String, visit: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &Node) -> Result<(), E>,
{
    for (name, node) in &dir.children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };

        visit(&path, node)?;

        if let Node::Dir(sub) = node {
            walk_dir(sub, path, visit)?;
        }
    }
    Ok(())
}

/// Walk into (or create) the child directory `name` of `dir`.
fn descend<'a>(dir: &'a mut DirNode, name: &str) -> Result<&'a mut DirNode, TreeError> {
    let exists = dir.children.iter().any(|(n, _)| n == name);
    if !exists {
        dir.children
            .push((name.to_owned(), Node::Dir(DirNode::default())));
    }

    match dir.child_mut(name) {
        Some(Node::Dir(sub)) => Ok(sub),
        Some(_) => Err(TreeError::ExistsDifferentKind(name.to_owned())),
        None => unreachable!("child was just inserted"),
    }
}

/// Split a path into components, rejecting escapes above the root.
fn normalize(path: &Utf8Path) -> Result<Vec<String>, TreeError> {
    let mut components = Vec::new();

    for component in path.as_str().split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(TreeError::PathEscapes(path.to_string()));
                }
            }
            name => components.push(name.to_owned()),
        }
    }

    if components.is_empty() {
        return Err(TreeError::EmptyName);
    }

    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(data: &'static [u8]) -> OpenFn {
        Box::new(move || Ok(Box::new(data) as Box<dyn Read + Send>))
    }

    fn collect_paths(tree: &Tree) -> Vec<String> {
        let mut paths = Vec::new();
        tree.walk::<std::convert::Infallible, _>(&mut |path, _| {
            paths.push(path.to_owned());
            Ok(())
        })
        .unwrap();
        paths
    }

    #[test]
    fn test_walk_is_preorder_in_insertion_order() {
        let mut tree = Tree::new();
        tree.add_file(Utf8Path::new("main"), bytes(b"m"), 1, 0o755).unwrap();
        tree.add_file(Utf8Path::new("data/b"), bytes(b"b"), 1, 0o644)
            .unwrap();
        tree.add_file(Utf8Path::new("data/a"), bytes(b"a"), 1, 0o644)
            .unwrap();
        tree.add_symlink(Utf8Path::new("init"), "main").unwrap();
        tree.add_file(Utf8Path::new("lib/modules/x.ko"), bytes(b"k"), 1, 0o644)
            .unwrap();

        assert_eq!(
            collect_paths(&tree),
            vec![
                "main",
                "data",
                "data/b",
                "data/a",
                "init",
                "lib",
                "lib/modules",
                "lib/modules/x.ko",
            ]
        );
    }

    #[test]
    fn test_conflicting_kinds() {
        let mut tree = Tree::new();
        tree.add_file(Utf8Path::new("data/file"), bytes(b"x"), 1, 0o644)
            .unwrap();

        let err = tree.add_symlink(Utf8Path::new("data/file"), "main").unwrap_err();
        assert!(matches!(err, TreeError::ExistsDifferentKind(_)));

        // A file where a directory already is.
        let err = tree
            .add_file(Utf8Path::new("data"), bytes(b"x"), 1, 0o644)
            .unwrap_err();
        assert!(matches!(err, TreeError::ExistsDifferentKind(_)));

        // A directory component crossing an existing file.
        let err = tree
            .add_file(Utf8Path::new("data/file/nested"), bytes(b"x"), 1, 0o644)
            .unwrap_err();
        assert!(matches!(err, TreeError::ExistsDifferentKind(_)));
    }

    #[test]
    fn test_duplicate_leaf_fails() {
        let mut tree = Tree::new();
        tree.add_file(Utf8Path::new("data/x"), bytes(b"1"), 1, 0o644).unwrap();
        let err = tree
            .add_file(Utf8Path::new("data/x"), bytes(b"2"), 1, 0o644)
            .unwrap_err();
        assert!(matches!(err, TreeError::Exists(_)));
    }

    #[test]
    fn test_path_escapes() {
        let mut tree = Tree::new();
        let err = tree
            .add_file(Utf8Path::new("../evil"), bytes(b"x"), 1, 0o644)
            .unwrap_err();
        assert!(matches!(err, TreeError::PathEscapes(_)));

        // Dot-dot inside the tree is fine.
        tree.add_file(Utf8Path::new("a/../b"), bytes(b"x"), 1, 0o644).unwrap();
        assert_eq!(collect_paths(&tree), vec!["b"]);
    }

    #[test]
    fn test_empty_name() {
        let mut tree = Tree::new();
        let err = tree.add_file(Utf8Path::new(""), bytes(b"x"), 1, 0o644).unwrap_err();
        assert!(matches!(err, TreeError::EmptyName));

        let err = tree.add_file(Utf8Path::new("/"), bytes(b"x"), 1, 0o644).unwrap_err();
        assert!(matches!(err, TreeError::EmptyName));
    }
}
