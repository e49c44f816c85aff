//! Flat `path → content` maps to the nested tree shape the runtime's `mount`
//! expects:
//!
//! ```json
//! { "src": { "directory": { "App.tsx": { "file": { "contents": "..." } } } } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeNode {
    File { contents: String },
    Directory(FileTree),
}

/// A mountable directory: entry name → node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, TreeNode>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TreeNode> {
        self.0.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TreeNode)> {
        self.0.iter()
    }

    /// Insert `contents` at a slash-separated path, creating intermediate
    /// directories. An existing file standing where a directory is needed is
    /// replaced by that directory; a file never replaces a directory.
    pub fn insert(&mut self, path: &str, contents: impl Into<String>) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((file_name, dirs)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.0;
        for dir in dirs {
            let node = current
                .entry((*dir).to_string())
                .or_insert_with(|| TreeNode::Directory(FileTree::new()));
            if matches!(node, TreeNode::File { .. }) {
                *node = TreeNode::Directory(FileTree::new());
            }
            let TreeNode::Directory(tree) = node else {
                return;
            };
            current = &mut tree.0;
        }

        match current.get(*file_name) {
            Some(TreeNode::Directory(_)) => {}
            _ => {
                current.insert(
                    (*file_name).to_string(),
                    TreeNode::File {
                        contents: contents.into(),
                    },
                );
            }
        }
    }

    /// Flatten back to `(path, contents)` pairs in path order.
    pub fn files(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        collect_files(self, "", &mut out);
        out
    }
}

fn collect_files<'a>(tree: &'a FileTree, prefix: &str, out: &mut Vec<(String, &'a str)>) {
    for (name, node) in &tree.0 {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            TreeNode::File { contents } => out.push((path, contents.as_str())),
            TreeNode::Directory(sub) => collect_files(sub, &path, out),
        }
    }
}

/// Build a mount tree from flat `(path, content)` pairs.
pub fn build_tree<'a, I>(files: I) -> FileTree
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut tree = FileTree::new();
    for (path, content) in files {
        tree.insert(path, content.as_str());
    }
    tree
}
