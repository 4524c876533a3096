//! Where each object lives below the store root.
//!
//! ```text
//! <root>/config
//! <root>/data/<first two chars of name>/<name>
//! <root>/snapshots/<name>
//! <root>/index/<name>
//! <root>/locks/<name>
//! <root>/keys/<name>
//! ```
use crate::backend::{FileType, Handle};

fn type_dir(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Config => "",
        FileType::Data => "data",
        FileType::Snapshot => "snapshots",
        FileType::Index => "index",
        FileType::Lock => "locks",
        FileType::Key => "keys",
    }
}

/// Join slash separated segments, dropping empty and `.` components.
/// The result is absolute if the first segment is.
pub fn join(segments: &[&str]) -> String {
    let absolute = segments.first().map_or(false, |s| s.starts_with('/'));
    let joined = segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|e| !e.is_empty() && *e != ".")
        .collect::<Vec<_>>()
        .join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => vec!["/", &joined].into_iter().collect(),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Parent directory, `None` for `/`, `.` and single relative segments.
pub fn parent(path: &str) -> Option<&str> {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) => None,
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

impl Layout {
    pub fn new(root: &str) -> Layout {
        Layout { root: join(&[root]) }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn filename(&self, handle: &Handle) -> String {
        match handle.file_type {
            FileType::Config => join(&[&self.root, "config"]),
            _ => join(&[&self.dirname(handle), &handle.name]),
        }
    }

    /// Directory holding the object.
    pub fn dirname(&self, handle: &Handle) -> String {
        match handle.file_type {
            FileType::Data => join(&[&self.root, "data", data_prefix(&handle.name)]),
            other => join(&[&self.root, type_dir(other)]),
        }
    }

    /// Directory to list for a type, and whether objects sit one level of
    /// subdirectories below it.
    pub fn basedir(&self, file_type: FileType) -> (String, bool) {
        (
            join(&[&self.root, type_dir(file_type)]),
            file_type == FileType::Data,
        )
    }

    /// Every directory a new store needs.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = FileType::ALL
            .iter()
            .filter(|t| **t != FileType::Config)
            .map(|t| join(&[&self.root, type_dir(*t)]))
            .collect();
        paths.extend((0..=255u8).map(|i| join(&[&self.root, "data", &format!("{:02x}", i)])));
        paths
    }
}

fn data_prefix(name: &str) -> &str {
    name.get(..2).unwrap_or(name)
}
