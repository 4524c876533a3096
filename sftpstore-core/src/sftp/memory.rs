//! In-memory [`Session`] with POSIX-like semantics, for tests.
use crate::process::{exit_signal, ClientExited, ExitNotifier, ExitSignal};
use crate::sftp::{DirEntry, Error, FileAttributes, FileHandle, Session, StatVfs, StatusCode};
use crate::sftp::{EXT_POSIX_RENAME, EXT_STATVFS, S_IFDIR, S_IFREG};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
}

impl Node {
    fn attrs(&self) -> FileAttributes {
        match self {
            Node::File { data, mode } => FileAttributes {
                size: Some(data.len() as u64),
                permissions: Some(S_IFREG | mode),
                ..Default::default()
            },
            Node::Dir { mode } => FileAttributes {
                size: Some(4096),
                permissions: Some(S_IFDIR | mode),
                ..Default::default()
            },
        }
    }
}

struct OpenFile {
    path: String,
    writable: bool,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<FileHandle, OpenFile>,
    next_handle: u64,
    fail_writes: Option<StatusCode>,
    fail_rename: bool,
    statvfs: Option<StatVfs>,
}

pub struct MemorySession {
    state: Mutex<State>,
    extensions: HashSet<String>,
    calls: AtomicUsize,
    notifier: ExitNotifier,
    exit: ExitSignal,
}

fn status<T>(code: StatusCode, message: &str) -> Result<T, Error> {
    Err(Error::status(code, message))
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn children<'a>(nodes: &'a BTreeMap<String, Node>, dir: &str) -> Vec<(&'a String, &'a Node)> {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    };
    nodes
        .iter()
        .filter(|(path, _)| {
            path.len() > prefix.len()
                && path.starts_with(&prefix)
                && !path[prefix.len()..].contains('/')
        })
        .collect()
}

impl State {
    fn parent_is_dir(&self, path: &str) -> bool {
        let parent = parent(path);
        parent == "/" || matches!(self.nodes.get(parent), Some(Node::Dir { .. }))
    }

    fn open_file(&self, file: &FileHandle) -> Result<&OpenFile, Error> {
        self.handles
            .get(file)
            .ok_or_else(|| Error::status(StatusCode::Failure, "invalid handle"))
    }

    fn new_handle(&mut self, path: &str, writable: bool) -> FileHandle {
        self.next_handle += 1;
        let handle = FileHandle(self.next_handle);
        self.handles.insert(
            handle,
            OpenFile {
                path: path.to_string(),
                writable,
            },
        );
        handle
    }
}

impl MemorySession {
    pub fn new() -> Self {
        Self::with_extensions(&[])
    }

    /// Session advertising both extensions the store knows about.
    pub fn openssh() -> Self {
        Self::with_extensions(&[EXT_POSIX_RENAME, EXT_STATVFS])
    }

    pub fn with_extensions(extensions: &[&str]) -> Self {
        let (notifier, exit) = exit_signal();
        MemorySession {
            state: Mutex::new(State::default()),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            calls: AtomicUsize::new(0),
            notifier,
            exit,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap()
    }

    /// Number of remote operations served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    pub fn simulate_exit(&self, status: &str) {
        self.notifier.notify(ClientExited::new(status, false));
    }

    pub fn fail_writes(&self, code: StatusCode) {
        self.state.lock().unwrap().fail_writes = Some(code);
    }

    pub fn fail_rename(&self) {
        self.state.lock().unwrap().fail_rename = true;
    }

    pub fn set_statvfs(&self, statvfs: StatVfs) {
        self.state.lock().unwrap().statvfs = Some(statvfs);
    }

    /// Create `path` and any missing parent directory.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_dir(parent(path));
        self.state.lock().unwrap().nodes.insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                mode: 0o644,
            },
        );
    }

    pub fn put_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            state
                .nodes
                .entry(current.clone())
                .or_insert(Node::Dir { mode: 0o755 });
        }
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File { mode, .. }) | Some(Node::Dir { mode }) => Some(*mode),
            None => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().nodes.keys().cloned().collect()
    }

    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    /// Positioned write, as a WRITE request does it.
    pub fn write_at(&self, file: &FileHandle, offset: u64, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state();
        let open = state.open_file(file)?;
        if !open.writable {
            return status(StatusCode::PermissionDenied, "not open for writing");
        }
        let path = open.path.clone();
        if let Some(code) = state.fail_writes {
            return status(code, "write failed");
        }
        match state.nodes.get_mut(&path) {
            Some(Node::File { data: content, .. }) => {
                let start = offset as usize;
                if content.len() < start + data.len() {
                    content.resize(start + data.len(), 0);
                }
                content[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            _ => status(StatusCode::NoSuchFile, "no such file"),
        }
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    async fn create_exclusive(&self, path: &str) -> Result<FileHandle, Error> {
        let mut state = self.state();
        if !state.parent_is_dir(path) {
            return status(StatusCode::NoSuchFile, "no such file");
        }
        if state.nodes.contains_key(path) {
            return status(StatusCode::Failure, "file exists");
        }
        state.nodes.insert(
            path.to_string(),
            Node::File {
                data: vec![],
                mode: 0o644,
            },
        );
        Ok(state.new_handle(path, true))
    }

    async fn open_read(&self, path: &str) -> Result<FileHandle, Error> {
        let mut state = self.state();
        match state.nodes.get(path) {
            Some(Node::File { .. }) => Ok(state.new_handle(path, false)),
            Some(Node::Dir { .. }) => status(StatusCode::Failure, "is a directory"),
            None => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn set_permissions(&self, file: &FileHandle, new_mode: u32) -> Result<(), Error> {
        let mut state = self.state();
        let path = state.open_file(file)?.path.clone();
        match state.nodes.get_mut(&path) {
            Some(Node::File { mode, .. }) => {
                *mode = new_mode & 0o7777;
                Ok(())
            }
            _ => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn write_from(
        &self,
        file: &FileHandle,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, Error> {
        let mut data = vec![];
        source.read_to_end(&mut data).await.map_err(Error::Source)?;
        let mut state = self.state();
        let open = state.open_file(file)?;
        if !open.writable {
            return status(StatusCode::PermissionDenied, "not open for writing");
        }
        let path = open.path.clone();
        if let Some(code) = state.fail_writes {
            return status(code, "write failed");
        }
        let written = data.len() as u64;
        match state.nodes.get_mut(&path) {
            Some(Node::File { data: content, .. }) => {
                *content = data;
                Ok(written)
            }
            _ => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn read(&self, file: &FileHandle, offset: u64, len: u32) -> Result<Option<Bytes>, Error> {
        let state = self.state();
        let path = &state.open_file(file)?.path;
        let data = match state.nodes.get(path) {
            Some(Node::File { data, .. }) => data,
            _ => return status(StatusCode::NoSuchFile, "no such file"),
        };
        if offset >= data.len() as u64 {
            return Ok(None);
        }
        let start = offset as usize;
        let end = data.len().min(start + len as usize);
        Ok(Some(Bytes::copy_from_slice(&data[start..end])))
    }

    async fn close(&self, file: &FileHandle) -> Result<(), Error> {
        match self.state().handles.remove(file) {
            Some(_) => Ok(()),
            None => status(StatusCode::Failure, "invalid handle"),
        }
    }

    async fn lstat(&self, path: &str) -> Result<FileAttributes, Error> {
        if path == "/" {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Ok(Node::Dir { mode: 0o755 }.attrs());
        }
        match self.state().nodes.get(path) {
            Some(node) => Ok(node.attrs()),
            None => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state();
        match state.nodes.get(path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => status(StatusCode::Failure, "is a directory"),
            None => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut state = self.state();
        if state.fail_rename {
            return status(StatusCode::Failure, "rename failed");
        }
        if state.nodes.contains_key(to) {
            return status(StatusCode::Failure, "target exists");
        }
        rename_file(&mut state, from, to)
    }

    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), Error> {
        if !self.has_extension(EXT_POSIX_RENAME) {
            return status(StatusCode::OpUnsupported, "unsupported extension");
        }
        let mut state = self.state();
        if state.fail_rename {
            return status(StatusCode::Failure, "rename failed");
        }
        if let Some(Node::Dir { .. }) = state.nodes.get(to) {
            return status(StatusCode::Failure, "target is a directory");
        }
        rename_file(&mut state, from, to)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), Error> {
        let mut state = self.state();
        if path == "/" || state.nodes.contains_key(path) {
            return status(StatusCode::Failure, "file exists");
        }
        if !state.parent_is_dir(path) {
            return status(StatusCode::NoSuchFile, "no such file");
        }
        state
            .nodes
            .insert(path.to_string(), Node::Dir { mode: mode & 0o7777 });
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state();
        match state.nodes.get(path) {
            Some(Node::Dir { .. }) => {
                if !children(&state.nodes, path).is_empty() {
                    return status(StatusCode::Failure, "directory not empty");
                }
                state.nodes.remove(path);
                Ok(())
            }
            Some(Node::File { .. }) => status(StatusCode::Failure, "not a directory"),
            None => status(StatusCode::NoSuchFile, "no such file"),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let state = self.state();
        match state.nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            None if path == "/" => {}
            Some(Node::File { .. }) => return status(StatusCode::Failure, "not a directory"),
            None => return status(StatusCode::NoSuchFile, "no such file"),
        }
        // reverse order, callers must not rely on the server sorting
        Ok(children(&state.nodes, path)
            .into_iter()
            .rev()
            .map(|(child, node)| DirEntry {
                name: child.rsplit('/').next().unwrap_or_default().to_string(),
                attrs: node.attrs(),
            })
            .collect())
    }

    async fn statvfs(&self, _path: &str) -> Result<StatVfs, Error> {
        if !self.has_extension(EXT_STATVFS) {
            return status(StatusCode::OpUnsupported, "unsupported extension");
        }
        match &self.state().statvfs {
            Some(statvfs) => Ok(statvfs.clone()),
            None => status(StatusCode::Failure, "statvfs unavailable"),
        }
    }

    async fn shutdown(&self) -> Result<(), Error> {
        self.notifier.notify(ClientExited::new("exit status: 0", true));
        Ok(())
    }
}

fn rename_file(state: &mut State, from: &str, to: &str) -> Result<(), Error> {
    if !state.parent_is_dir(to) {
        return status(StatusCode::NoSuchFile, "no such file");
    }
    match state.nodes.remove(from) {
        Some(node @ Node::File { .. }) => {
            state.nodes.insert(to.to_string(), node);
            Ok(())
        }
        Some(dir) => {
            state.nodes.insert(from.to_string(), dir);
            status(StatusCode::OpUnsupported, "renaming directories is not supported")
        }
        None => status(StatusCode::NoSuchFile, "no such file"),
    }
}
