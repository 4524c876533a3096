use crate::config::ConfigError;
use crate::process::ClientExited;
use crate::sftp::{self, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

pub mod sftp_backend;

/// Category of a stored object.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    #[serde(rename = "config")]
    Config,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "lock")]
    Lock,
    #[serde(rename = "snapshot")]
    Snapshot,
    #[serde(rename = "index")]
    Index,
    #[serde(rename = "key")]
    Key,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Config,
        FileType::Data,
        FileType::Lock,
        FileType::Snapshot,
        FileType::Index,
        FileType::Key,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            FileType::Config => "config",
            FileType::Data => "data",
            FileType::Lock => "lock",
            FileType::Snapshot => "snapshot",
            FileType::Index => "index",
            FileType::Key => "key",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown file type '{0}'")]
pub struct UnknownFileType(pub String);

impl FromStr for FileType {
    type Err = UnknownFileType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownFileType(s.to_string()))
    }
}

/// Identifies one stored object, independently of where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Handle {
            file_type,
            name: name.into(),
        }
    }

    /// The repository config object, there is only one.
    pub fn config() -> Self {
        Handle::new(FileType::Config, "")
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}/{}>", self.file_type, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties {
    /// How many operations may usefully run in parallel.
    pub connections: usize,
    /// Whether Save replaces an existing object atomically.
    pub has_atomic_replace: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}: resource not found")]
    ResourceNotFound(String),
    #[error("{0}: permission denied")]
    PermissionDenied(String),
    #[error("file is too short{}", consumer_result(.0))]
    TooShort(Option<Box<BackendError>>),
    #[error("{0}: no space left on device")]
    NoSpace(String),
    #[error(transparent)]
    ClientExited(#[from] ClientExited),
    #[error("config file already exists")]
    ConfigAlreadyExists,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Remote {
        context: String,
        #[source]
        source: sftp::Error,
    },
    #[error("backend returned error: {cause}")]
    Other { cause: anyhow::Error },
}

fn consumer_result(cause: &Option<Box<BackendError>>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

impl BackendError {
    pub fn other<E: Into<anyhow::Error>>(cause: E) -> Self {
        BackendError::Other {
            cause: cause.into(),
        }
    }

    /// Wrap a protocol error with the failed operation, classifying the
    /// statuses callers need to tell apart.
    pub fn remote<C: Into<String>>(context: C, err: sftp::Error) -> Self {
        let context = context.into();
        match err.status_code() {
            Some(StatusCode::NoSuchFile) => BackendError::ResourceNotFound(context),
            Some(StatusCode::PermissionDenied) => BackendError::PermissionDenied(context),
            _ => BackendError::Remote {
                context,
                source: err,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::ResourceNotFound(_))
    }

    /// Errors that will not go away by retrying the same call.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BackendError::ResourceNotFound(_)
                | BackendError::TooShort(_)
                | BackendError::PermissionDenied(_)
        )
    }

    /// Errors a backoff loop must give up on immediately: the permanent ones
    /// plus conditions of the whole backend (dead subprocess, full disk,
    /// bad configuration, cancellation).
    pub fn is_fatal(&self) -> bool {
        self.is_permanent()
            || matches!(
                self,
                BackendError::NoSpace(_)
                    | BackendError::ClientExited(_)
                    | BackendError::ConfigAlreadyExists
                    | BackendError::Config(_)
                    | BackendError::Cancelled
            )
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(e: anyhow::Error) -> Self {
        BackendError::Other { cause: e }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(ioe: std::io::Error) -> Self {
        match &ioe.kind() {
            ErrorKind::NotFound => BackendError::ResourceNotFound(ioe.to_string()),
            ErrorKind::PermissionDenied => BackendError::PermissionDenied(ioe.to_string()),
            _ => BackendError::Other { cause: ioe.into() },
        }
    }
}

/// A reader whose total length is known before reading starts.
pub trait SizedReader: AsyncRead + Unpin + Send {
    fn length(&self) -> u64;
}

/// In-memory [`SizedReader`].
pub struct ByteReader {
    data: std::io::Cursor<Bytes>,
}

impl ByteReader {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        ByteReader {
            data: std::io::Cursor::new(data.into()),
        }
    }
}

impl AsyncRead for ByteReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.data).poll_read(cx, buf)
    }
}

impl SizedReader for ByteReader {
    fn length(&self) -> u64 {
        self.data.get_ref().len() as u64
    }
}

/// Local file as a [`SizedReader`], length taken when opened.
pub struct FileReader {
    file: tokio::fs::File,
    length: u64,
}

impl FileReader {
    pub async fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        Ok(FileReader { file, length })
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl SizedReader for FileReader {
    fn length(&self) -> u64 {
        self.length
    }
}

/// Receives the content of a loaded object.
#[async_trait::async_trait]
pub trait Consumer: Send {
    async fn consume(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), BackendError>;
}

/// Consumer collecting the whole object in memory.
#[derive(Debug, Default)]
pub struct CollectBytes {
    pub data: Vec<u8>,
}

#[async_trait::async_trait]
impl Consumer for CollectBytes {
    async fn consume(
        &mut self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), BackendError> {
        reader.read_to_end(&mut self.data).await?;
        Ok(())
    }
}

/// Called once per listed object, an error stops the listing.
pub type Visitor<'a> = dyn FnMut(FileInfo) -> Result<(), BackendError> + Send + 'a;

/// Object store contract used by the backup engine.
///
/// All methods take `&self`: one backend is shared by concurrent tasks.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn properties(&self) -> Properties;

    /// Store the reader's content under `handle`, replacing any previous
    /// object only once the new content is complete.
    async fn save(&self, handle: &Handle, reader: &mut dyn SizedReader)
        -> Result<(), BackendError>;

    /// Run `consumer` over `length` bytes (0 = until the end) starting at
    /// `offset`.
    async fn load(
        &self,
        handle: &Handle,
        length: u64,
        offset: u64,
        consumer: &mut dyn Consumer,
    ) -> Result<(), BackendError>;

    async fn stat(&self, handle: &Handle) -> Result<FileInfo, BackendError>;

    async fn remove(&self, handle: &Handle) -> Result<(), BackendError>;

    /// Visit every object of `file_type`. A missing directory is an empty list.
    async fn list(
        &self,
        file_type: FileType,
        cancel: &CancellationToken,
        visitor: &mut Visitor<'_>,
    ) -> Result<(), BackendError>;

    /// Remove everything stored in the backend.
    async fn delete(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    /// Release the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), BackendError>;

    fn is_not_found(&self, err: &BackendError) -> bool {
        err.is_not_found()
    }

    fn is_permanent_error(&self, err: &BackendError) -> bool {
        err.is_permanent()
    }
}
