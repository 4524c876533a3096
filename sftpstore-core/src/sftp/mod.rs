//! SFTP session.
//!
//! [`Session`] is the set of remote operations the store needs. [`SftpSession`]
//! implements it with `openssh-sftp-client` over any pair of pipes (normally
//! the stdin/stdout of an `ssh -s sftp` subprocess).
use bytes::Bytes;
use openssh_sftp_client::error::SftpErrorKind;
use std::fmt;
use tokio::io::AsyncRead;

mod attrs;
#[cfg(test)]
pub(crate) mod memory;
mod session;

pub use attrs::{FileAttributes, StatVfs, EXT_POSIX_RENAME, EXT_STATVFS, S_IFDIR, S_IFREG};
pub use openssh_sftp_client::SftpOptions;
pub use session::SftpSession;

/// Requests kept in flight for a single file, in both directions.
pub const MAX_CONCURRENT_REQUESTS_PER_FILE: usize = 128;

/// Status codes of SSH_FXP_STATUS replies. End of file never surfaces as an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    OpUnsupported,
    Unknown,
}

impl From<SftpErrorKind> for StatusCode {
    fn from(kind: SftpErrorKind) -> Self {
        match kind {
            SftpErrorKind::NoSuchFile => StatusCode::NoSuchFile,
            SftpErrorKind::PermDenied => StatusCode::PermissionDenied,
            SftpErrorKind::Failure => StatusCode::Failure,
            SftpErrorKind::BadMessage => StatusCode::BadMessage,
            SftpErrorKind::OpUnsupported => StatusCode::OpUnsupported,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusCode::NoSuchFile => write!(f, "SSH_FX_NO_SUCH_FILE"),
            StatusCode::PermissionDenied => write!(f, "SSH_FX_PERMISSION_DENIED"),
            StatusCode::Failure => write!(f, "SSH_FX_FAILURE"),
            StatusCode::BadMessage => write!(f, "SSH_FX_BAD_MESSAGE"),
            StatusCode::OpUnsupported => write!(f, "SSH_FX_OP_UNSUPPORTED"),
            StatusCode::Unknown => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sftp: {message} ({code})")]
    Status { code: StatusCode, message: String },
    #[error("sftp transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reading source data: {0}")]
    Source(std::io::Error),
    #[error("sftp protocol error: {0}")]
    Protocol(String),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("sftp session closed")]
    Closed,
}

impl From<openssh_sftp_client::Error> for Error {
    fn from(err: openssh_sftp_client::Error) -> Self {
        use openssh_sftp_client::Error as Sftp;
        match err {
            Sftp::SftpError(kind, message) => Error::Status {
                code: kind.into(),
                message: message.get().0.to_string(),
            },
            Sftp::IOError(e) => Error::Io(e),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl Error {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Error::Status {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(StatusCode::NoSuchFile)
    }

    /// Convert into an `io::Error` whose kind keeps the not found /
    /// permission denied distinction, for use inside `AsyncRead`.
    pub fn into_io(self) -> std::io::Error {
        use std::io::ErrorKind;
        let kind = match self.status_code() {
            Some(StatusCode::NoSuchFile) => ErrorKind::NotFound,
            Some(StatusCode::PermissionDenied) => ErrorKind::PermissionDenied,
            _ => ErrorKind::Other,
        };
        match self {
            Error::Io(ioe) => ioe,
            other => std::io::Error::new(kind, other),
        }
    }
}

/// Opaque handle of a file opened through a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// One entry of a remote directory listing ("." and ".." are never returned).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attrs: FileAttributes,
}

/// Remote filesystem operations over one protocol session.
///
/// Implementations must be safe to call concurrently: every call is an
/// independent request.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Whether the server advertised the named extension during the handshake.
    fn has_extension(&self, name: &str) -> bool;

    /// Create `path` for writing, failing if it already exists.
    async fn create_exclusive(&self, path: &str) -> Result<FileHandle, Error>;

    async fn open_read(&self, path: &str) -> Result<FileHandle, Error>;

    async fn set_permissions(&self, file: &FileHandle, mode: u32) -> Result<(), Error>;

    /// Copy `source` to the start of `file` until end of stream, with several
    /// write requests in flight. Returns the number of bytes written.
    async fn write_from(
        &self,
        file: &FileHandle,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, Error>;

    /// Read up to `len` bytes at `offset`, `None` at end of file. Several
    /// reads of the same file may be in flight at once.
    async fn read(&self, file: &FileHandle, offset: u64, len: u32) -> Result<Option<Bytes>, Error>;

    async fn close(&self, file: &FileHandle) -> Result<(), Error>;

    async fn lstat(&self, path: &str) -> Result<FileAttributes, Error>;

    async fn remove(&self, path: &str) -> Result<(), Error>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), Error>;

    /// Rename replacing `to` atomically (`posix-rename@openssh.com`).
    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), Error>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), Error>;

    async fn rmdir(&self, path: &str) -> Result<(), Error>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, Error>;

    /// Filesystem usage of the filesystem holding `path` (`statvfs@openssh.com`).
    async fn statvfs(&self, path: &str) -> Result<StatVfs, Error>;

    /// Stop sending requests and close the write side of the transport.
    async fn shutdown(&self) -> Result<(), Error>;
}
