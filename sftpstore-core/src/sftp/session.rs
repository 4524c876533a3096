use crate::sftp::{
    DirEntry, Error, FileAttributes, FileHandle, Session, StatVfs, StatusCode, EXT_POSIX_RENAME,
    EXT_STATVFS, MAX_CONCURRENT_REQUESTS_PER_FILE,
};
use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use openssh_sftp_client::file::{File, OpenOptions};
use openssh_sftp_client::fs::Fs;
use openssh_sftp_client::metadata::Permissions;
use openssh_sftp_client::{Sftp, SftpOptions};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::Mutex;

const WRITE_CHUNK_SIZE: usize = 32 * 1024;

/// [`Session`] backed by an `openssh-sftp-client` connection.
pub struct SftpSession {
    sftp: Mutex<Option<Sftp>>,
    extensions: HashSet<&'static str>,
    files: Mutex<HashMap<FileHandle, File>>,
    next_handle: AtomicU64,
}

impl SftpSession {
    /// Run the protocol handshake over `stdin`/`stdout` of a server.
    pub async fn connect<W, R>(stdin: W, stdout: R, options: SftpOptions) -> Result<Self, Error>
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        let sftp = Sftp::new(stdin, stdout, options).await?;
        let mut extensions = HashSet::new();
        if sftp.support_posix_rename() {
            extensions.insert(EXT_POSIX_RENAME);
        }
        if sftp.support_statvfs() {
            extensions.insert(EXT_STATVFS);
        }
        debug!("sftp session started, extensions {:?}", extensions);
        Ok(SftpSession {
            sftp: Mutex::new(Some(sftp)),
            extensions,
            files: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
        })
    }

    async fn fs(&self) -> Result<Fs, Error> {
        self.sftp.lock().await.as_ref().map(Sftp::fs).ok_or(Error::Closed)
    }

    async fn options(&self) -> Result<OpenOptions, Error> {
        self.sftp
            .lock()
            .await
            .as_ref()
            .map(Sftp::options)
            .ok_or(Error::Closed)
    }

    async fn register(&self, file: File) -> FileHandle {
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.files.lock().await.insert(handle, file);
        handle
    }

    /// A clone of the open file: clones share the remote handle but keep
    /// their own offset.
    async fn file(&self, file: &FileHandle) -> Result<File, Error> {
        self.files
            .lock()
            .await
            .get(file)
            .cloned()
            .ok_or_else(|| Error::status(StatusCode::Failure, "invalid handle"))
    }
}

/// Name of a listed entry, `None` for the ones the store never looks at.
fn entry_name<'a>(dir: &str, filename: &'a Path) -> Option<&'a str> {
    match filename.to_str() {
        Some(".") | Some("..") => None,
        Some(name) => Some(name),
        None => {
            warn!(
                "skipping {} in {}: name is not valid UTF-8",
                filename.display(),
                dir
            );
            None
        }
    }
}

#[async_trait::async_trait]
impl Session for SftpSession {
    fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    async fn create_exclusive(&self, path: &str) -> Result<FileHandle, Error> {
        let mut options = self.options().await?;
        let file = options.write(true).create_new(true).open(path).await?;
        Ok(self.register(file).await)
    }

    async fn open_read(&self, path: &str) -> Result<FileHandle, Error> {
        let mut options = self.options().await?;
        let file = options.read(true).open(path).await?;
        Ok(self.register(file).await)
    }

    async fn set_permissions(&self, file: &FileHandle, mode: u32) -> Result<(), Error> {
        let mut file = self.file(file).await?;
        file.set_permissions(Permissions::from((mode & 0o7777) as u16))
            .await?;
        Ok(())
    }

    async fn write_from(
        &self,
        file: &FileHandle,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, Error> {
        let file = self.file(file).await?;
        let chunks = stream::try_unfold((source, 0u64), |(source, offset)| async move {
            let mut chunk = BytesMut::with_capacity(WRITE_CHUNK_SIZE);
            while chunk.len() < WRITE_CHUNK_SIZE {
                if source.read_buf(&mut chunk).await.map_err(Error::Source)? == 0 {
                    break;
                }
            }
            if chunk.is_empty() {
                return Ok(None);
            }
            let next = offset + chunk.len() as u64;
            Ok(Some(((offset, chunk.freeze()), (source, next))))
        })
        .boxed();
        chunks
            .map_ok(|(offset, data)| {
                let mut file = file.clone();
                async move {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&data).await?;
                    Ok::<u64, Error>(data.len() as u64)
                }
            })
            .try_buffer_unordered(MAX_CONCURRENT_REQUESTS_PER_FILE)
            .try_fold(0u64, |written, n| future::ready(Ok(written + n)))
            .await
    }

    async fn read(&self, file: &FileHandle, offset: u64, len: u32) -> Result<Option<Bytes>, Error> {
        let mut file = self.file(file).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        match file.read(len, BytesMut::with_capacity(len as usize)).await? {
            // an empty DATA reply would never move the offset
            Some(data) if !data.is_empty() => Ok(Some(data.freeze())),
            _ => Ok(None),
        }
    }

    async fn close(&self, file: &FileHandle) -> Result<(), Error> {
        let file = self
            .files
            .lock()
            .await
            .remove(file)
            .ok_or_else(|| Error::status(StatusCode::Failure, "invalid handle"))?;
        file.close().await?;
        Ok(())
    }

    async fn lstat(&self, path: &str) -> Result<FileAttributes, Error> {
        let meta = self.fs().await?.symlink_metadata(path).await?;
        Ok(meta.into())
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        self.fs().await?.remove_file(path).await?;
        Ok(())
    }

    /// `Fs::rename` already switches to posix-rename when the server has it.
    async fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        self.fs().await?.rename(from, to).await?;
        Ok(())
    }

    async fn posix_rename(&self, from: &str, to: &str) -> Result<(), Error> {
        if !self.has_extension(EXT_POSIX_RENAME) {
            return Err(Error::status(
                StatusCode::OpUnsupported,
                format!("server does not support {}", EXT_POSIX_RENAME),
            ));
        }
        self.rename(from, to).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), Error> {
        let mut fs = self.fs().await?;
        fs.dir_builder()
            .permissions(Permissions::from((mode & 0o7777) as u16))
            .create(path)
            .await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), Error> {
        self.fs().await?.remove_dir(path).await?;
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let dir = self.fs().await?.open_dir(path).await?;
        let entries: Vec<_> = dir.read_dir().try_collect().await?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                entry_name(path, entry.filename()).map(|name| DirEntry {
                    name: name.to_string(),
                    attrs: entry.metadata().into(),
                })
            })
            .collect())
    }

    async fn statvfs(&self, path: &str) -> Result<StatVfs, Error> {
        let fs = self.fs().await?.statvfs(path).await?;
        Ok(fs.into())
    }

    async fn shutdown(&self) -> Result<(), Error> {
        let sftp = self.sftp.lock().await.take();
        // dropping the last clone of a file sends its CLOSE
        self.files.lock().await.clear();
        if let Some(sftp) = sftp {
            // the flush task closes the server's stdin once every handle is
            // gone, the read task then waits for the server to hang up
            tokio::spawn(async move {
                if let Err(e) = sftp.close().await {
                    debug!("closing the sftp session: {}", e);
                }
            });
        }
        Ok(())
    }
}
