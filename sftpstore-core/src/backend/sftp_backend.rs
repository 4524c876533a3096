use crate::backend::{
    Backend, BackendError, Consumer, FileInfo, FileType, Handle, Properties, SizedReader, Visitor,
};
use crate::capabilities::{Capabilities, Capability};
use crate::config::SftpConfig;
use crate::layout::{self, Layout};
use crate::modes::Modes;
use crate::process::{ClientProcess, ExitSignal};
use crate::sftp::{
    self, FileHandle, Session, SftpOptions, SftpSession, StatusCode, EXT_POSIX_RENAME,
    MAX_CONCURRENT_REQUESTS_PER_FILE,
};
use bytes::{Bytes, BytesMut};
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, Take};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

const TEMP_MARKER: &str = "-sftpstore-temp-";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: u32 = 32 * 1024;

/// Store kept on a remote host and reached through `ssh -s sftp`.
pub struct SftpBackend {
    session: Arc<dyn Session>,
    process: Option<ClientProcess>,
    exit: ExitSignal,
    capabilities: Capabilities,
    layout: Layout,
    modes: Modes,
    config: SftpConfig,
    closed: AtomicBool,
}

async fn start_client(
    config: &SftpConfig,
) -> Result<(Arc<dyn Session>, ClientProcess), BackendError> {
    let (program, args) = config.ssh_command()?;
    let (process, stdin, stdout) = ClientProcess::spawn(&program, &args)?;
    match SftpSession::connect(stdin, stdout, SftpOptions::new()).await {
        Ok(client) => {
            let session: Arc<dyn Session> = Arc::new(client);
            Ok((session, process))
        }
        Err(e) => {
            process.kill();
            Err(BackendError::other(anyhow::anyhow!(
                "unable to start the sftp session, error: {}",
                e
            )))
        }
    }
}

fn temp_suffix() -> Result<String, BackendError> {
    let mut nonce = [0u8; 16];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| BackendError::other(anyhow::anyhow!("unable to generate a temp file name")))?;
    Ok(data_encoding::HEXLOWER.encode(&nonce))
}

impl SftpBackend {
    /// Connect to an existing store.
    pub async fn open(config: SftpConfig) -> Result<SftpBackend, BackendError> {
        debug!("open backend with config {:?}", config);
        let (session, process) = start_client(&config).await?;
        let exit = process.exit_signal();
        SftpBackend::assemble(config, session, exit, Some(process))
            .finish_open()
            .await
    }

    /// Initialize a new store: refuses an existing config object, then
    /// creates the directory tree.
    pub async fn create(config: SftpConfig) -> Result<SftpBackend, BackendError> {
        debug!("create backend with config {:?}", config);
        let (session, process) = start_client(&config).await?;
        let exit = process.exit_signal();
        SftpBackend::assemble(config, session, exit, Some(process))
            .finish_create()
            .await
    }

    /// Open over an already established session, `exit` reporting the end
    /// of whatever carries it.
    pub async fn open_with_session(
        config: SftpConfig,
        session: Arc<dyn Session>,
        exit: ExitSignal,
    ) -> Result<SftpBackend, BackendError> {
        SftpBackend::assemble(config, session, exit, None)
            .finish_open()
            .await
    }

    pub async fn create_with_session(
        config: SftpConfig,
        session: Arc<dyn Session>,
        exit: ExitSignal,
    ) -> Result<SftpBackend, BackendError> {
        SftpBackend::assemble(config, session, exit, None)
            .finish_create()
            .await
    }

    fn assemble(
        config: SftpConfig,
        session: Arc<dyn Session>,
        exit: ExitSignal,
        process: Option<ClientProcess>,
    ) -> SftpBackend {
        let capabilities = Capabilities::negotiate(session.as_ref());
        if !capabilities.supports(Capability::AtomicRename) {
            warn!(
                "server does not support {}, replacing an object is not crash safe",
                EXT_POSIX_RENAME
            );
        }
        SftpBackend {
            session,
            process,
            exit,
            capabilities,
            layout: Layout::new(&config.path),
            modes: Modes::default(),
            config,
            closed: AtomicBool::new(false),
        }
    }

    async fn finish_open(mut self) -> Result<SftpBackend, BackendError> {
        self.client_error()?;
        let config_file = self.layout.filename(&Handle::config());
        let attrs = self.session.lstat(&config_file).await;
        self.modes = Modes::derive_from(attrs.as_ref().ok());
        debug!(
            "using {:o} for files and {:o} for directories",
            self.modes.file, self.modes.dir
        );
        Ok(self)
    }

    async fn finish_create(self) -> Result<SftpBackend, BackendError> {
        let bootstrapped = self.bootstrap().await;
        match bootstrapped {
            Ok(()) => self.finish_open().await,
            Err(e) => {
                if let Err(close_err) = self.close().await {
                    debug!("closing after failed create: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn bootstrap(&self) -> Result<(), BackendError> {
        self.client_error()?;
        let config_file = self.layout.filename(&Handle::config());
        if self.session.lstat(&config_file).await.is_ok() {
            return Err(BackendError::ConfigAlreadyExists);
        }
        self.mkdir_all_data_subdirs(self.config.connections).await?;
        info!("created store at {}", self.layout.root());
        Ok(())
    }

    async fn mkdir_all_data_subdirs(&self, connections: usize) -> Result<(), BackendError> {
        stream::iter(self.layout.paths())
            .map(|dir| async move {
                // the parent usually exists already
                if self.session.mkdir(&dir, self.modes.dir).await.is_ok() {
                    return Ok(());
                }
                self.mkdir_all(&dir)
                    .await
                    .map_err(|e| BackendError::remote(format!("MkdirAll {}", dir), e))
            })
            .buffer_unordered(connections.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    /// Create `dir` and its missing parents. A directory appearing
    /// concurrently counts as success.
    fn mkdir_all<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, Result<(), sftp::Error>> {
        Box::pin(async move {
            match self.session.lstat(dir).await {
                Ok(attrs) if attrs.is_dir() => return Ok(()),
                Ok(_) => return Err(sftp::Error::NotADirectory(dir.to_string())),
                Err(_) => {}
            }
            if let Some(parent) = layout::parent(dir) {
                self.mkdir_all(parent).await?;
            }
            match self.session.mkdir(dir, self.modes.dir).await {
                Ok(()) => Ok(()),
                Err(e) => match self.session.lstat(dir).await {
                    Ok(attrs) if attrs.is_dir() => Ok(()),
                    _ => Err(e),
                },
            }
        })
    }

    /// Ok while the subprocess runs.
    pub fn client_error(&self) -> Result<(), BackendError> {
        match self.exit.check() {
            Some(exited) => Err(exited.into()),
            None => Ok(()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn modes(&self) -> Modes {
        self.modes
    }

    /// A failed write is reported as a full disk when the server says the
    /// filesystem holding `dir` has no room left for `size` bytes.
    async fn check_no_space(
        &self,
        dir: &str,
        size: u64,
        context: String,
        err: sftp::Error,
    ) -> BackendError {
        if err.status_code() != Some(StatusCode::Failure)
            || !self.capabilities.supports(Capability::SpaceQuery)
        {
            return BackendError::remote(context, err);
        }
        match self.session.statvfs(dir).await {
            Ok(fs) if fs.files_avail == 0 || fs.available_bytes() < size => {
                BackendError::NoSpace(context)
            }
            Ok(_) => BackendError::remote(context, err),
            Err(statvfs_err) => {
                debug!("sftp: statvfs returned {}", statvfs_err);
                BackendError::remote(context, err)
            }
        }
    }

    async fn remove_partial(&self, tmp_filename: &str) {
        if let Err(e) = self.session.remove(tmp_filename).await {
            debug!("unable to remove temp file {}: {}", tmp_filename, e);
        }
    }

    fn delete_recursive<'a>(
        &'a self,
        dir: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        Box::pin(async move {
            let entries = self
                .session
                .read_dir(dir)
                .await
                .map_err(|e| BackendError::remote(format!("ReadDir {}", dir), e))?;
            for entry in entries {
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
                let item = layout::join(&[dir, &entry.name]);
                if entry.attrs.is_dir() {
                    self.delete_recursive(&item, cancel).await?;
                    self.session
                        .rmdir(&item)
                        .await
                        .map_err(|e| BackendError::remote(format!("RemoveDirectory {}", item), e))?;
                } else {
                    self.session
                        .remove(&item)
                        .await
                        .map_err(|e| BackendError::remote(format!("Remove {}", item), e))?;
                }
            }
            Ok(())
        })
    }
}

type ReadAhead = StreamReader<BoxStream<'static, std::io::Result<Bytes>>, Bytes>;

/// Read `len` bytes at `offset`, going on after short answers. The flag is
/// false when the file ended first.
async fn read_chunk(
    session: Arc<dyn Session>,
    file: FileHandle,
    offset: u64,
    len: u32,
) -> Result<(Bytes, bool), sftp::Error> {
    let mut data = BytesMut::with_capacity(len as usize);
    while data.len() < len as usize {
        let missing = len - data.len() as u32;
        match session.read(&file, offset + data.len() as u64, missing).await? {
            Some(part) if !part.is_empty() => data.extend_from_slice(&part),
            // an empty answer counts as end of file
            _ => return Ok((data.freeze(), false)),
        }
    }
    Ok((data.freeze(), true))
}

/// Stream `file` from `offset`, `length` bytes or to its end when zero, with
/// up to [`MAX_CONCURRENT_REQUESTS_PER_FILE`] reads in flight.
fn read_ahead(session: Arc<dyn Session>, file: FileHandle, offset: u64, length: u64) -> ReadAhead {
    let end = match length {
        0 => u64::MAX,
        length => offset.saturating_add(length),
    };
    let chunks = stream::iter((offset..end).step_by(READ_CHUNK_SIZE as usize))
        .map(move |start| {
            let len = (end - start).min(READ_CHUNK_SIZE as u64) as u32;
            read_chunk(session.clone(), file, start, len)
        })
        .buffered(MAX_CONCURRENT_REQUESTS_PER_FILE)
        .scan(false, |eof, chunk| {
            if *eof {
                return future::ready(None);
            }
            let chunk = chunk.map(|(data, full)| {
                *eof = !full;
                data
            });
            future::ready(Some(chunk))
        })
        .map_err(sftp::Error::into_io)
        .boxed();
    StreamReader::new(chunks)
}

/// With a bounded read not fully satisfied, the file ended early if one more
/// read hits end of stream.
async fn check_too_short(
    reader: &mut Take<ReadAhead>,
    consumed: Result<(), BackendError>,
) -> Result<(), BackendError> {
    if reader.limit() == 0 {
        return consumed;
    }
    let mut probe = [0u8; 1];
    match reader.read(&mut probe).await {
        Ok(0) => Err(BackendError::TooShort(consumed.err().map(Box::new))),
        _ => consumed,
    }
}

#[async_trait::async_trait]
impl Backend for SftpBackend {
    fn properties(&self) -> Properties {
        Properties {
            connections: self.config.connections,
            has_atomic_replace: self.capabilities.supports(Capability::AtomicRename),
        }
    }

    async fn save(&self, handle: &Handle, rd: &mut dyn SizedReader) -> Result<(), BackendError> {
        debug!("Save {}", handle);
        self.client_error()?;

        let filename = self.layout.filename(handle);
        let tmp_filename = format!("{}{}{}", filename, TEMP_MARKER, temp_suffix()?);
        let dirname = self.layout.dirname(handle);

        let file = match self.session.create_exclusive(&tmp_filename).await {
            Ok(file) => file,
            Err(e) if e.is_not_found() => {
                // first object of its directory
                if let Err(mkdir_err) = self.mkdir_all(&dirname).await {
                    debug!("error creating dir {}: {}", dirname, mkdir_err);
                    return Err(BackendError::remote(format!("OpenFile {}", tmp_filename), e));
                }
                self.session
                    .create_exclusive(&tmp_filename)
                    .await
                    .map_err(|e| BackendError::remote(format!("OpenFile {}", tmp_filename), e))?
            }
            Err(e) => return Err(BackendError::remote(format!("OpenFile {}", tmp_filename), e)),
        };

        let length = rd.length();
        let written: Result<(), BackendError> = async {
            self.session
                .set_permissions(&file, self.modes.file)
                .await
                .map_err(|e| BackendError::remote(format!("Chmod {}", tmp_filename), e))?;
            let mut source: &mut dyn SizedReader = &mut *rd;
            let wbytes = match self.session.write_from(&file, &mut source).await {
                Ok(wbytes) => wbytes,
                Err(e) => {
                    return Err(self
                        .check_no_space(&dirname, length, format!("Write {}", tmp_filename), e)
                        .await)
                }
            };
            if wbytes != length {
                return Err(BackendError::other(anyhow::anyhow!(
                    "Write {}: wrote {} bytes instead of the expected {} bytes",
                    tmp_filename,
                    wbytes,
                    length
                )));
            }
            Ok(())
        }
        .await;

        if let Err(e) = written {
            if let Err(close_err) = self.session.close(&file).await {
                debug!("closing {} after failed write: {}", tmp_filename, close_err);
            }
            self.remove_partial(&tmp_filename).await;
            return Err(e);
        }

        self.session
            .close(&file)
            .await
            .map_err(|e| BackendError::remote(format!("Close {}", tmp_filename), e))?;

        let renamed = if self.capabilities.supports(Capability::AtomicRename) {
            self.session.posix_rename(&tmp_filename, &filename).await
        } else {
            self.session.rename(&tmp_filename, &filename).await
        };
        renamed.map_err(|e| BackendError::remote(format!("Rename {}", tmp_filename), e))
    }

    async fn load(
        &self,
        handle: &Handle,
        length: u64,
        offset: u64,
        consumer: &mut dyn Consumer,
    ) -> Result<(), BackendError> {
        debug!("Load {}, length {}, offset {}", handle, length, offset);
        self.client_error()?;

        let filename = self.layout.filename(handle);
        let file = self
            .session
            .open_read(&filename)
            .await
            .map_err(|e| BackendError::remote(format!("Open {}", filename), e))?;
        let reader = read_ahead(self.session.clone(), file, offset, length);

        // the reader and its pending reads are gone before the handle closes
        let consumed = if length == 0 {
            let mut reader = reader;
            consumer.consume(&mut reader).await
        } else {
            let mut bounded = reader.take(length);
            let consumed = consumer.consume(&mut bounded).await;
            if self.config.strict_short_reads {
                check_too_short(&mut bounded, consumed).await
            } else {
                consumed
            }
        };

        let closed = self.session.close(&file).await;
        match (consumed, closed) {
            (Ok(()), Err(e)) => Err(BackendError::remote(format!("Close {}", filename), e)),
            (consumed, _) => consumed,
        }
    }

    async fn stat(&self, handle: &Handle) -> Result<FileInfo, BackendError> {
        debug!("Stat {}", handle);
        self.client_error()?;

        let filename = self.layout.filename(handle);
        let attrs = self
            .session
            .lstat(&filename)
            .await
            .map_err(|e| BackendError::remote(format!("Lstat {}", filename), e))?;
        Ok(FileInfo {
            name: handle.name.clone(),
            size: attrs.size.unwrap_or(0),
        })
    }

    async fn remove(&self, handle: &Handle) -> Result<(), BackendError> {
        debug!("Remove {}", handle);
        self.client_error()?;

        let filename = self.layout.filename(handle);
        self.session
            .remove(&filename)
            .await
            .map_err(|e| BackendError::remote(format!("Remove {}", filename), e))
    }

    async fn list(
        &self,
        file_type: FileType,
        cancel: &CancellationToken,
        visitor: &mut Visitor<'_>,
    ) -> Result<(), BackendError> {
        debug!("List {}", file_type);
        self.client_error()?;

        let (basedir, subdirs) = self.layout.basedir(file_type);
        let mut pending = vec![basedir];
        while let Some(dir) = pending.pop() {
            let mut entries = match self.session.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => {
                    debug!("skipping missing directory {}", dir);
                    continue;
                }
                Err(e) => return Err(BackendError::remote(format!("ReadDir {}", dir), e)),
            };
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            let mut nested = vec![];
            for entry in entries {
                if entry.attrs.is_dir() {
                    if subdirs {
                        nested.push(layout::join(&[&dir, &entry.name]));
                    }
                    continue;
                }
                if !entry.attrs.is_regular() {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
                visitor(FileInfo {
                    name: entry.name,
                    size: entry.attrs.size.unwrap_or(0),
                })?;
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
            }
            // stack: push in reverse so subdirectories are walked in order
            pending.extend(nested.into_iter().rev());
        }

        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        debug!("Delete {}", self.layout.root());
        self.client_error()?;
        self.delete_recursive(self.layout.root(), cancel).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Close");
        if let Err(e) = self.session.shutdown().await {
            debug!("closing the sftp session: {}", e);
        }

        if let Ok(exited) = tokio::time::timeout(CLOSE_TIMEOUT, self.exit.wait()).await {
            return if exited.success() {
                Ok(())
            } else {
                Err(exited.into())
            };
        }

        match &self.process {
            Some(process) => {
                debug!("client still running after {:?}, killing it", CLOSE_TIMEOUT);
                process.kill();
                self.exit.wait().await;
            }
            None => debug!("session did not report its end within {:?}", CLOSE_TIMEOUT),
        }
        Ok(())
    }
}
