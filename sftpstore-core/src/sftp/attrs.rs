//! File attributes and filesystem usage, independent of the session carrying
//! them.
use openssh_sftp_client::fs::Statvfs;
use openssh_sftp_client::metadata::MetaData;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
pub const EXT_STATVFS: &str = "statvfs@openssh.com";

/// What an lstat or a directory listing tells about one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    /// Type and permission bits, as in `st_mode`.
    pub permissions: Option<u32>,
}

impl FileAttributes {
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Default::default()
        }
    }

    fn file_type(&self) -> Option<u32> {
        self.permissions.map(|p| p & S_IFMT)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(S_IFDIR)
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == Some(S_IFREG)
    }

    /// Permission bits without the file type.
    pub fn mode(&self) -> u32 {
        self.permissions.unwrap_or(0) & 0o7777
    }
}

impl From<MetaData> for FileAttributes {
    fn from(meta: MetaData) -> Self {
        let file_type = meta.file_type().map(|t| {
            if t.is_dir() {
                S_IFDIR
            } else if t.is_file() {
                S_IFREG
            } else if t.is_symlink() {
                S_IFLNK
            } else {
                // sockets, fifos and devices are never objects
                0
            }
        });
        let mode = meta.permissions().map(|p| p.as_raw().bits() & 0o7777);
        let permissions = match (file_type, mode) {
            (None, None) => None,
            (file_type, mode) => Some(file_type.unwrap_or(0) | mode.unwrap_or(0)),
        };
        FileAttributes {
            size: meta.len(),
            uid_gid: meta.uid().zip(meta.gid()),
            permissions,
        }
    }
}

/// Reply to a `statvfs@openssh.com` request, field for field `struct statvfs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatVfs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
    pub files_free: u64,
    pub files_avail: u64,
    pub fsid: u64,
    pub flags: u64,
    pub name_max: u64,
}

impl StatVfs {
    /// Bytes an unprivileged user may still write.
    pub fn available_bytes(&self) -> u64 {
        self.fragment_size.saturating_mul(self.blocks_avail)
    }
}

impl From<Statvfs> for StatVfs {
    fn from(fs: Statvfs) -> Self {
        StatVfs {
            block_size: fs.bsize,
            fragment_size: fs.frsize,
            blocks: fs.blocks,
            blocks_free: fs.bfree,
            blocks_avail: fs.bavail,
            files: fs.files,
            files_free: fs.ffree,
            files_avail: fs.favail,
            fsid: fs.fsid,
            flags: fs.flag,
            name_max: fs.namemax,
        }
    }
}
