use crate::sftp::FileAttributes;

/// Permission bits applied to new files and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modes {
    pub file: u32,
    pub dir: u32,
}

pub const DEFAULT_MODES: Modes = Modes {
    file: 0o600,
    dir: 0o700,
};

impl Default for Modes {
    fn default() -> Self {
        DEFAULT_MODES
    }
}

impl Modes {
    /// Group-readable reference file (the repository config) opens the
    /// store to the group: new objects get group read/write.
    pub fn derive_from(attrs: Option<&FileAttributes>) -> Modes {
        let mut modes = DEFAULT_MODES;
        if let Some(attrs) = attrs {
            if attrs.mode() & 0o040 != 0 {
                modes.dir |= 0o070;
                modes.file |= 0o060;
            }
        }
        modes
    }
}
