use crate::sftp::{Session, EXT_POSIX_RENAME, EXT_STATVFS};

/// Optional server features the store can take advantage of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Rename replacing the target in one step.
    AtomicRename,
    /// Free space query, used to recognise a full disk.
    SpaceQuery,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::AtomicRename, Capability::SpaceQuery];

    pub fn extension(&self) -> &'static str {
        match self {
            Capability::AtomicRename => EXT_POSIX_RENAME,
            Capability::SpaceQuery => EXT_STATVFS,
        }
    }
}

/// Capability set, fixed after the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    atomic_rename: bool,
    space_query: bool,
}

impl Capabilities {
    pub fn negotiate(session: &dyn Session) -> Capabilities {
        Capability::ALL
            .iter()
            .filter(|c| session.has_extension(c.extension()))
            .fold(Capabilities::default(), |caps, c| caps.with(*c))
    }

    pub fn with(mut self, capability: Capability) -> Capabilities {
        match capability {
            Capability::AtomicRename => self.atomic_rename = true,
            Capability::SpaceQuery => self.space_query = true,
        }
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::AtomicRename => self.atomic_rename,
            Capability::SpaceQuery => self.space_query,
        }
    }
}
