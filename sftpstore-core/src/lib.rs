//! Backup object store kept on a remote host and reached through an
//! `ssh -s sftp` subprocess.
#[macro_use]
extern crate log;

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod config_resolver;
pub mod layout;
pub mod modes;
pub mod process;
pub mod sftp;

pub use backend::sftp_backend::SftpBackend;
pub use tokio_util::sync::CancellationToken;
