use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const DEFAULT_CONNECTIONS: usize = 5;

fn default_connections() -> usize {
    DEFAULT_CONNECTIONS
}

/// Where the store lives and how to reach it.
///
/// ```text
/// host = "backup.example.com"
/// user = "backup"
/// path = "/srv/store"
/// connections = 5
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SftpConfig {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Root of the store on the server, relative paths start at the login directory.
    pub path: String,
    /// Full command line replacing the default ssh invocation.
    pub command: Option<String>,
    /// Extra ssh arguments, shell quoted.
    pub args: Option<String>,
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Report a load stopping before the requested length as a distinct error.
    #[serde(default)]
    pub strict_short_reads: bool,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cannot specify both sftp.command and sftp.args options")]
    CommandAndArgs,
    #[error("unable to split {0:?} into shell words")]
    Unsplittable(String),
    #[error("sftp command is empty")]
    EmptyCommand,
    #[error("cannot implicitly run relative executable {0} found in current directory, use command=./<command> to override")]
    RelativeExecutable(String),
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn split_shell(line: &str) -> Result<Vec<String>, ConfigError> {
    shlex::split(line).ok_or_else(|| ConfigError::Unsplittable(line.to_string()))
}

impl SftpConfig {
    pub fn new<H: Into<String>, P: Into<String>>(host: H, path: P) -> Self {
        SftpConfig {
            host: host.into(),
            port: None,
            user: None,
            path: path.into(),
            command: None,
            args: None,
            connections: DEFAULT_CONNECTIONS,
            strict_short_reads: false,
        }
    }

    pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<SftpConfig, Error> {
        let mut file = File::open(&file)?;
        let mut s = String::new();
        file.read_to_string(&mut s)?;
        Ok(sane::from_str(&s)?)
    }

    /// Program and arguments to start: the configured command, or
    /// `ssh <host> [-p port] [-l user] [args...] -s sftp`.
    pub fn ssh_command(&self) -> Result<(String, Vec<String>), ConfigError> {
        if let Some(command) = non_empty(&self.command) {
            let mut words = split_shell(command)?;
            if non_empty(&self.args).is_some() {
                return Err(ConfigError::CommandAndArgs);
            }
            if words.is_empty() {
                return Err(ConfigError::EmptyCommand);
            }
            let program = words.remove(0);
            return Ok((program, words));
        }

        let mut args = vec![self.host.clone()];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = non_empty(&self.user) {
            args.push("-l".to_string());
            args.push(user.to_string());
        }
        if let Some(extra) = non_empty(&self.args) {
            args.extend(split_shell(extra)?);
        }
        args.push("-s".to_string());
        args.push("sftp".to_string());
        Ok(("ssh".to_string(), args))
    }
}
