use crate::config::SftpConfig;
use anyhow::Error;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_LOCATION: &[&str] = &["~/.sftpstore/", "/etc/sftpstore/"];
pub const CONFIG_FILE_NAME: &str = "config.sane";
pub const CONFIG_ENV_VAR: &str = "SFTPSTORE_CONFIG";

#[derive(thiserror::Error, Debug)]
#[error("No config file provided nor {0} file found in default locations")]
pub struct NoConfigFileError(String);

/// Candidate config files, most specific first: the provided one, the
/// environment variable, then the default locations.
pub fn config_candidates<P: AsRef<Path>>(
    provided_config: &Option<P>,
    from_env: Option<OsString>,
) -> Vec<PathBuf> {
    provided_config
        .as_ref()
        .map(|path| PathBuf::from(path.as_ref()))
        .into_iter()
        .chain(from_env.map(PathBuf::from))
        .chain(
            DEFAULT_CONFIG_LOCATION
                .iter()
                .map(|loc| shellexpand::tilde(*loc))
                .map(|loc| PathBuf::from(loc.into_owned()).join(CONFIG_FILE_NAME)),
        )
        .collect()
}

pub fn resolve_config<P: AsRef<Path>>(provided_config: &Option<P>) -> Result<SftpConfig, Error> {
    config_candidates(provided_config, std::env::var_os(CONFIG_ENV_VAR))
        .into_iter()
        .find(|loc| loc.exists())
        .map(|loc| {
            debug!("using config file {}", loc.display());
            SftpConfig::read_from_file(loc)
        })
        .unwrap_or_else(|| Err(NoConfigFileError(CONFIG_FILE_NAME.into()).into()))
}
