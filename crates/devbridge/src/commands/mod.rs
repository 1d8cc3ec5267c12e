//! Subcommand handlers.

pub mod check;
pub mod run;
pub mod send;

use std::path::PathBuf;

use devbridge_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the configuration selected by `--config` (or the platform
/// default), returning it with the path it was resolved against.
pub fn load(global: &GlobalOpts) -> Result<(Config, PathBuf), CliError> {
    let path = global
        .config
        .clone()
        .unwrap_or_else(devbridge_config::config_path);
    let config = devbridge_config::load_config(global.config.as_deref())
        .map_err(|e| CliError::config(e, &path))?;
    Ok((config, path))
}
