pub mod config_cmd;
pub mod estop;
pub mod run;

use cadence_config::{CadenceConfig, ConfigError};
use std::path::Path;

/// Load the config from `path`, or from the default location. An explicit
/// path must exist; the default one may be missing.
pub fn load_config(path: Option<&Path>) -> Result<CadenceConfig, ConfigError> {
    match path {
        Some(path) if !path.exists() => Err(ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: "file not found".into(),
        }),
        Some(path) => CadenceConfig::load_with_env(path),
        None => CadenceConfig::load(),
    }
}
