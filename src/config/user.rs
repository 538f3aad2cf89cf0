//! User configuration location.
//!
//! User config: $XDG_CONFIG_HOME/azofly/azofly.toml
//! Fallback: the platform config directory (e.g. ~/.config/azofly/azofly.toml)

use std::path::PathBuf;

const APP_DIR: &str = "azofly";
const FILE_NAME: &str = "azofly.toml";

/// Returns the path to the user configuration file.
///
/// 1. If $XDG_CONFIG_HOME is set: $XDG_CONFIG_HOME/azofly/azofly.toml
/// 2. Otherwise: `dirs::config_dir()`/azofly/azofly.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME")
        && !xdg_config.is_empty()
    {
        return Some(PathBuf::from(xdg_config).join(APP_DIR).join(FILE_NAME));
    }

    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(FILE_NAME))
}
