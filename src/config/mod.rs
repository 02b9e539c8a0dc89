//! Guider profile configuration.
//!
//! The profile lives in a TOML file under the platform config directory
//! (`$XDG_CONFIG_HOME/guidelink/config.toml` or the `dirs` equivalent).
//! Every field has a default, so a missing or empty file yields a working
//! profile pointing at an engine on `localhost:4400`.

use std::path::PathBuf;

mod loader;
mod schema;

pub use loader::{ConfigError, ConfigLoader};
pub use schema::GuiderConfig;

const APP_NAME: &str = "guidelink";

/// Returns the configuration directory for guidelink.
///
/// `$XDG_CONFIG_HOME/guidelink` when the variable is set, otherwise the
/// platform config directory reported by `dirs`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_NAME);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the path to the profile file, `config_dir()/config.toml`.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}
