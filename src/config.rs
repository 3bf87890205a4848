//! Optional config file loading. Search order: ./naroudl.toml, then
//! $XDG_CONFIG_HOME/naroudl/config.toml (or the platform config directory).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Directory for `<ncode>.epub` when -o is not set. Relative to CWD.
    pub output_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    /// Minimum seconds between requests (fractions allowed).
    pub delay_secs: Option<f64>,
    pub timeout_secs: Option<u64>,
    /// Retries after the first attempt for transient failures.
    pub retry: Option<u32>,
    pub vertical: Option<bool>,
    pub include_preface: Option<bool>,
    pub include_afterword: Option<bool>,
    /// Also write a legacy toc.ncx.
    pub ncx: Option<bool>,
}

/// Candidate config paths in search order.
pub fn config_paths() -> Result<Vec<PathBuf>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("naroudl.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("naroudl").join("config.toml"));
    }
    Ok(paths)
}

/// Load the first config file that exists. Missing file returns Ok(None).
/// Invalid TOML or I/O error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    for path in config_paths()? {
        if path.exists() {
            return load_config_from(&path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_config_from(path: &Path) -> Result<Config, String> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    let config: Config =
        toml::from_str(&s).map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
    if let Some(delay) = config.delay_secs {
        if Duration::try_from_secs_f64(delay).is_err() {
            return Err(format!(
                "Invalid config {}: delay_secs must be a non-negative number of seconds",
                path.display()
            ));
        }
    }
    Ok(config)
}
