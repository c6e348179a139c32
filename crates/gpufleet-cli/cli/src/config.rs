use gpufleet_core::FleetConfig;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = "~/.gpufleet/config.toml";

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(raw) => expand_tilde(raw),
        None => path.to_path_buf(),
    }
}

/// Parse a config file. Paths inside it may start with `~/`.
pub fn parse_config(path: &str) -> Result<FleetConfig, Box<dyn std::error::Error>> {
    let config_path = expand_tilde(path);
    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read config {}: {}", config_path.display(), e))?;
    parse_config_str(&content)
        .map_err(|e| format!("Failed to parse config {}: {}", config_path.display(), e).into())
}

fn parse_config_str(content: &str) -> Result<FleetConfig, Box<dyn std::error::Error>> {
    let mut config: FleetConfig = toml::from_str(content)?;

    config.state_dir = config.state_dir.as_deref().map(expand_path);
    config.ssh.public_key = config.ssh.public_key.as_deref().map(expand_path);
    let bootstrap = &mut config.bootstrap;
    bootstrap.template = bootstrap.template.as_deref().map(expand_path);
    bootstrap.setup_script = bootstrap.setup_script.as_deref().map(expand_path);
    bootstrap.shell_rc = bootstrap.shell_rc.as_deref().map(expand_path);

    config.validate()?;
    Ok(config)
}
