use std::path::PathBuf;

use anyhow::{Context, Result};

use viva_types::config::RelayConfig;

/// Returns the viva home directory (~/.viva/)
pub fn viva_home() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".viva")
}

/// Returns the path to the config file (~/.viva/config.toml)
pub fn config_path() -> PathBuf {
    viva_home().join("config.toml")
}

/// Returns the default database path (~/.viva/viva.db)
pub fn db_path() -> PathBuf {
    viva_home().join("viva.db")
}

/// Load config from disk, creating the default if it doesn't exist.
pub fn load_config() -> Result<RelayConfig> {
    let path = config_path();

    if !path.exists() {
        let home = viva_home();
        std::fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create {}", home.display()))?;

        let default = RelayConfig::default();
        let toml_str =
            toml::to_string_pretty(&default).context("Failed to serialize default config")?;
        std::fs::write(&path, &toml_str)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: RelayConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(config: &RelayConfig) -> Result<()> {
    let path = config_path();
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
