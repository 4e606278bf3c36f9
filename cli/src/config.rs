// Settings persistence for the blepd CLI
//
// Cross-platform settings stored in:
// - macOS: ~/Library/Application Support/ble-peripheral/settings.json
// - Linux: ~/.config/ble-peripheral/settings.json
// - Windows: %APPDATA%\ble-peripheral\settings.json

use anyhow::{Context, Result};
use ble_peripheral_core::PeripheralSettings;
use std::path::{Path, PathBuf};

/// Keys accepted by `config set` / `config get`
pub const KEYS: [&str; 4] = [
    "connectable",
    "discoverable",
    "default_advertising_timeout_ms",
    "log_filter",
];

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("ble-peripheral");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("settings.json"))
}

/// Load settings, falling back to defaults when no file exists yet
pub fn load() -> Result<PeripheralSettings> {
    load_from(&settings_file()?)
}

pub fn load_from(path: &Path) -> Result<PeripheralSettings> {
    if !path.exists() {
        return Ok(PeripheralSettings::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let settings: PeripheralSettings =
        serde_json::from_str(&contents).context("Failed to parse settings file")?;
    settings.validate().context("Stored settings are invalid")?;
    Ok(settings)
}

pub fn save(settings: &PeripheralSettings) -> Result<()> {
    save_to(settings, &settings_file()?)
}

pub fn save_to(settings: &PeripheralSettings, path: &Path) -> Result<()> {
    let contents = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Set one value and persist the result
pub fn set(key: &str, value: &str) -> Result<PeripheralSettings> {
    let mut settings = load()?;
    settings
        .set(key, value)
        .with_context(|| format!("Cannot set {key}"))?;
    save(&settings)?;
    Ok(settings)
}

/// Get a config value
pub fn get(settings: &PeripheralSettings, key: &str) -> Option<String> {
    match key {
        "connectable" => Some(settings.connectable.to_string()),
        "discoverable" => Some(settings.discoverable.to_string()),
        "default_advertising_timeout_ms" => Some(
            settings
                .default_advertising_timeout_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ),
        "log_filter" => Some(settings.log_filter.clone()),
        _ => None,
    }
}

/// All key/value pairs, in display order
pub fn list(settings: &PeripheralSettings) -> Vec<(&'static str, String)> {
    KEYS.iter()
        .filter_map(|key| get(settings, key).map(|value| (*key, value)))
        .collect()
}
