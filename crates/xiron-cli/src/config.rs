//! Reads/writes `~/.xiron/config.toml`.
//!
//! The file holds a [`BusConfig`]; missing keys take their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use xiron_bus::BusConfig;
use xiron_types::BusError;

/// Return the path to `~/.xiron/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".xiron").join("config.toml")
}

/// Load the effective configuration: the file at `path` if it exists,
/// defaults otherwise, then `XIRON_*` overrides, then validation.
pub fn load_effective(path: &Path) -> Result<BusConfig, BusError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<BusConfig>, BusError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| BusError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| BusError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `XIRON_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `XIRON_BRIDGE_URL` | `bridge_url` |
/// | `XIRON_BRIDGE_ADDR` | `bridge_addr` |
/// | `XIRON_COMMAND_TOPIC` | `command_topic` |
/// | `XIRON_RPC_TIMEOUT_MS` | `rpc_timeout_ms` |
/// | `XIRON_CHANNEL_CAPACITY` | `channel_capacity` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut BusConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`, keyed by the variable names above.
pub(crate) fn apply_overrides(cfg: &mut BusConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("XIRON_BRIDGE_URL") {
        cfg.bridge_url = v;
    }
    if let Some(v) = lookup("XIRON_BRIDGE_ADDR") {
        cfg.bridge_addr = v;
    }
    if let Some(v) = lookup("XIRON_COMMAND_TOPIC") {
        cfg.command_topic = v;
    }
    if let Some(ms) = lookup("XIRON_RPC_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.rpc_timeout_ms = ms;
    }
    if let Some(n) = lookup("XIRON_CHANNEL_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
        cfg.channel_capacity = n;
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &BusConfig, path: &Path) -> Result<(), BusError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BusError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BusError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| BusError::Config(format!("failed to write {}: {e}", path.display())))?;

    // Owner-only: the file may name hosts on a private network.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| BusError::Config(format!("failed to set permissions: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&BusConfig::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, BusConfig::default());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        save_to(&BusConfig::default(), &path).expect("save");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn partial_file_takes_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "command_topic = \"cmd_vel\"\n\n[retry]\nmax_retries = 7\n").expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.command_topic, "cmd_vel");
        assert_eq!(loaded.retry.max_retries, 7);
        assert_eq!(loaded.retry.initial_backoff_ms, 100);
        assert_eq!(loaded.rpc_timeout_ms, 1_000);
    }

    #[test]
    fn unparseable_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "channel_capacity = \"lots\"").expect("write");

        assert!(matches!(load_from(&path), Err(BusError::Config(_))));
    }

    #[test]
    fn config_path_points_to_xiron_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".xiron"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn overrides_set_fields_and_skip_bad_numbers() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("XIRON_BRIDGE_URL", "ws://sim-host:9000"),
            ("XIRON_RPC_TIMEOUT_MS", "250"),
            ("XIRON_CHANNEL_CAPACITY", "not-a-number"),
        ]);
        let mut cfg = BusConfig::default();
        apply_overrides(&mut cfg, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.bridge_url, "ws://sim-host:9000");
        assert_eq!(cfg.rpc_timeout_ms, 250);
        assert_eq!(cfg.channel_capacity, 256);
        assert_eq!(cfg.bridge_addr, BusConfig::default().bridge_addr);
    }

    #[test]
    fn no_overrides_leave_defaults() {
        let mut cfg = BusConfig::default();
        apply_overrides(&mut cfg, |_| None);
        assert_eq!(cfg, BusConfig::default());
    }
}
