//! Application directory paths for vault-sync.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Config | `~/Library/Application Support/vault-sync/` | `~/.config/vault-sync/` |
//!
//! `VAULT_SYNC_CONFIG_DIR` overrides [`config_dir`] for testing or custom
//! deployments.

use std::path::PathBuf;

/// Environment variable overriding [`config_dir`].
pub const CONFIG_DIR_ENV: &str = "VAULT_SYNC_CONFIG_DIR";

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/vault-sync/` by default.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("vault-sync"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vault-sync-config"))
}

/// Persisted settings document (`config_dir()/data.json`).
#[must_use]
pub fn settings_file() -> PathBuf {
    config_dir().join("data.json")
}
