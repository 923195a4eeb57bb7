//! Settings document, defaults and the persistence seam.
//!
//! The persisted document is a flat JSON object shared by the user-facing
//! settings ([`SyncSettings`]) and the cumulative counters
//! ([`SyncStats`]). Loading merges whatever is present over the defaults one
//! field at a time, so a partial, stale or hand-edited document never prevents
//! the scheduler from starting.

use crate::error::{Result, SyncError};
use crate::sync::stats::SyncStats;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Shortest allowed auto-sync interval.
pub const MIN_INTERVAL_MINUTES: u32 = 1;
/// Longest allowed auto-sync interval.
pub const MAX_INTERVAL_MINUTES: u32 = 60;

const DEFAULT_SYNC_SCRIPT: &str = "sync-vault-advanced.sh";
const DEFAULT_INTERPRETER: &str = "bash";
const DEFAULT_INTERVAL_MINUTES: u32 = 5;
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// Document keys read into [`SyncSettings`] and [`SyncStats`].
const KNOWN_KEYS: [&str; 10] = [
    "syncScript",
    "autoSyncInterval",
    "autoSyncEnabled",
    "showNotifications",
    "syncOnStartup",
    "interpreter",
    "syncTimeoutMs",
    "countFailedSyncs",
    "lastSyncTime",
    "syncCount",
];

/// User-facing sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    /// Script run from the vault root, e.g. `sync-vault-advanced.sh`.
    pub sync_script: String,
    /// Minutes between automatic syncs, always in `[1, 60]`.
    pub auto_sync_interval: u32,
    /// Whether the recurring timer is armed.
    pub auto_sync_enabled: bool,
    /// Whether start/completion/failure notices are emitted.
    pub show_notifications: bool,
    /// Run one automatic sync right after activation.
    pub sync_on_startup: bool,
    /// Program used to run the script.
    pub interpreter: String,
    /// Hard limit for a single script run.
    pub sync_timeout_ms: u64,
    /// Whether failed attempts count towards `syncCount` and `lastSyncTime`.
    pub count_failed_syncs: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_script: DEFAULT_SYNC_SCRIPT.to_owned(),
            auto_sync_interval: DEFAULT_INTERVAL_MINUTES,
            auto_sync_enabled: false,
            show_notifications: true,
            sync_on_startup: false,
            interpreter: DEFAULT_INTERPRETER.to_owned(),
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            count_failed_syncs: true,
        }
    }
}

impl SyncSettings {
    /// Check every field invariant.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigValidation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validate_interval(self.auto_sync_interval)?;
        if self.sync_script.trim().is_empty() {
            return Err(SyncError::ConfigValidation {
                field: "syncScript",
                message: "cannot be empty".to_owned(),
            });
        }
        if self.interpreter.trim().is_empty() {
            return Err(SyncError::ConfigValidation {
                field: "interpreter",
                message: "cannot be empty".to_owned(),
            });
        }
        if self.sync_timeout_ms == 0 {
            return Err(SyncError::ConfigValidation {
                field: "syncTimeoutMs",
                message: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// Period of the auto-sync timer.
    #[must_use]
    pub fn auto_sync_period(&self) -> Duration {
        interval_period(self.auto_sync_interval)
    }

    /// Timeout applied to each script run.
    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Return a copy with `patch` applied, or an error leaving `self` untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigValidation`] if the patched settings are invalid.
    pub fn patched(&self, patch: &SettingsPatch) -> Result<Self> {
        let mut next = self.clone();
        if let Some(script) = &patch.sync_script {
            next.sync_script = script.trim().to_owned();
        }
        if let Some(minutes) = patch.auto_sync_interval {
            next.auto_sync_interval = minutes;
        }
        if let Some(enabled) = patch.auto_sync_enabled {
            next.auto_sync_enabled = enabled;
        }
        if let Some(show) = patch.show_notifications {
            next.show_notifications = show;
        }
        if let Some(on_startup) = patch.sync_on_startup {
            next.sync_on_startup = on_startup;
        }
        if let Some(interpreter) = &patch.interpreter {
            next.interpreter = interpreter.trim().to_owned();
        }
        if let Some(timeout_ms) = patch.sync_timeout_ms {
            next.sync_timeout_ms = timeout_ms;
        }
        if let Some(count_failed) = patch.count_failed_syncs {
            next.count_failed_syncs = count_failed;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial settings update, as sent by `config.patch` or the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingsPatch {
    pub sync_script: Option<String>,
    pub auto_sync_interval: Option<u32>,
    pub auto_sync_enabled: Option<bool>,
    pub show_notifications: Option<bool>,
    pub sync_on_startup: Option<bool>,
    pub interpreter: Option<String>,
    pub sync_timeout_ms: Option<u64>,
    pub count_failed_syncs: Option<bool>,
}

impl SettingsPatch {
    /// Returns `true` when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Reject intervals outside `[1, 60]` minutes.
///
/// # Errors
///
/// Returns [`SyncError::ConfigValidation`] for `autoSyncInterval`.
pub fn validate_interval(minutes: u32) -> Result<u32> {
    if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(SyncError::ConfigValidation {
            field: "autoSyncInterval",
            message: format!(
                "must be between {MIN_INTERVAL_MINUTES} and {MAX_INTERVAL_MINUTES} minutes, got {minutes}"
            ),
        })
    }
}

/// Timer period for an interval given in minutes.
#[must_use]
pub fn interval_period(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes) * 60)
}

/// Everything that lives in the persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistedState {
    #[serde(flatten)]
    pub settings: SyncSettings,
    #[serde(flatten)]
    pub stats: SyncStats,
    /// Keys this crate does not own, kept so saving does not drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PersistedState {
    /// Merge a raw document over the defaults, field by field.
    ///
    /// Missing and `null` fields take their default silently; fields with the
    /// wrong type or an out-of-range value take their default with a warning.
    /// Unknown fields are carried in `extra`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the document is not a JSON object.
    pub fn from_document(doc: &serde_json::Value) -> Result<Self> {
        let Some(map) = doc.as_object() else {
            return Err(SyncError::Config(
                "settings document must be a JSON object".to_owned(),
            ));
        };
        let defaults = SyncSettings::default();

        let mut settings = SyncSettings {
            sync_script: field(map, "syncScript", defaults.sync_script.clone()),
            auto_sync_interval: field(map, "autoSyncInterval", defaults.auto_sync_interval),
            auto_sync_enabled: field(map, "autoSyncEnabled", defaults.auto_sync_enabled),
            show_notifications: field(map, "showNotifications", defaults.show_notifications),
            sync_on_startup: field(map, "syncOnStartup", defaults.sync_on_startup),
            interpreter: field(map, "interpreter", defaults.interpreter.clone()),
            sync_timeout_ms: field(map, "syncTimeoutMs", defaults.sync_timeout_ms),
            count_failed_syncs: field(map, "countFailedSyncs", defaults.count_failed_syncs),
        };

        if let Err(e) = validate_interval(settings.auto_sync_interval) {
            warn!("{e}; using default of {} minutes", defaults.auto_sync_interval);
            settings.auto_sync_interval = defaults.auto_sync_interval;
        }
        if settings.sync_script.trim().is_empty() {
            warn!("persisted syncScript is empty; using {}", defaults.sync_script);
            settings.sync_script = defaults.sync_script;
        }
        if settings.interpreter.trim().is_empty() {
            settings.interpreter = defaults.interpreter;
        }
        if settings.sync_timeout_ms == 0 {
            settings.sync_timeout_ms = defaults.sync_timeout_ms;
        }

        let stats = SyncStats {
            last_sync_time: field(map, "lastSyncTime", None),
            sync_count: field(map, "syncCount", 0),
        };

        let extra = map
            .iter()
            .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            settings,
            stats,
            extra,
        })
    }

    /// Render the full document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if serialization fails.
    pub fn to_document(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| SyncError::Config(e.to_string()))
    }
}

fn field<T: DeserializeOwned>(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    default: T,
) -> T {
    match map.get(key) {
        None | Some(serde_json::Value::Null) => default,
        Some(raw) => match T::deserialize(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("ignoring persisted `{key}` ({e}); using default");
                default
            }
        },
    }
}

/// Load/save seam for the persisted document.
///
/// The host owns where and how the document is stored; the core only needs
/// whole-document reads and writes.
pub trait SettingsStore: Send + Sync {
    /// Load the document merged over defaults.
    fn load(&self) -> Result<PersistedState>;

    /// Persist the full document.
    fn save(&self, state: &PersistedState) -> Result<()>;
}

/// JSON file on disk, the default store for both binaries.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at [`crate::app_dirs::settings_file`].
    #[must_use]
    pub fn default_location() -> Self {
        Self::new(crate::app_dirs::settings_file())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> Result<PersistedState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no settings at {}; using defaults", self.path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Config(format!("cannot parse {}: {e}", self.path.display()))
        })?;
        PersistedState::from_document(&doc)
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&state.to_document()?)
            .map_err(|e| SyncError::Config(e.to_string()))?;

        // Replace by rename so an interrupted write never leaves a truncated document.
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// In-process store holding the raw document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<Option<serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing raw document.
    pub fn with_document(doc: serde_json::Value) -> Self {
        Self {
            doc: Mutex::new(Some(doc)),
        }
    }

    /// Last saved raw document, if any.
    pub fn document(&self) -> Option<serde_json::Value> {
        self.doc.lock().ok().and_then(|doc| doc.clone())
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<PersistedState> {
        let doc = self
            .doc
            .lock()
            .map_err(|_| SyncError::Config("settings store lock poisoned".to_owned()))?;
        match doc.as_ref() {
            Some(doc) => PersistedState::from_document(doc),
            None => Ok(PersistedState::default()),
        }
    }

    fn save(&self, state: &PersistedState) -> Result<()> {
        let rendered = state.to_document()?;
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| SyncError::Config("settings store lock poisoned".to_owned()))?;
        *doc = Some(rendered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn defaults_match_document_contract() {
        let settings = SyncSettings::default();
        assert_eq!(settings.sync_script, "sync-vault-advanced.sh");
        assert_eq!(settings.auto_sync_interval, 5);
        assert!(!settings.auto_sync_enabled);
        assert!(settings.show_notifications);
        assert!(!settings.sync_on_startup);
        assert_eq!(settings.sync_timeout_ms, 30_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let state = PersistedState::from_document(&json!({})).unwrap();
        assert_eq!(state, PersistedState::default());
    }

    #[test]
    fn partial_document_keeps_present_fields() {
        let state = PersistedState::from_document(&json!({
            "autoSyncEnabled": true,
            "syncCount": 7,
            "someFutureField": "ignored"
        }))
        .unwrap();
        assert!(state.settings.auto_sync_enabled);
        assert_eq!(state.settings.auto_sync_interval, 5);
        assert_eq!(state.stats.sync_count, 7);
        assert!(state.stats.last_sync_time.is_none());
        assert_eq!(state.extra.len(), 1);
        assert_eq!(state.extra["someFutureField"], "ignored");
    }

    #[test]
    fn foreign_keys_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{"syncScript":"sync.sh","pluginVersion":"1.2.0","hotkeys":{"sync":"Mod+S"}}"#,
        )
        .unwrap();
        let store = JsonFileStore::new(&path);

        let mut state = store.load().unwrap();
        state.stats.sync_count = 4;
        store.save(&state).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["pluginVersion"], "1.2.0");
        assert_eq!(doc["hotkeys"]["sync"], "Mod+S");
        assert_eq!(doc["syncScript"], "sync.sh");
        assert_eq!(doc["syncCount"], 4);
    }

    #[test]
    fn known_keys_are_never_duplicated_into_extra() {
        let doc = PersistedState::default().to_document().unwrap();
        let reloaded = PersistedState::from_document(&doc).unwrap();
        assert!(reloaded.extra.is_empty());
        assert_eq!(reloaded, PersistedState::default());
    }

    #[test]
    fn ill_typed_fields_fall_back_individually() {
        let state = PersistedState::from_document(&json!({
            "autoSyncInterval": "ten",
            "showNotifications": false,
            "syncCount": -3,
            "lastSyncTime": "yesterday-ish"
        }))
        .unwrap();
        assert_eq!(state.settings.auto_sync_interval, 5);
        assert!(!state.settings.show_notifications);
        assert_eq!(state.stats.sync_count, 0);
        assert!(state.stats.last_sync_time.is_none());
    }

    #[test]
    fn out_of_range_interval_falls_back_to_default() {
        for raw in [0, 61, 500] {
            let state =
                PersistedState::from_document(&json!({ "autoSyncInterval": raw })).unwrap();
            assert_eq!(state.settings.auto_sync_interval, 5, "raw = {raw}");
        }
    }

    #[test]
    fn non_object_document_is_rejected() {
        assert!(PersistedState::from_document(&json!([1, 2, 3])).is_err());
        assert!(PersistedState::from_document(&json!("settings")).is_err());
    }

    #[test]
    fn document_uses_persisted_key_names() {
        let doc = PersistedState::default().to_document().unwrap();
        let obj = doc.as_object().unwrap();
        for key in [
            "syncScript",
            "autoSyncInterval",
            "autoSyncEnabled",
            "showNotifications",
            "syncOnStartup",
            "lastSyncTime",
            "syncCount",
        ] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert_eq!(obj["lastSyncTime"], serde_json::Value::Null);
    }

    #[test]
    fn validate_interval_bounds() {
        assert!(validate_interval(0).is_err());
        assert_eq!(validate_interval(1).unwrap(), 1);
        assert_eq!(validate_interval(60).unwrap(), 60);
        assert!(validate_interval(61).is_err());
        assert_eq!(interval_period(5), Duration::from_secs(300));
    }

    #[test]
    fn patch_applies_and_validates() {
        let base = SyncSettings::default();
        let patch = SettingsPatch {
            sync_script: Some(" sync-vault.sh ".to_owned()),
            auto_sync_interval: Some(15),
            ..SettingsPatch::default()
        };
        let next = base.patched(&patch).unwrap();
        assert_eq!(next.sync_script, "sync-vault.sh");
        assert_eq!(next.auto_sync_interval, 15);

        let bad = SettingsPatch {
            auto_sync_interval: Some(0),
            ..SettingsPatch::default()
        };
        let err = base.patched(&bad).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ConfigValidation {
                field: "autoSyncInterval",
                ..
            }
        ));
    }

    #[test]
    fn patch_rejects_unknown_fields() {
        let parsed: std::result::Result<SettingsPatch, _> =
            serde_json::from_value(json!({"autoSyncInterval": 3, "colour": "red"}));
        assert!(parsed.is_err());
        let empty: SettingsPatch = serde_json::from_value(json!({})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("data.json"));

        assert_eq!(store.load().unwrap(), PersistedState::default());

        let mut state = PersistedState::default();
        state.settings.auto_sync_enabled = true;
        state.settings.auto_sync_interval = 42;
        state.settings.sync_script = "sync-vault-optimized.sh".to_owned();
        state.stats.sync_count = 12;
        state.stats.last_sync_time = Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap());

        store.save(&state).unwrap();
        assert!(store.path().exists());
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn file_store_save_replaces_without_leaving_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, r#"{"syncCount":1}"#).unwrap();
        let store = JsonFileStore::new(&path);

        let mut state = store.load().unwrap();
        for count in 2..=3 {
            state.stats.sync_count = count;
            store.save(&state).unwrap();
        }

        assert!(!path.with_extension("tmp").exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.load().unwrap().stats.sync_count, 3);
    }

    #[test]
    fn file_store_reports_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(SyncError::Config(_))));
    }

    #[test]
    fn file_store_reads_documents_written_by_other_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{"syncScript":"sync-vault.sh","autoSyncInterval":10,"autoSyncEnabled":true,
               "showNotifications":true,"syncOnStartup":false,
               "lastSyncTime":"2024-03-02T10:15:00.000Z","syncCount":3}"#,
        )
        .unwrap();

        let state = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(state.settings.sync_script, "sync-vault.sh");
        assert_eq!(state.settings.auto_sync_interval, 10);
        assert_eq!(state.stats.sync_count, 3);
        assert_eq!(
            state.stats.last_sync_time,
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.document().is_none());

        let mut state = PersistedState::default();
        state.stats.sync_count = 2;
        store.save(&state).unwrap();

        assert_eq!(store.document().unwrap()["syncCount"], 2);
        assert_eq!(store.load().unwrap(), state);
    }
}
