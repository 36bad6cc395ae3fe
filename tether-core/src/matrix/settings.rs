use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::debug;

/// Keys the client layer persists between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKey {
    SyncFilter,
    TransactionId,
    NextBatch,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncFilter => "client/sync_filter",
            Self::TransactionId => "client/transaction_id",
            Self::NextBatch => "client/next_batch",
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persisted key/value settings. `store` must be durable when it returns.
pub trait SettingsStore: Send + Sync {
    fn load(&self, key: SettingKey) -> Option<String>;
    fn store(&self, key: SettingKey, value: &str) -> Result<(), SettingsError>;
}

/// Settings that live only as long as the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<SettingKey, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: SettingKey, value: impl Into<String>) -> Self {
        lock(&self.values).insert(key, value.into());
        self
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self, key: SettingKey) -> Option<String> {
        lock(&self.values).get(&key).cloned()
    }

    fn store(&self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
        lock(&self.values).insert(key, value.to_owned());
        Ok(())
    }
}

/// Settings kept in a flat JSON object on disk.
///
/// Every write replaces the whole file: the new content goes to a sibling
/// temp file, is fsynced, then renamed over the original.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FileSettings {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("loaded {} settings from {}", values.len(), path.display());

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_out(&self, values: &BTreeMap<String, String>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(values)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn load(&self, key: SettingKey) -> Option<String> {
        lock(&self.values).get(key.as_str()).cloned()
    }

    fn store(&self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
        let mut values = lock(&self.values);
        let mut updated = values.clone();
        updated.insert(key.as_str().to_owned(), value.to_owned());
        self.write_out(&updated)?;
        *values = updated;
        Ok(())
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_settings_round_trip() {
        let settings = MemorySettings::new().with(SettingKey::NextBatch, "s1");
        assert_eq!(settings.load(SettingKey::NextBatch).as_deref(), Some("s1"));
        assert_eq!(settings.load(SettingKey::SyncFilter), None);

        settings.store(SettingKey::SyncFilter, "f1").unwrap();
        assert_eq!(settings.load(SettingKey::SyncFilter).as_deref(), Some("f1"));
    }

    #[test]
    fn file_settings_start_empty_and_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = FileSettings::open(&path).unwrap();
        assert_eq!(settings.load(SettingKey::TransactionId), None);

        settings.store(SettingKey::TransactionId, "7").unwrap();
        settings.store(SettingKey::SyncFilter, "filterId123").unwrap();
        drop(settings);

        let reopened = FileSettings::open(&path).unwrap();
        assert_eq!(reopened.load(SettingKey::TransactionId).as_deref(), Some("7"));
        assert_eq!(
            reopened.load(SettingKey::SyncFilter).as_deref(),
            Some("filterId123")
        );
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
    }

    #[test]
    fn file_settings_use_stable_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = FileSettings::open(&path).unwrap();
        settings.store(SettingKey::NextBatch, "s9").unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["client/next_batch"], "s9");
    }

    #[test]
    fn corrupt_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{oops").unwrap();

        let err = FileSettings::open(&path).expect_err("corrupt file must fail");
        assert!(matches!(err, SettingsError::Corrupt(_)));
    }

    #[test]
    fn failed_write_leaves_the_previous_value_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = FileSettings::open(&path).unwrap();
        settings.store(SettingKey::NextBatch, "s1").unwrap();

        // A directory squatting on the temp name makes the next write fail.
        fs::create_dir(dir.path().join("settings.json.tmp")).unwrap();
        let err = settings
            .store(SettingKey::NextBatch, "s2")
            .expect_err("write must fail");
        assert!(matches!(err, SettingsError::Io(_)));

        assert_eq!(settings.load(SettingKey::NextBatch).as_deref(), Some("s1"));
        assert_eq!(settings.load(SettingKey::SyncFilter), None);
        let reopened = FileSettings::open(&path).unwrap();
        assert_eq!(reopened.load(SettingKey::NextBatch).as_deref(), Some("s1"));
    }
}
