/// Persistent key/value configuration with JSON import/export
///
/// The document is a flat JSON object whose keys are dotted paths
/// (`wifi.ssid`, `http.update.interval`). It is mirrored into up to two
/// backends: a file on mounted storage, which wins when present, and a raw
/// key/value partition. Saving compares the serialized bytes with what each
/// backend already holds and skips identical content.
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config document must be a JSON object")]
    NotAnObject,
    #[error("config storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("config backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },
}

/// One place the serialized config document can live
pub trait BlobStore {
    fn label(&self) -> &str;
    /// `Ok(None)` when nothing has been stored yet
    fn load(&mut self) -> Result<Option<Vec<u8>>, ConfigError>;
    fn store(&mut self, data: &[u8]) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Double(f64),
}

impl From<ConfigValue> for Value {
    fn from(value: ConfigValue) -> Self {
        match value {
            ConfigValue::Str(s) => Value::String(s),
            ConfigValue::Int(i) => Value::from(i),
            // NaN and infinities have no JSON form
            ConfigValue::Double(d) => serde_json::Number::from_f64(d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Double(value)
    }
}

pub struct ConfigStore {
    file: Option<Box<dyn BlobStore + Send>>,
    kv: Box<dyn BlobStore + Send>,
    values: Document,
}

impl ConfigStore {
    /// Load the document from the file if storage is mounted, otherwise from
    /// the key/value partition. Unreadable or corrupt content falls through to
    /// the next backend and finally to an empty document; defaults are filled
    /// in by the typed getters.
    pub fn open(file: Option<Box<dyn BlobStore + Send>>, kv: Box<dyn BlobStore + Send>) -> Self {
        let mut store = Self {
            file,
            kv,
            values: Document::new(),
        };
        store.values = store.load_document();
        store
    }

    fn backends(&mut self) -> impl Iterator<Item = &mut (dyn BlobStore + Send + 'static)> + '_ {
        self.file
            .as_deref_mut()
            .into_iter()
            .chain(std::iter::once(self.kv.as_mut()))
    }

    fn load_document(&mut self) -> Document {
        for backend in self.backends() {
            match backend.load() {
                Ok(Some(bytes)) => match parse_document(&bytes) {
                    Ok(doc) => {
                        log::info!("Loaded configuration from {} ({} keys)", backend.label(), doc.len());
                        return doc;
                    }
                    Err(e) => log::warn!("Ignoring corrupt configuration in {}: {}", backend.label(), e),
                },
                Ok(None) => log::debug!("No configuration stored in {}", backend.label()),
                Err(e) => log::warn!("Failed to read configuration from {}: {}", backend.label(), e),
            }
        }
        log::warn!("No stored configuration, using defaults");
        Document::new()
    }

    pub fn has_file_backend(&self) -> bool {
        self.file.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<ConfigValue>) {
        self.values.insert(key.to_string(), value.into().into());
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set(key, value);
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, value);
    }

    pub fn set_double(&mut self, key: &str, value: f64) {
        self.set(key, value);
    }

    /// Set from operator text input, keeping the type the key already has
    pub fn set_from_text(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let value = match self.values.get(key) {
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => raw
                .trim()
                .parse::<i64>()
                .map(ConfigValue::Int)
                .map_err(|e| invalid_text(key, e))?,
            Some(Value::Number(_)) => raw
                .trim()
                .parse::<f64>()
                .map(ConfigValue::Double)
                .map_err(|e| invalid_text(key, e))?,
            _ => ConfigValue::Str(raw.to_string()),
        };
        self.set(key, value);
        Ok(())
    }

    pub fn get_str(&mut self, key: &str, default: &str) -> String {
        let current = match self.values.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        current.unwrap_or_else(|| {
            self.backfill(key, default);
            default.to_string()
        })
    }

    pub fn get_int(&mut self, key: &str, default: i64) -> i64 {
        let current = match self.values.get(key) {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(Value::Bool(b)) => Some(i64::from(*b)),
            _ => None,
        };
        current.unwrap_or_else(|| {
            self.backfill(key, default);
            default
        })
    }

    pub fn get_double(&mut self, key: &str, default: f64) -> f64 {
        let current = match self.values.get(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        current.unwrap_or_else(|| {
            self.backfill(key, default);
            default
        })
    }

    fn backfill(&mut self, key: &str, default: impl Into<ConfigValue>) {
        if self.values.contains_key(key) {
            log::warn!("Config key '{}' has an unusable value, resetting to default", key);
        }
        self.set(key, default);
    }

    /// Replace the whole document, as uploaded by the operator
    pub fn import_json(&mut self, json: &str) -> Result<(), ConfigError> {
        self.values = parse_document(json.as_bytes())?;
        Ok(())
    }

    pub fn export_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&self.values)?)
    }

    /// Persist to every backend whose stored bytes differ. Returns how many
    /// backends were actually written.
    pub fn save(&mut self) -> Result<usize, ConfigError> {
        let bytes = serde_json::to_vec_pretty(&self.values)?;
        let mut writes = 0;
        let mut failure = None;
        for backend in self.backends() {
            match persist(backend, &bytes) {
                Ok(true) => writes += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to save configuration to {}: {}", backend.label(), e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) if writes == 0 => Err(e),
            _ => Ok(writes),
        }
    }
}

fn invalid_text(key: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::Backend {
        backend: "form".to_string(),
        reason: format!("{}: {}", key, e),
    }
}

fn persist(backend: &mut dyn BlobStore, bytes: &[u8]) -> Result<bool, ConfigError> {
    let current = backend.load().unwrap_or_else(|e| {
        log::debug!("Could not read back {} before saving: {}", backend.label(), e);
        None
    });
    if current.as_deref() == Some(bytes) {
        log::debug!("Configuration in {} is unchanged, skipping write", backend.label());
        return Ok(false);
    }
    backend.store(bytes)?;
    log::info!("Configuration saved to {}", backend.label());
    Ok(true)
}

/// Parse a flat config document. Nested objects, arrays and nulls have no
/// meaning in the flat namespace and are dropped.
pub fn parse_document(bytes: &[u8]) -> Result<Document, ConfigError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(map) = value else {
        return Err(ConfigError::NotAnObject);
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(_) | Value::Number(_) => Some((key, value)),
            Value::Bool(b) => Some((key, Value::from(i64::from(b)))),
            _ => {
                log::warn!("Dropping config key '{}': unsupported value type", key);
                None
            }
        })
        .collect())
}

/// Config file on mounted storage. Writes go to a sibling temp file that is
/// then renamed over the original, so a power cut leaves either the old or
/// the new document.
pub struct FileStore {
    path: PathBuf,
    label: String,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = format!("file {}", path.display());
        Self { path, label }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlobStore for FileStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, ConfigError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, data: &[u8]) -> Result<(), ConfigError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Option<Vec<u8>>,
    writes: usize,
    fail_writes: bool,
}

/// In-memory backend. Clones share the same contents, so a test can keep a
/// handle after moving one into a [`ConfigStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: &str) -> Self {
        let store = Self::new();
        store.lock().data = Some(data.as_bytes().to_vec());
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn contents(&self) -> Option<String> {
        self.lock()
            .data
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl BlobStore for MemoryStore {
    fn label(&self) -> &str {
        "memory"
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, ConfigError> {
        Ok(self.lock().data.clone())
    }

    fn store(&mut self, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(ConfigError::Backend {
                backend: "memory".to_string(),
                reason: "write rejected".to_string(),
            });
        }
        inner.data = Some(data.to_vec());
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(kv: &MemoryStore) -> ConfigStore {
        ConfigStore::open(None, Box::new(kv.clone()))
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let kv = MemoryStore::new();
        let mut config = store_with(&kv);
        config.set_str("station.name", "Ridge");
        config.set_int("http.update.interval", 600);
        config.set_double("powersave.threshold", 3.45);

        assert_eq!(config.get_str("station.name", "x"), "Ridge");
        assert_eq!(config.get_int("http.update.interval", 1), 600);
        assert_eq!(config.get_double("powersave.threshold", 0.0), 3.45);
    }

    #[test]
    fn test_missing_key_is_backfilled_with_default() {
        let kv = MemoryStore::new();
        let mut config = store_with(&kv);
        assert!(!config.contains("wifi.timeout"));

        assert_eq!(config.get_int("wifi.timeout", 30), 30);
        assert!(config.contains("wifi.timeout"));
        // A second read without any write returns the same default
        assert_eq!(config.get_int("wifi.timeout", 99), 30);

        config.save().unwrap();
        assert!(kv.contents().unwrap().contains("\"wifi.timeout\": 30"));
    }

    #[test]
    fn test_unchanged_save_performs_no_writes() {
        let kv = MemoryStore::new();
        let mut config = store_with(&kv);
        config.get_str("station.name", "SolarStation");

        assert_eq!(config.save().unwrap(), 1);
        assert_eq!(kv.writes(), 1);

        assert_eq!(config.save().unwrap(), 0);
        assert_eq!(kv.writes(), 1);

        // Reopening and reading the same defaults is still write-free
        let mut reopened = store_with(&kv);
        reopened.get_str("station.name", "SolarStation");
        assert_eq!(reopened.save().unwrap(), 0);
        assert_eq!(kv.writes(), 1);
    }

    #[test]
    fn test_file_takes_precedence_and_refreshes_kv() {
        let file = MemoryStore::with_contents(r#"{"station.name": "FromFile"}"#);
        let kv = MemoryStore::with_contents(r#"{"station.name": "FromNvs"}"#);
        let mut config = ConfigStore::open(Some(Box::new(file.clone())), Box::new(kv.clone()));

        assert_eq!(config.get_str("station.name", "x"), "FromFile");
        config.save().unwrap();
        assert_eq!(kv.writes(), 1);
        assert!(kv.contents().unwrap().contains("FromFile"));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_kv() {
        let file = MemoryStore::with_contents("{not json");
        let kv = MemoryStore::with_contents(r#"{"station.group": "alpine"}"#);
        let mut config = ConfigStore::open(Some(Box::new(file)), Box::new(kv));
        assert_eq!(config.get_str("station.group", "weather"), "alpine");
    }

    #[test]
    fn test_corrupt_everything_uses_defaults() {
        let kv = MemoryStore::with_contents("[1, 2, 3]");
        let mut config = store_with(&kv);
        assert_eq!(config.get_int("http.timeout", 30), 30);
    }

    #[test]
    fn test_import_rejects_non_object() {
        let mut config = store_with(&MemoryStore::new());
        assert!(matches!(config.import_json("42"), Err(ConfigError::NotAnObject)));
        assert!(matches!(config.import_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_import_then_export() {
        let mut config = store_with(&MemoryStore::new());
        config
            .import_json(r#"{"wifi.ssid": "shed", "wifi.timeout": 12, "debug": true, "nested": {"a": 1}}"#)
            .unwrap();
        assert_eq!(config.get_str("wifi.ssid", ""), "shed");
        assert_eq!(config.get_int("debug", 0), 1);
        assert!(!config.contains("nested"));

        let exported = config.export_json().unwrap();
        let reparsed = parse_document(exported.as_bytes()).unwrap();
        assert_eq!(reparsed.get("wifi.timeout"), Some(&Value::from(12)));
    }

    #[test]
    fn test_set_from_text_keeps_type() {
        let mut config = store_with(&MemoryStore::new());
        config.set_int("station.poll_interval", 60);
        config.set_double("powersave.threshold", 3.6);

        config.set_from_text("station.poll_interval", "120").unwrap();
        config.set_from_text("powersave.threshold", "3.4").unwrap();
        config.set_from_text("station.name", "Creek").unwrap();

        assert_eq!(config.get("station.poll_interval"), Some(&Value::from(120)));
        assert_eq!(config.get_double("powersave.threshold", 0.0), 3.4);
        assert!(config.set_from_text("station.poll_interval", "soon").is_err());
    }

    #[test]
    fn test_failed_write_is_reported() {
        let kv = MemoryStore::new();
        kv.set_fail_writes(true);
        let mut config = store_with(&kv);
        config.set_int("a", 1);
        assert!(config.save().is_err());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("station-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let _ = fs::remove_file(&path);

        let mut file = FileStore::new(&path);
        assert!(file.load().unwrap().is_none());
        file.store(b"{\"a\": 1}").unwrap();
        assert_eq!(file.load().unwrap().unwrap(), b"{\"a\": 1}".to_vec());

        fs::remove_dir_all(&dir).unwrap();
    }
}
