//! Audit sink: every log event, redacted once, fanned out to subscribers and
//! appended to a size-rotated JSON-lines file.

use super::redact::{redact_map, redact_string, redact_value};
use crate::config::LoggingConfig;
use crate::lock;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::Layer;

const CHANNEL_CAPACITY: usize = 256;
const AUDIT_TARGET: &str = "tunebridge::audit";

/// One redacted log line as broadcast and persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Append-only log file that rotates to `<name>.1 .. <name>.N`.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            max_files,
            file: Some(file),
            size,
        })
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        let needed = line.len() as u64 + 1;
        if self.size > 0 && self.size + needed > self.max_bytes {
            self.rotate()?;
        }

        if self.file.is_none() {
            self.file = Some(open_append(&self.path)?);
        }
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{}", line)?;
            self.size += needed;
        }
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        if self.max_files == 0 {
            remove_if_exists(&self.path)?;
        } else {
            remove_if_exists(&self.generation(self.max_files))?;
            for n in (1..self.max_files).rev() {
                let from = self.generation(n);
                if from.exists() {
                    fs::rename(&from, self.generation(n + 1))?;
                }
            }
            fs::rename(&self.path, self.generation(1))?;
        }

        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

struct AuditSink {
    file: Option<Mutex<RotatingFile>>,
    tx: broadcast::Sender<LogEntry>,
}

/// Handle to the audit sink. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<AuditSink>,
}

impl AuditLogger {
    /// Opens the rotating file under `config.directory` (if set).
    pub fn new(config: &LoggingConfig) -> Result<Self> {
        let file = match &config.directory {
            Some(dir) => {
                let path = dir.join(&config.file_name);
                let file = RotatingFile::open(path.clone(), config.max_file_bytes, config.max_files)
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self::with_file(file))
    }

    /// Broadcast-only logger.
    pub fn without_file() -> Self {
        Self::with_file(None)
    }

    fn with_file(file: Option<Mutex<RotatingFile>>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(AuditSink { file, tx }),
        }
    }

    /// Receives every entry emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.tx.subscribe()
    }

    /// Logs `message` with arbitrary nested `metadata`. Both are redacted first.
    pub fn log(&self, level: Level, message: &str, metadata: Value) {
        let fields = match redact_value(&metadata) {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("metadata".to_string(), other);
                map
            }
        };

        self.emit(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            target: AUDIT_TARGET.to_string(),
            message: redact_string(message),
            fields,
        });
    }

    pub fn debug(&self, message: &str, metadata: Value) {
        self.log(Level::DEBUG, message, metadata);
    }

    pub fn info(&self, message: &str, metadata: Value) {
        self.log(Level::INFO, message, metadata);
    }

    pub fn warn(&self, message: &str, metadata: Value) {
        self.log(Level::WARN, message, metadata);
    }

    pub fn error(&self, message: &str, metadata: Value) {
        self.log(Level::ERROR, message, metadata);
    }

    /// Tracing layer feeding this logger.
    pub fn layer(&self) -> AuditLayer {
        AuditLayer {
            logger: self.clone(),
        }
    }

    // Must not emit tracing events: it runs inside the subscriber.
    fn emit(&self, entry: LogEntry) {
        if let Some(file) = &self.inner.file {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = lock(file).append(&line) {
                        eprintln!("audit log write failed: {}", e);
                    }
                }
                Err(e) => eprintln!("audit log serialization failed: {}", e),
            }
        }
        // No receivers is fine
        let _ = self.inner.tx.send(entry);
    }
}

/// Collects event fields into JSON.
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = text;
        } else {
            self.fields.insert(field.name().to_string(), Value::String(text));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}

/// Bridges `tracing` events into the [`AuditLogger`].
pub struct AuditLayer {
    logger: AuditLogger,
}

impl<S> Layer<S> for AuditLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor {
            message: String::new(),
            fields: Map::new(),
        };
        event.record(&mut visitor);

        self.logger.emit(LogEntry {
            timestamp: Utc::now(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: redact_string(&visitor.message),
            fields: redact_map(&visitor.fields),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::redact::REDACTED;
    use serde_json::json;
    use tracing_subscriber::layer::SubscriberExt;

    fn file_config(dir: &Path, max_file_bytes: u64, max_files: usize) -> LoggingConfig {
        LoggingConfig {
            directory: Some(dir.to_path_buf()),
            max_file_bytes,
            max_files,
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_log_redacts_metadata() {
        let logger = AuditLogger::without_file();
        let mut rx = logger.subscribe();

        logger.warn(
            "Token refresh failed",
            json!({
                "provider": "spotify",
                "refresh_token": "RT1",
                "response": { "status": 400, "body": { "access_token": "AT1" } }
            }),
        );

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.level, "WARN");
        assert_eq!(entry.fields["provider"], "spotify");
        assert_eq!(entry.fields["refresh_token"], REDACTED);
        assert_eq!(entry.fields["response"]["body"]["access_token"], REDACTED);
        assert_eq!(entry.fields["response"]["status"], 400);
    }

    #[test]
    fn test_layer_redacts_tracing_fields() {
        let logger = AuditLogger::without_file();
        let mut rx = logger.subscribe();
        let subscriber = tracing_subscriber::registry().with(logger.layer());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(
                provider = "spotify",
                refresh_token = %"RT1",
                error = "token endpoint returned 400: refresh_token=RT1",
                "Token refresh failed"
            );
        });

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.message, "Token refresh failed");
        assert_eq!(entry.fields["refresh_token"], REDACTED);
        let serialized = serde_json::to_string(&entry).unwrap();
        assert!(!serialized.contains("RT1"));
    }

    #[test]
    fn test_entries_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), 1024 * 1024, 3);
        let logger = AuditLogger::new(&config).unwrap();

        logger.info("first", json!({ "provider": "kick" }));
        logger.info("second", json!({ "code_verifier": "v-1" }));

        let contents = fs::read_to_string(dir.path().join("tunebridge.log")).unwrap();
        let entries: Vec<LogEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert!(!contents.contains("v-1"));
    }

    #[test]
    fn test_rotation_keeps_configured_generations() {
        let dir = tempfile::tempdir().unwrap();
        // Every entry is larger than the limit, so each write rotates
        let config = file_config(dir.path(), 64, 2);
        let logger = AuditLogger::new(&config).unwrap();

        for i in 0..5 {
            logger.info(&format!("entry {}", i), Value::Null);
        }

        let active = dir.path().join("tunebridge.log");
        let newest = dir.path().join("tunebridge.log.1");
        let older = dir.path().join("tunebridge.log.2");
        assert!(fs::read_to_string(&active).unwrap().contains("entry 4"));
        assert!(fs::read_to_string(&newest).unwrap().contains("entry 3"));
        assert!(fs::read_to_string(&older).unwrap().contains("entry 2"));
        assert!(!dir.path().join("tunebridge.log.3").exists());
    }

    #[test]
    fn test_scalar_metadata_is_wrapped() {
        let logger = AuditLogger::without_file();
        let mut rx = logger.subscribe();

        logger.error("Bearer AT1 rejected", json!("detail"));

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.message, "Bearer [REDACTED] rejected");
        assert_eq!(entry.fields["metadata"], "detail");
    }

    #[test]
    fn test_each_level_helper_tags_its_level() {
        let logger = AuditLogger::without_file();
        let mut rx = logger.subscribe();

        logger.debug("d", json!({ "clientSecret": "s" }));
        logger.info("i", Value::Null);
        logger.warn("w", Value::Null);
        logger.error("e", Value::Null);

        let levels: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|entry| entry.level)
            .collect();
        assert_eq!(levels, ["DEBUG", "INFO", "WARN", "ERROR"]);
    }
}
