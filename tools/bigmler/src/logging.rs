use crate::errors::BigmlerError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn clear(&self) -> Result<(), BigmlerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BigmlerError::Io(e.to_string()))?;
        }
        fs::write(&self.path, "").map_err(|e| BigmlerError::Io(e.to_string()))
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), BigmlerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BigmlerError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| BigmlerError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BigmlerError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| BigmlerError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| BigmlerError::Io(e.to_string()))?;
        Ok(())
    }
}

struct RunLogger {
    file: Option<JsonlLogger>,
    debug: bool,
}

static RUN_LOGGER: OnceLock<Mutex<Option<RunLogger>>> = OnceLock::new();

fn run_logger_slot() -> &'static Mutex<Option<RunLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide run logger. The `--log-file` target is emptied first.
pub fn init_run_logger(path: Option<&Path>, debug: bool) -> Result<(), BigmlerError> {
    let file = match path {
        Some(path) => {
            let logger = JsonlLogger::new(path);
            logger.clear()?;
            Some(logger)
        }
        None => None,
    };
    if let Ok(mut slot) = run_logger_slot().lock() {
        *slot = Some(RunLogger { file, debug });
    }
    Ok(())
}

/// Records a structured event. Debug events are kept only when `--debug` is active,
/// in which case they are also echoed to stderr.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(slot) = run_logger_slot().lock() else {
        return;
    };
    let Some(logger) = slot.as_ref() else {
        return;
    };
    if level == "debug" {
        if !logger.debug {
            return;
        }
        eprintln!(
            "{}",
            structured_fallback_line(event_type, level, &payload.to_string())
        );
    }
    if let Some(file) = &logger.file {
        let _ = file.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

pub fn structured_fallback_line(event_type: &str, level: &str, message: &str) -> String {
    format!(
        "event={event_type} level={level} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
