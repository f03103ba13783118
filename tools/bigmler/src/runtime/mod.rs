use crate::api::http::HttpResourceApi;
use crate::api::ResourceApi;
use crate::config::ApiSettings;
use crate::errors::BigmlerError;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BigmlerError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, BigmlerError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), BigmlerError>;
    /// Appends `line` plus a newline and flushes before returning.
    fn append_line(&self, path: &Path, line: &str) -> Result<(), BigmlerError>;
    fn truncate(&self, path: &Path) -> Result<(), BigmlerError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), BigmlerError>;
    fn remove_file(&self, path: &Path) -> Result<(), BigmlerError>;
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, BigmlerError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), BigmlerError>;
    fn write_error_line(&self, line: &str) -> Result<(), BigmlerError>;
}

/// Builds the remote API client once credentials are known.
pub trait ApiConnector: Send + Sync {
    fn connect(&self, settings: &ApiSettings) -> Result<Arc<dyn ResourceApi>, BigmlerError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BigmlerError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, BigmlerError> {
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), BigmlerError> {
        std::fs::write(path, contents).map_err(|e| io_error(path, e))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), BigmlerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        file.write_all(&bytes)
            .and_then(|()| file.flush())
            .map_err(|e| io_error(path, e))
    }

    fn truncate(&self, path: &Path) -> Result<(), BigmlerError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| io_error(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), BigmlerError> {
        std::fs::create_dir_all(path).map_err(|e| io_error(path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<(), BigmlerError> {
        std::fs::remove_file(path).map_err(|e| io_error(path, e))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, BigmlerError> {
        let mut files = std::fs::read_dir(dir)
            .map_err(|e| io_error(dir, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

fn io_error(path: &Path, error: std::io::Error) -> BigmlerError {
    BigmlerError::Io(format!("{}: {error}", path.display()))
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), BigmlerError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| BigmlerError::Io(e.to_string()))
    }

    fn write_error_line(&self, line: &str) -> Result<(), BigmlerError> {
        let mut err = std::io::stderr();
        writeln!(err, "{line}").map_err(|e| BigmlerError::Io(e.to_string()))
    }
}

pub struct ProductionApiConnector;

impl ApiConnector for ProductionApiConnector {
    fn connect(&self, settings: &ApiSettings) -> Result<Arc<dyn ResourceApi>, BigmlerError> {
        Ok(Arc::new(HttpResourceApi::new(settings)?))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
    pub api_connector: Arc<dyn ApiConnector>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
            api_connector: Arc::new(ProductionApiConnector),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), BigmlerError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<BigmlerError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: BigmlerError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    fn maybe_fail(&self) -> Result<(), BigmlerError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, BigmlerError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| BigmlerError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), BigmlerError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), BigmlerError> {
        self.maybe_fail()?;
        let mut files = self.files.lock().expect("files lock");
        let entry = files.entry(path.to_path_buf()).or_default();
        entry.push_str(line);
        entry.push('\n');
        Ok(())
    }

    fn truncate(&self, path: &Path) -> Result<(), BigmlerError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), String::new());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), BigmlerError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), BigmlerError> {
        self.maybe_fail()?;
        self.files.lock().expect("files lock").remove(path);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, BigmlerError> {
        self.maybe_fail()?;
        let mut files = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
            || self.dirs.lock().expect("dirs lock").iter().any(|d| d == path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.lock().expect("errors lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), BigmlerError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_error_line(&self, line: &str) -> Result<(), BigmlerError> {
        self.errors
            .lock()
            .expect("errors lock")
            .push(line.to_string());
        Ok(())
    }
}

/// Hands out the same API instance on every connect and remembers the settings it saw.
#[derive(Clone)]
pub struct FakeApiConnector {
    api: Arc<dyn ResourceApi>,
    seen: Arc<Mutex<Vec<ApiSettings>>>,
}

impl FakeApiConnector {
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self {
            api,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn connections(&self) -> Vec<ApiSettings> {
        self.seen.lock().expect("seen lock").clone()
    }
}

impl ApiConnector for FakeApiConnector {
    fn connect(&self, settings: &ApiSettings) -> Result<Arc<dyn ResourceApi>, BigmlerError> {
        self.seen.lock().expect("seen lock").push(settings.clone());
        Ok(Arc::clone(&self.api))
    }
}
