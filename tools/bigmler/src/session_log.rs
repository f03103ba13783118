use crate::errors::BigmlerError;
use crate::runtime::{Clock, FileSystem, Terminal};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use time::macros::format_description;
use time::OffsetDateTime;

pub const SEPARATOR_WIDTH: usize = 80;

pub fn separator() -> String {
    "_".repeat(SEPARATOR_WIDTH)
}

pub fn dated(now: SystemTime, message: &str) -> Result<String, BigmlerError> {
    let stamp = OffsetDateTime::from(now)
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .map_err(|e| BigmlerError::Io(e.to_string()))?;
    Ok(format!("[{stamp}] {message}"))
}

/// Directory name used when a fresh run gives no `--output-dir`, e.g. `MonOct1926_093000`.
pub fn default_output_dir_name(now: SystemTime) -> Result<String, BigmlerError> {
    OffsetDateTime::from(now)
        .format(format_description!(
            "[weekday repr:short][month repr:short][day][year repr:last_two]_[hour][minute][second]"
        ))
        .map_err(|e| BigmlerError::Io(e.to_string()))
}

/// Human-readable progress log kept inside a run's output directory.
pub struct SessionLog<'a> {
    fs: &'a dyn FileSystem,
    clock: &'a dyn Clock,
    terminal: &'a dyn Terminal,
    path: PathBuf,
    echo: bool,
}

impl<'a> SessionLog<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        clock: &'a dyn Clock,
        terminal: &'a dyn Terminal,
        path: impl AsRef<Path>,
        echo: bool,
    ) -> Self {
        Self {
            fs,
            clock,
            terminal,
            path: path.as_ref().to_path_buf(),
            echo,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a timestamped progress line.
    pub fn step(&self, message: &str) -> Result<(), BigmlerError> {
        let line = dated(self.clock.now(), message)?;
        self.fs.append_line(&self.path, &line)?;
        if self.echo {
            self.terminal.write_line(&line)?;
        }
        Ok(())
    }

    /// Writes `text` as is; used for command lines and listings.
    pub fn raw(&self, text: &str) -> Result<(), BigmlerError> {
        self.fs.append_line(&self.path, text)
    }

    pub fn close(&self) -> Result<(), BigmlerError> {
        self.fs.append_line(&self.path, &separator())
    }

    pub fn clear(&self) -> Result<(), BigmlerError> {
        self.fs.truncate(&self.path)
    }
}
