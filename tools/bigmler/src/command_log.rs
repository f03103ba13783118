//! Cross-run command and directory logs.
//!
//! Both files stay line-oriented text. Each line is modelled as a typed
//! event; current lines carry the run id that ties a command to the output
//! directory it produced (`<run_id>\t<unix_secs>\t<command>` and
//! `<run_id>\t<path>`). Lines without a run id are read positionally.

use crate::command_line;
use crate::config::SessionConfig;
use crate::errors::BigmlerError;
use crate::runtime::FileSystem;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

pub const RESUME_FLAG: &str = "--resume";
pub const CLEAR_LOGS_FLAG: &str = "--clear-logs";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn derive(command: &str, timestamp_ns: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(command.as_bytes());
        hasher.update(timestamp_ns.to_be_bytes());
        let digest = hasher.finalize();
        let hex = digest[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        Self(format!("r-{hex}"))
    }

    pub fn parse(value: &str) -> Option<Self> {
        let hex = value.strip_prefix("r-")?;
        if hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub run_id: Option<RunId>,
    pub timestamp: Option<u64>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStackEntry {
    pub run_id: Option<RunId>,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    RunStarted(CommandRecord),
    DirectoryUsed(DirectoryStackEntry),
}

impl LogEvent {
    pub fn to_line(&self) -> String {
        match self {
            Self::RunStarted(record) => {
                let command = command_line::join(&record.argv);
                match &record.run_id {
                    Some(run_id) => {
                        format!("{run_id}\t{}\t{command}", record.timestamp.unwrap_or(0))
                    }
                    None => command,
                }
            }
            Self::DirectoryUsed(entry) => {
                let path = entry.absolute_path.display();
                match &entry.run_id {
                    Some(run_id) => format!("{run_id}\t{path}"),
                    None => path.to_string(),
                }
            }
        }
    }
}

pub fn parse_command_line(line: &str) -> Result<CommandRecord, BigmlerError> {
    let mut parts = line.splitn(3, '\t');
    if let (Some(first), Some(second), Some(command)) = (parts.next(), parts.next(), parts.next()) {
        if let (Some(run_id), Ok(timestamp)) = (RunId::parse(first), second.parse::<u64>()) {
            return Ok(CommandRecord {
                run_id: Some(run_id),
                timestamp: Some(timestamp),
                argv: command_line::split(command)?,
            });
        }
    }
    Ok(CommandRecord {
        run_id: None,
        timestamp: None,
        argv: command_line::split(line)?,
    })
}

pub fn parse_directory_line(line: &str) -> DirectoryStackEntry {
    if let Some((first, path)) = line.split_once('\t') {
        if let Some(run_id) = RunId::parse(first) {
            return DirectoryStackEntry {
                run_id: Some(run_id),
                absolute_path: PathBuf::from(path),
            };
        }
    }
    DirectoryStackEntry {
        run_id: None,
        absolute_path: PathBuf::from(line),
    }
}

pub fn is_resume(argv: &[String]) -> bool {
    argv.iter().any(|arg| arg == RESUME_FLAG)
}

pub fn wants_clear_logs(argv: &[String]) -> bool {
    argv.iter().any(|arg| arg == CLEAR_LOGS_FLAG)
}

/// Appends the invoking command to the command log.
///
/// Resumed invocations are never recorded, so the log only ever holds
/// original commands. Returns the record that was written, if any.
pub fn record_command(
    fs: &dyn FileSystem,
    session: &SessionConfig,
    argv: &[String],
    run_id: &RunId,
    timestamp: u64,
) -> Result<Option<CommandRecord>, BigmlerError> {
    if is_resume(argv) {
        return Ok(None);
    }
    let record = CommandRecord {
        run_id: Some(run_id.clone()),
        timestamp: Some(timestamp),
        argv: argv.to_vec(),
    };
    fs.append_line(
        &session.command_log,
        &LogEvent::RunStarted(record.clone()).to_line(),
    )?;
    Ok(Some(record))
}

pub fn record_dir(
    fs: &dyn FileSystem,
    session: &SessionConfig,
    run_id: &RunId,
    path: &Path,
) -> Result<(), BigmlerError> {
    let entry = DirectoryStackEntry {
        run_id: Some(run_id.clone()),
        absolute_path: session.resolve(path),
    };
    fs.append_line(&session.dir_log, &LogEvent::DirectoryUsed(entry).to_line())
}

/// Truncates every given log. Files that cannot be truncated are skipped.
pub fn clear_logs(fs: &dyn FileSystem, paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|path| fs.truncate(path).is_ok())
        .cloned()
        .collect()
}

fn read_lines(fs: &dyn FileSystem, path: &Path) -> Result<Vec<String>, BigmlerError> {
    if !fs.exists(path) {
        return Ok(Vec::new());
    }
    Ok(fs
        .read_to_string(path)?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

pub fn read_command_records(
    fs: &dyn FileSystem,
    path: &Path,
) -> Result<Vec<CommandRecord>, BigmlerError> {
    read_lines(fs, path)?
        .iter()
        .map(|line| parse_command_line(line))
        .collect()
}

pub fn read_directory_entries(
    fs: &dyn FileSystem,
    path: &Path,
) -> Result<Vec<DirectoryStackEntry>, BigmlerError> {
    Ok(read_lines(fs, path)?
        .iter()
        .map(|line| parse_directory_line(line))
        .collect())
}
