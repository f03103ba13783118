use crate::command_log::{read_command_records, read_directory_entries, CommandRecord, RunId};
use crate::config::SessionConfig;
use crate::errors::BigmlerError;
use crate::runtime::FileSystem;
use std::path::{Path, PathBuf};

pub const DEBUG_FLAG: &str = "--debug";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommand {
    pub run_id: Option<RunId>,
    pub argv: Vec<String>,
    pub output_dir: PathBuf,
}

/// Rebuilds the last recorded command and the directory it wrote to.
///
/// `--debug` is taken from `current_argv` only: a stored `--debug` is
/// dropped unless the resuming invocation passes it again.
pub fn load_for_resume(
    fs: &dyn FileSystem,
    session: &SessionConfig,
    current_argv: &[String],
    default_output_dir: &Path,
) -> Result<StoredCommand, BigmlerError> {
    let records = read_command_records(fs, &session.command_log).map_err(|e| {
        BigmlerError::CorruptLog(format!(
            "cannot read {}: {e}",
            session.command_log.display()
        ))
    })?;
    let Some(last) = records.last() else {
        return Err(BigmlerError::CorruptLog(format!(
            "no previous command found in {}; nothing to resume",
            session.command_log.display()
        )));
    };
    if last.argv.is_empty() {
        return Err(BigmlerError::CorruptLog(format!(
            "last entry of {} is empty",
            session.command_log.display()
        )));
    }

    let output_dir = stored_output_dir(fs, session, last)?
        .unwrap_or_else(|| session.resolve(default_output_dir));

    let debug = current_argv.iter().any(|arg| arg == DEBUG_FLAG);
    let mut argv = last
        .argv
        .iter()
        .filter(|arg| arg.as_str() != DEBUG_FLAG)
        .cloned()
        .collect::<Vec<_>>();
    if debug {
        argv.push(DEBUG_FLAG.to_string());
    }

    Ok(StoredCommand {
        run_id: last.run_id.clone(),
        argv,
        output_dir,
    })
}

fn stored_output_dir(
    fs: &dyn FileSystem,
    session: &SessionConfig,
    record: &CommandRecord,
) -> Result<Option<PathBuf>, BigmlerError> {
    let entries = read_directory_entries(fs, &session.dir_log).map_err(|e| {
        BigmlerError::CorruptLog(format!("cannot read {}: {e}", session.dir_log.display()))
    })?;
    let found = match &record.run_id {
        Some(run_id) => entries
            .iter()
            .rev()
            .find(|entry| entry.run_id.as_ref() == Some(run_id)),
        None => entries.last(),
    };
    Ok(found.map(|entry| entry.absolute_path.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_log::{record_command, record_dir};
    use crate::config::AppConfig;
    use crate::runtime::{FakeFileSystem, FileSystem};
    use crate::types::CommandMode;

    fn session() -> SessionConfig {
        SessionConfig::new(&AppConfig::default(), Path::new("/work"), CommandMode::Main)
    }

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn empty_log_cannot_be_resumed() {
        let fs = FakeFileSystem::default();
        let err = load_for_resume(&fs, &session(), &argv(&["bigmler", "--resume"]), Path::new("x"))
            .expect_err("must fail");
        assert!(matches!(err, BigmlerError::CorruptLog(_)));
    }

    #[test]
    fn unreadable_log_is_corrupt() {
        let fs = FakeFileSystem::with_file("/work/.bigmler", "bigmler --name 'broken\n");
        let err = load_for_resume(&fs, &session(), &[], Path::new("x")).expect_err("must fail");
        assert!(matches!(err, BigmlerError::CorruptLog(_)));
    }

    #[test]
    fn resume_restores_last_command_and_its_directory() {
        let fs = FakeFileSystem::default();
        let session = session();
        let first = RunId::derive("first", 1);
        let second = RunId::derive("second", 2);
        record_command(&fs, &session, &argv(&["bigmler", "--train", "a.csv"]), &first, 1)
            .expect("record");
        record_dir(&fs, &session, &first, Path::new("run_a")).expect("dir");
        record_command(&fs, &session, &argv(&["bigmler", "--train", "b c.csv"]), &second, 2)
            .expect("record");
        record_dir(&fs, &session, &second, Path::new("run_b")).expect("dir");

        let stored = load_for_resume(&fs, &session, &argv(&["bigmler", "--resume"]), Path::new("x"))
            .expect("resume");
        assert_eq!(stored.argv, argv(&["bigmler", "--train", "b c.csv"]));
        assert_eq!(stored.output_dir, PathBuf::from("/work/run_b"));
        assert_eq!(stored.run_id, Some(second));
    }

    #[test]
    fn directory_is_matched_by_run_id_not_position() {
        let fs = FakeFileSystem::default();
        let session = session();
        let mine = RunId::derive("mine", 1);
        let other = RunId::derive("other", 2);
        record_command(&fs, &session, &argv(&["bigmler", "--train", "a.csv"]), &mine, 1)
            .expect("record");
        record_dir(&fs, &session, &mine, Path::new("mine")).expect("dir");
        record_dir(&fs, &session, &other, Path::new("interleaved")).expect("dir");

        let stored = load_for_resume(&fs, &session, &[], Path::new("x")).expect("resume");
        assert_eq!(stored.output_dir, PathBuf::from("/work/mine"));
    }

    #[test]
    fn missing_directory_falls_back_to_default() {
        let fs = FakeFileSystem::default();
        let session = session();
        let run_id = RunId::derive("x", 1);
        record_command(&fs, &session, &argv(&["bigmler"]), &run_id, 1).expect("record");
        let stored = load_for_resume(&fs, &session, &[], Path::new("fallback")).expect("resume");
        assert_eq!(stored.output_dir, PathBuf::from("/work/fallback"));
    }

    #[test]
    fn legacy_logs_use_the_last_lines() {
        let fs = FakeFileSystem::default();
        let session = session();
        fs.write_string(&session.command_log, "bigmler --train old.csv\nbigmler --train new.csv\n")
            .expect("seed");
        fs.write_string(&session.dir_log, "/work/old\n/work/new\n").expect("seed");
        let stored = load_for_resume(&fs, &session, &[], Path::new("x")).expect("resume");
        assert_eq!(stored.argv, argv(&["bigmler", "--train", "new.csv"]));
        assert_eq!(stored.output_dir, PathBuf::from("/work/new"));
    }

    #[test]
    fn debug_follows_the_resuming_invocation() {
        let fs = FakeFileSystem::default();
        let session = session();
        let run_id = RunId::derive("x", 1);
        let stored = argv(&["bigmler", "--debug", "--train", "a.csv"]);
        record_command(&fs, &session, &stored, &run_id, 1).expect("record");

        let plain = load_for_resume(&fs, &session, &argv(&["bigmler", "--resume"]), Path::new("x"))
            .expect("resume");
        assert_eq!(plain.argv, argv(&["bigmler", "--train", "a.csv"]));

        let debug = load_for_resume(
            &fs,
            &session,
            &argv(&["bigmler", "--resume", "--debug"]),
            Path::new("x"),
        )
        .expect("resume");
        assert_eq!(debug.argv, argv(&["bigmler", "--train", "a.csv", "--debug"]));
    }

    #[test]
    fn consecutive_resumes_resolve_the_same_directory() {
        let fs = FakeFileSystem::default();
        let session = session();
        let run_id = RunId::derive("x", 1);
        record_command(&fs, &session, &argv(&["bigmler", "--train", "a.csv"]), &run_id, 1)
            .expect("record");
        record_dir(&fs, &session, &run_id, Path::new("out")).expect("dir");
        let resume = argv(&["bigmler", "--resume"]);
        record_command(&fs, &session, &resume, &RunId::derive("y", 2), 2).expect("skipped");

        let first = load_for_resume(&fs, &session, &resume, Path::new("x")).expect("resume");
        let second = load_for_resume(&fs, &session, &resume, Path::new("x")).expect("resume");
        assert_eq!(first.output_dir, second.output_dir);
        assert_eq!(first.argv, second.argv);
    }
}
