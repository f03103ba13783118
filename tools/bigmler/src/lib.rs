pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod cluster_dispatcher;
pub mod command_line;
pub mod command_log;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod evaluation;
pub mod logging;
pub mod preflight;
pub mod reports;
pub mod resume;
pub mod runtime;
pub mod session_log;
pub mod stage;
pub mod types;

use checkpoint::Checkpoints;
use clap::error::ErrorKind;
use cli::{parse_invocation, Invocation};
use command_log::{clear_logs, is_resume, record_command, record_dir, wants_clear_logs, RunId};
use config::{load_config, resolve_api_settings, EnvMap, SessionConfig};
use dispatcher::{Pipeline, RunEnv, RunPaths};
use errors::BigmlerError;
use logging::{append_run_log, init_run_logger};
use runtime::{FileSystem, ProductionRuntime};
use serde_json::json;
use session_log::{default_output_dir_name, SessionLog};
use stage::PipelineCursor;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Program name written as the first token of every recorded command.
pub const PROGRAM_NAME: &str = "bigmler";

pub fn run() -> Result<i32, BigmlerError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| BigmlerError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[OsString],
    env: &[(OsString, OsString)],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, BigmlerError> {
    let argv = utf8_argv(args)?;
    let env_map = env_to_map(env);
    let fs = runtime.file_system.as_ref();
    let app_config = load_config(cwd, fs)?;
    let session = SessionConfig::new(&app_config, cwd, cli::mode_of(&argv));

    let clearing = wants_clear_logs(&argv);
    if clearing {
        let targets = [session.command_log.clone(), session.dir_log.clone()];
        let cleared = clear_logs(fs, &targets);
        if cleared.len() < targets.len() {
            runtime
                .terminal
                .write_error_line("Some logs could not be cleared.")?;
        }
    }

    let resuming = is_resume(&argv);
    let now = runtime.clock.now();
    let fallback_dir = PathBuf::from(default_output_dir_name(now)?);
    let (effective_argv, stored_run_id, stored_dir) = if resuming {
        let stored = resume::load_for_resume(fs, &session, &argv, &fallback_dir)?;
        (stored.argv, stored.run_id, Some(stored.output_dir))
    } else {
        (recorded_argv(&argv), None, None)
    };

    let invocation = match parse_invocation(&effective_argv) {
        Ok(invocation) => invocation,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(BigmlerError::Cli(error.to_string())),
        },
    };
    let common = invocation.common();
    let log_file = common.log_file.as_deref().map(|path| session.resolve(path));
    init_run_logger(log_file.as_deref(), common.debug)?;
    preflight::validate(&invocation)?;

    let command_text = command_line::join(&effective_argv);
    let run_id = match stored_run_id {
        Some(run_id) => Some(run_id),
        None if resuming => None,
        None => {
            let run_id = RunId::derive(&command_text, unix_nanos(now));
            record_command(fs, &session, &effective_argv, &run_id, unix_secs(now))?;
            Some(run_id)
        }
    };
    append_run_log(
        "info",
        "run.started",
        json!({
            "run_id": run_id.as_ref().map(ToString::to_string),
            "resume": resuming,
            "mode": session.mode.as_str(),
        }),
    );

    let paths = RunPaths::resolve(
        cwd,
        stored_dir.as_deref().or(common.output_dir.as_deref()),
        common.predictions.as_deref(),
        invocation.default_output_name(),
        &fallback_dir,
    );
    fs.create_dir_all(&paths.output_dir)?;
    if !resuming {
        let inputs = invocation
            .input_files()
            .into_iter()
            .map(|path| session.resolve(path))
            .collect::<Vec<_>>();
        Checkpoints::new(fs, &paths.output_dir).reset(&inputs)?;
    }
    let session_log = SessionLog::new(
        fs,
        runtime.clock.as_ref(),
        runtime.terminal.as_ref(),
        session.session_log_in(&paths.output_dir),
        common.verbosity > 0,
    );
    if clearing && session_log.clear().is_err() {
        append_run_log(
            "warn",
            "session_log.clear_failed",
            json!({"path": session_log.path().display().to_string()}),
        );
    }

    if resuming {
        session_log.step(&format!("Resuming: {command_text}"))?;
    } else {
        session_log.raw(&command_text)?;
        copy_defaults(fs, &session, &paths.output_dir);
        if let Some(run_id) = &run_id {
            record_dir(fs, &session, run_id, &paths.output_dir)?;
        }
    }

    let mut cursor = PipelineCursor::new(resuming);
    if invocation.has_work() {
        let settings = resolve_api_settings(
            &app_config,
            &env_map,
            common.username.as_deref(),
            common.api_key.as_deref(),
        )?;
        let api = runtime.api_connector.connect(&settings)?;
        let run_id_text = run_id.as_ref().map(ToString::to_string);
        let mut pipeline = Pipeline::new(RunEnv {
            api: api.as_ref(),
            clock: runtime.clock.as_ref(),
            fs,
            session: &session_log,
            settings: &settings,
            paths: &paths,
            run_id: run_id_text.as_deref(),
            command: &command_text,
        });
        let outcome = match &invocation {
            Invocation::Main(cli) => dispatcher::run_main(&mut pipeline, &mut cursor, cli),
            Invocation::Cluster(cli) => {
                cluster_dispatcher::run_cluster(&mut pipeline, &mut cursor, cli)
            }
        };
        if let Err(error) = outcome {
            let reason = cursor
                .failure_reason()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            append_run_log("error", "run.failed", json!({"reason": reason}));
            let _ = session_log.step(&format!("Run failed at {reason}"));
            let _ = session_log.close();
            return Err(error);
        }
    } else {
        session_log.step("No training or test data given; nothing to build.")?;
    }

    append_run_log(
        "info",
        "run.completed",
        json!({"output_dir": paths.output_dir.display().to_string()}),
    );
    session_log.close()?;
    Ok(0)
}

fn utf8_argv(args: &[OsString]) -> Result<Vec<String>, BigmlerError> {
    args.iter()
        .map(|arg| {
            arg.to_str().map(str::to_string).ok_or_else(|| {
                let lossy = arg.to_string_lossy();
                BigmlerError::Cli(format!("argument is not valid UTF-8: {lossy}"))
            })
        })
        .collect()
}

/// The invocation as it is logged: program name first, flags untouched.
fn recorded_argv(argv: &[String]) -> Vec<String> {
    std::iter::once(PROGRAM_NAME.to_string())
        .chain(argv.iter().skip(1).cloned())
        .collect()
}

fn env_to_map(env: &[(OsString, OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

fn unix_secs(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn unix_nanos(now: SystemTime) -> u128 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0)
}

/// Copies the defaults file into a new output directory. Failures are only logged.
fn copy_defaults(fs: &dyn FileSystem, session: &SessionConfig, output_dir: &Path) {
    if !fs.exists(&session.defaults_file) {
        return;
    }
    let Some(name) = session.defaults_file.file_name() else {
        return;
    };
    let copied = fs
        .read_to_string(&session.defaults_file)
        .and_then(|contents| fs.write_string(&output_dir.join(name), &contents));
    if let Err(error) = copied {
        append_run_log(
            "warn",
            "defaults.copy_failed",
            json!({"error": error.to_string()}),
        );
    }
}
