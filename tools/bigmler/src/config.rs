use crate::errors::BigmlerError;
use crate::runtime::FileSystem;
use crate::types::CommandMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULTS_FILE: &str = ".bigmler_defaults";
pub const USERNAME_ENV: &str = "BIGML_USERNAME";
pub const API_KEY_ENV: &str = "BIGML_API_KEY";

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub logs: LogsConfig,
    pub api: ApiConfig,
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsConfig {
    pub command_log: String,
    pub dir_log: String,
    pub cluster_command_log: String,
    pub cluster_dir_log: String,
    pub sessions_log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportsConfig {
    pub upload_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logs: LogsConfig {
                command_log: ".bigmler".to_string(),
                dir_log: ".bigmler_dir_stack".to_string(),
                cluster_command_log: ".bigmler_cluster".to_string(),
                cluster_dir_log: ".bigmler_cluster_dir_stack".to_string(),
                sessions_log: "bigmler_sessions".to_string(),
            },
            api: ApiConfig {
                base_url: "https://bigml.io/andromeda/".to_string(),
                username: None,
                api_key: None,
                poll_interval_ms: 1000,
                max_polls: 3600,
            },
            reports: ReportsConfig { upload_url: None },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    logs: Option<PartialLogsConfig>,
    api: Option<PartialApiConfig>,
    reports: Option<PartialReportsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLogsConfig {
    command_log: Option<String>,
    dir_log: Option<String>,
    cluster_command_log: Option<String>,
    cluster_dir_log: Option<String>,
    sessions_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialApiConfig {
    base_url: Option<String>,
    username: Option<String>,
    api_key: Option<String>,
    poll_interval_ms: Option<u64>,
    max_polls: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReportsConfig {
    upload_url: Option<String>,
}

/// Loads `.bigmler_defaults` from `cwd` when present and merges it over the built-in defaults.
pub fn load_config(cwd: &Path, fs: &dyn FileSystem) -> Result<AppConfig, BigmlerError> {
    let mut cfg = AppConfig::default();
    let path = cwd.join(DEFAULTS_FILE);
    if fs.exists(&path) {
        let contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig =
            toml::from_str(&contents).map_err(|e| BigmlerError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(logs) = partial.logs {
        if let Some(value) = logs.command_log {
            cfg.logs.command_log = value;
        }
        if let Some(value) = logs.dir_log {
            cfg.logs.dir_log = value;
        }
        if let Some(value) = logs.cluster_command_log {
            cfg.logs.cluster_command_log = value;
        }
        if let Some(value) = logs.cluster_dir_log {
            cfg.logs.cluster_dir_log = value;
        }
        if let Some(value) = logs.sessions_log {
            cfg.logs.sessions_log = value;
        }
    }

    if let Some(api) = partial.api {
        if let Some(value) = api.base_url {
            cfg.api.base_url = value;
        }
        if api.username.is_some() {
            cfg.api.username = api.username;
        }
        if api.api_key.is_some() {
            cfg.api.api_key = api.api_key;
        }
        if let Some(value) = api.poll_interval_ms {
            cfg.api.poll_interval_ms = value;
        }
        if let Some(value) = api.max_polls {
            cfg.api.max_polls = value;
        }
    }

    if let Some(reports) = partial.reports {
        if reports.upload_url.is_some() {
            cfg.reports.upload_url = reports.upload_url;
        }
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), BigmlerError> {
    for (key, value) in [
        ("logs.command_log", &cfg.logs.command_log),
        ("logs.dir_log", &cfg.logs.dir_log),
        ("logs.cluster_command_log", &cfg.logs.cluster_command_log),
        ("logs.cluster_dir_log", &cfg.logs.cluster_dir_log),
        ("logs.sessions_log", &cfg.logs.sessions_log),
    ] {
        if value.trim().is_empty() {
            return Err(BigmlerError::InvalidConfig(format!(
                "{key} must not be empty"
            )));
        }
    }
    if cfg.api.max_polls == 0 {
        return Err(BigmlerError::InvalidConfig(
            "api.max_polls must be greater than zero".to_string(),
        ));
    }
    if !cfg.api.base_url.ends_with('/') {
        return Err(BigmlerError::InvalidConfig(
            "api.base_url must end with `/`".to_string(),
        ));
    }
    Ok(())
}

/// Log locations and naming for one invocation, built once and passed everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub mode: CommandMode,
    pub cwd: PathBuf,
    pub command_log: PathBuf,
    pub dir_log: PathBuf,
    pub sessions_log_name: String,
    pub defaults_file: PathBuf,
}

impl SessionConfig {
    pub fn new(cfg: &AppConfig, cwd: &Path, mode: CommandMode) -> Self {
        let (command_log, dir_log) = match mode {
            CommandMode::Main => (&cfg.logs.command_log, &cfg.logs.dir_log),
            CommandMode::Cluster => (&cfg.logs.cluster_command_log, &cfg.logs.cluster_dir_log),
        };
        Self {
            mode,
            cwd: cwd.to_path_buf(),
            command_log: absolutize_path(cwd, Path::new(command_log)),
            dir_log: absolutize_path(cwd, Path::new(dir_log)),
            sessions_log_name: cfg.logs.sessions_log.clone(),
            defaults_file: cwd.join(DEFAULTS_FILE),
        }
    }

    pub fn session_log_in(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.sessions_log_name)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        absolutize_path(&self.cwd, path)
    }
}

pub fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub upload_url: Option<String>,
}

/// Credentials resolve CLI flag first, then environment, then the defaults file.
pub fn resolve_api_settings(
    cfg: &AppConfig,
    env: &EnvMap,
    cli_username: Option<&str>,
    cli_api_key: Option<&str>,
) -> Result<ApiSettings, BigmlerError> {
    let username = cli_username
        .map(str::to_string)
        .or_else(|| env.get(USERNAME_ENV).cloned())
        .or_else(|| cfg.api.username.clone())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            BigmlerError::InvalidConfig(format!(
                "missing API username: pass --username or set {USERNAME_ENV}"
            ))
        })?;
    let api_key = cli_api_key
        .map(str::to_string)
        .or_else(|| env.get(API_KEY_ENV).cloned())
        .or_else(|| cfg.api.api_key.clone())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            BigmlerError::InvalidConfig(format!(
                "missing API key: pass --api-key or set {API_KEY_ENV}"
            ))
        })?;
    Ok(ApiSettings {
        base_url: cfg.api.base_url.clone(),
        username,
        api_key,
        poll_interval_ms: cfg.api.poll_interval_ms,
        max_polls: cfg.api.max_polls,
        upload_url: cfg.reports.upload_url.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn defaults_apply_without_a_defaults_file() {
        let fs = FakeFileSystem::default();
        let cfg = load_config(Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn partial_defaults_file_overrides_only_named_keys() {
        let fs = FakeFileSystem::with_file(
            "/work/.bigmler_defaults",
            "[logs]\ncommand_log = \".runs\"\n[api]\nmax_polls = 7\n",
        );
        let cfg = load_config(Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg.logs.command_log, ".runs");
        assert_eq!(cfg.logs.dir_log, ".bigmler_dir_stack");
        assert_eq!(cfg.api.max_polls, 7);
        assert_eq!(cfg.api.poll_interval_ms, 1000);
    }

    #[test]
    fn malformed_defaults_file_is_a_parse_error() {
        let fs = FakeFileSystem::with_file("/work/.bigmler_defaults", "[logs\n");
        let err = load_config(Path::new("/work"), &fs).expect_err("must fail");
        assert!(matches!(err, BigmlerError::ConfigParse(_)));
    }

    #[test]
    fn empty_log_name_is_rejected() {
        let fs = FakeFileSystem::with_file("/work/.bigmler_defaults", "[logs]\ndir_log = \" \"\n");
        let err = load_config(Path::new("/work"), &fs).expect_err("must fail");
        assert!(matches!(err, BigmlerError::InvalidConfig(message) if message.contains("dir_log")));
    }

    #[test]
    fn session_config_uses_mode_specific_logs() {
        let cfg = AppConfig::default();
        let main = SessionConfig::new(&cfg, Path::new("/work"), CommandMode::Main);
        let cluster = SessionConfig::new(&cfg, Path::new("/work"), CommandMode::Cluster);
        assert_eq!(main.command_log, PathBuf::from("/work/.bigmler"));
        assert_eq!(cluster.command_log, PathBuf::from("/work/.bigmler_cluster"));
        assert_eq!(cluster.dir_log, PathBuf::from("/work/.bigmler_cluster_dir_stack"));
        assert_eq!(
            main.session_log_in(Path::new("/work/out")),
            PathBuf::from("/work/out/bigmler_sessions")
        );
    }

    #[test]
    fn credentials_prefer_cli_then_env_then_file() {
        let mut cfg = AppConfig::default();
        cfg.api.username = Some("file-user".to_string());
        cfg.api.api_key = Some("file-key".to_string());
        let mut env = EnvMap::new();
        env.insert(USERNAME_ENV.to_string(), "env-user".to_string());

        let settings = resolve_api_settings(&cfg, &env, None, Some("cli-key")).expect("settings");
        assert_eq!(settings.username, "env-user");
        assert_eq!(settings.api_key, "cli-key");

        let settings = resolve_api_settings(&cfg, &EnvMap::new(), None, None).expect("settings");
        assert_eq!(settings.username, "file-user");
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = resolve_api_settings(&AppConfig::default(), &EnvMap::new(), None, None)
            .expect_err("must fail");
        assert!(matches!(
            err,
            BigmlerError::InvalidConfig(message) if message.contains(USERNAME_ENV)
        ));
    }
}
