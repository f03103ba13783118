//! End-of-run reporting: the generated-files listing in the session log and
//! the optional `reports/summary.json`.

use crate::api::ResourceApi;
use crate::config::ApiSettings;
use crate::errors::BigmlerError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use crate::session_log::SessionLog;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const REPORTS_DIR: &str = "reports";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Option<String>,
    pub command: String,
    pub output_dir: String,
    /// Resource ids by stage name.
    pub resources: BTreeMap<String, Vec<String>>,
    pub generated_files: Vec<String>,
}

/// Lists the files directly under `output_dir` into the session log and
/// returns their names.
pub fn print_generated_files(
    fs: &dyn FileSystem,
    session: &SessionLog<'_>,
    output_dir: &Path,
) -> Result<Vec<String>, BigmlerError> {
    let names = fs
        .list_files(output_dir)?
        .iter()
        .filter_map(|path| path.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    session.raw("")?;
    session.raw(&format!("Generated files in {}:", output_dir.display()))?;
    for name in &names {
        session.raw(&format!(" - {name}"))?;
    }
    Ok(names)
}

pub fn write_summary(
    fs: &dyn FileSystem,
    output_dir: &Path,
    summary: &RunSummary,
) -> Result<PathBuf, BigmlerError> {
    let dir = output_dir.join(REPORTS_DIR);
    fs.create_dir_all(&dir)?;
    let path = dir.join(SUMMARY_FILE);
    let body = serde_json::to_string_pretty(summary).map_err(|e| BigmlerError::Io(e.to_string()))?;
    fs.write_string(&path, &body)?;
    Ok(path)
}

/// Posts the summary to `[reports] upload_url`; returns where it landed.
pub fn upload_summary(
    api: &dyn ResourceApi,
    settings: &ApiSettings,
    summary: &RunSummary,
) -> Result<String, BigmlerError> {
    let url = settings.upload_url.as_deref().ok_or_else(|| {
        BigmlerError::InvalidConfig(
            "--upload needs [reports] upload_url in .bigmler_defaults".to_string(),
        )
    })?;
    let body = serde_json::to_value(summary).map_err(|e| BigmlerError::Io(e.to_string()))?;
    let location = api.upload_report(url, &body)?;
    append_run_log("info", "report.uploaded", json!({"location": location}));
    Ok(location)
}
