use crate::errors::BigmlerError;
use crate::runtime::FileSystem;
use crate::types::Resource;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const CROSS_VALIDATION_FILE: &str = "cross_validation";

/// `base` with `.ext` appended, keeping any extension already there.
fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Writes `<base>.json` (the raw result) and `<base>.txt` (one metric per line).
pub fn write_evaluation(
    fs: &dyn FileSystem,
    base: &Path,
    evaluation: &Resource,
) -> Result<Vec<PathBuf>, BigmlerError> {
    let result = evaluation
        .object
        .get("result")
        .cloned()
        .unwrap_or(Value::Null);
    write_pair(fs, base, &result)
}

/// Averages every evaluation's `result.model` into `cross_validation.{json,txt}`.
pub fn write_cross_validation(
    fs: &dyn FileSystem,
    output_dir: &Path,
    evaluations: &[Resource],
) -> Result<Vec<PathBuf>, BigmlerError> {
    let models = evaluations
        .iter()
        .filter_map(|evaluation| evaluation.object.pointer("/result/model"))
        .collect::<Vec<_>>();
    let averaged = average_numeric_leaves(&models);
    write_pair(fs, &output_dir.join(CROSS_VALIDATION_FILE), &averaged)
}

fn write_pair(
    fs: &dyn FileSystem,
    base: &Path,
    value: &Value,
) -> Result<Vec<PathBuf>, BigmlerError> {
    let json_path = with_suffix(base, "json");
    let text_path = with_suffix(base, "txt");
    let pretty =
        serde_json::to_string_pretty(value).map_err(|e| BigmlerError::Io(e.to_string()))?;
    fs.write_string(&json_path, &pretty)?;
    let mut lines = Vec::new();
    flatten("", value, &mut lines);
    fs.write_string(&text_path, &format!("{}\n", lines.join("\n")))?;
    Ok(vec![json_path, text_path])
}

/// `path: value` lines for every scalar leaf, objects walked in key order.
pub fn flatten(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        Value::Null => {}
        Value::String(text) => out.push(format!("{prefix}: {text}")),
        other => out.push(format!("{prefix}: {other}")),
    }
}

/// Mean of numeric leaves present in every value; other leaves come from the first.
pub fn average_numeric_leaves(values: &[&Value]) -> Value {
    let Some(first) = values.first() else {
        return Value::Object(Map::new());
    };
    match first {
        Value::Object(map) => {
            let mut averaged = Map::new();
            for key in map.keys() {
                let children = values
                    .iter()
                    .filter_map(|value| value.get(key))
                    .collect::<Vec<_>>();
                averaged.insert(key.clone(), average_numeric_leaves(&children));
            }
            Value::Object(averaged)
        }
        Value::Number(_) => {
            let numbers = values.iter().filter_map(|v| v.as_f64()).collect::<Vec<_>>();
            if numbers.len() != values.len() {
                return (*first).clone();
            }
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            serde_json::Number::from_f64(mean)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        other => (*other).clone(),
    }
}
