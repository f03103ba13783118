use bigmler::api::fake::FakeResourceApi;
use bigmler::api::Origin;
use bigmler::errors::{BigmlerError, ValidationError};
use bigmler::runtime::{
    FakeApiConnector, FakeClock, FakeTerminal, ProductionFileSystem, ProductionRuntime,
};
use bigmler::run_with_runtime;
use bigmler::types::{ResourceId, ResourceKind};
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

/// 2026-10-19 09:30:00 UTC.
const MONDAY_MORNING: u64 = 1_792_402_200;
const DEFAULT_DIR: &str = "MonOct1926_093000";
const SEPARATOR: &str =
    "________________________________________________________________________________";

struct Harness {
    dir: TempDir,
    api: FakeResourceApi,
    connector: FakeApiConnector,
    runtime: ProductionRuntime,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("iris.csv"),
            "sepal length,species\n5.1,Iris-setosa\n7.0,Iris-versicolor\n",
        )
        .expect("write iris");
        let api = FakeResourceApi::default();
        let connector = FakeApiConnector::new(Arc::new(api.clone()));
        let runtime = ProductionRuntime {
            clock: Arc::new(FakeClock::new(
                UNIX_EPOCH + Duration::from_secs(MONDAY_MORNING),
            )),
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(FakeTerminal::default()),
            api_connector: Arc::new(connector.clone()),
        };
        Self {
            dir,
            api,
            connector,
            runtime,
        }
    }

    fn run(&self, args: &[&str]) -> Result<i32, BigmlerError> {
        let args = std::iter::once("bigmler")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect::<Vec<_>>();
        let env = vec![
            (OsString::from("BIGML_USERNAME"), OsString::from("alice")),
            (OsString::from("BIGML_API_KEY"), OsString::from("secret")),
        ];
        run_with_runtime(&args, &env, self.dir.path(), &self.runtime)
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn lines(&self, relative: &str) -> Vec<String> {
        read_lines(&self.path(relative))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn cleared_logs_then_one_run_leaves_one_entry_per_log() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--output-dir", "first"])
        .expect("first run");
    harness
        .run(&["--train", "iris.csv", "--output-dir", "second"])
        .expect("second run");
    assert_eq!(harness.lines(".bigmler").len(), 2);

    harness
        .run(&["--train", "iris.csv", "--clear-logs"])
        .expect("cleared run");

    assert_eq!(harness.lines(".bigmler").len(), 1);
    let dirs = harness.lines(".bigmler_dir_stack");
    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].ends_with(&harness.path(DEFAULT_DIR).display().to_string()));

    let session = harness.lines(&format!("{DEFAULT_DIR}/bigmler_sessions"));
    assert_eq!(
        session.first().map(String::as_str),
        Some("bigmler --train iris.csv --clear-logs")
    );
    assert_eq!(session.last().map(String::as_str), Some(SEPARATOR));
    assert_eq!(SEPARATOR.len(), 80);
}

#[test]
fn resumed_runs_add_no_command_log_lines() {
    let harness = Harness::new();
    for dir in ["a", "b", "c"] {
        harness
            .run(&["--train", "iris.csv", "--output-dir", dir])
            .expect("run");
    }
    assert_eq!(harness.lines(".bigmler").len(), 3);
    assert_eq!(harness.api.creates(ResourceKind::Source).len(), 3);

    harness.run(&["--resume"]).expect("resume");

    assert_eq!(harness.lines(".bigmler").len(), 3);
    assert_eq!(harness.lines(".bigmler_dir_stack").len(), 3);
    assert_eq!(harness.api.creates(ResourceKind::Source).len(), 3);
    assert_eq!(harness.api.creates(ResourceKind::Model).len(), 3);
    let session = harness.lines("c/bigmler_sessions");
    assert!(session
        .iter()
        .any(|line| line.ends_with("Resuming: bigmler --train iris.csv --output-dir c")));
}

#[test]
fn resume_after_dataset_goes_straight_to_model_creation() {
    let harness = Harness::new();
    harness
        .api
        .fail_creates(ResourceKind::Model, "model quota exceeded");

    let interrupted = harness.run(&["--train", "iris.csv", "--output-dir", "out"]);
    assert!(matches!(interrupted, Err(BigmlerError::Api(_))));
    let dataset = harness.lines("out/dataset");
    assert_eq!(dataset.len(), 1);
    assert!(!harness.path("out/models").exists());

    harness.api.allow_creates(ResourceKind::Model);
    assert_eq!(harness.run(&["--resume"]).expect("resume"), 0);

    assert_eq!(harness.api.creates(ResourceKind::Source).len(), 1);
    assert_eq!(harness.api.creates(ResourceKind::Dataset).len(), 1);
    let models = harness.api.creates(ResourceKind::Model);
    assert_eq!(models.len(), 2);
    let dataset_id = ResourceId::parse(&dataset[0]).expect("dataset id");
    assert_eq!(models[1].origin, Origin::Resource(dataset_id));
    assert_eq!(harness.lines("out/models").len(), 1);
    assert_eq!(harness.lines(".bigmler").len(), 1);
}

#[test]
fn resume_in_a_reused_output_dir_ignores_resources_of_earlier_runs() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--output-dir", "out"])
        .expect("first run");
    let first_model = harness.lines("out/models");
    assert_eq!(first_model.len(), 1);

    std::fs::write(harness.path("other.csv"), "a,b\n1,x\n2,y\n").expect("write other");
    harness
        .api
        .fail_creates(ResourceKind::Model, "model quota exceeded");
    let interrupted = harness.run(&["--train", "other.csv", "--output-dir", "out"]);
    assert!(matches!(interrupted, Err(BigmlerError::Api(_))));
    assert!(!harness.path("out/models").exists());
    let second_dataset = harness.lines("out/dataset");
    assert_eq!(second_dataset.len(), 1);

    harness.api.allow_creates(ResourceKind::Model);
    harness.run(&["--resume"]).expect("resume");

    let models = harness.api.creates(ResourceKind::Model);
    assert_eq!(models.len(), 3);
    let dataset_id = ResourceId::parse(&second_dataset[0]).expect("dataset id");
    assert_eq!(models[2].origin, Origin::Resource(dataset_id));
    let resumed_model = harness.lines("out/models");
    assert_eq!(resumed_model.len(), 1);
    assert_ne!(resumed_model, first_model);
    assert_eq!(harness.api.creates(ResourceKind::Source).len(), 2);
}

#[test]
fn models_file_from_the_reused_output_dir_survives_a_fresh_run() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--output-dir", "out"])
        .expect("first run");
    let first_model = harness.lines("out/models");

    harness
        .run(&["--models", "out/models", "--test", "iris.csv", "--output-dir", "out"])
        .expect("second run");

    assert_eq!(harness.lines("out/models"), first_model);
    assert_eq!(harness.api.creates(ResourceKind::Model).len(), 1);
    let batches = harness.api.creates(ResourceKind::BatchPrediction);
    assert_eq!(batches.len(), 1);
    assert!(matches!(
        &batches[0].origin,
        Origin::Pair(model, _) if model.to_string() == first_model[0]
    ));
}

#[test]
fn clear_logs_truncates_the_session_log_of_a_reused_output_dir() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--output-dir", "same"])
        .expect("first run");
    assert!(harness.lines("same/bigmler_sessions").len() > 1);

    harness
        .run(&["--train", "iris.csv", "--output-dir", "same", "--clear-logs"])
        .expect("cleared run");

    let session = harness.lines("same/bigmler_sessions");
    assert_eq!(
        session.first().map(String::as_str),
        Some("bigmler --train iris.csv --output-dir same --clear-logs")
    );
    assert_eq!(
        session.iter().filter(|line| line.as_str() == SEPARATOR).count(),
        1
    );
    assert_eq!(session.last().map(String::as_str), Some(SEPARATOR));
}

#[test]
fn consecutive_resumes_resolve_the_same_output_dir() {
    let harness = Harness::new();
    harness.run(&["--train", "iris.csv"]).expect("run");
    harness.run(&["--resume"]).expect("first resume");
    harness.run(&["--resume"]).expect("second resume");

    assert_eq!(harness.lines(".bigmler_dir_stack").len(), 1);
    let session = harness.lines(&format!("{DEFAULT_DIR}/bigmler_sessions"));
    let resumes = session
        .iter()
        .filter(|line| line.contains("Resuming: bigmler --train iris.csv"))
        .count();
    assert_eq!(resumes, 2);
    assert_eq!(
        session.iter().filter(|line| line.as_str() == SEPARATOR).count(),
        3
    );
}

#[test]
fn resume_drops_debug_unless_passed_again() {
    let harness = Harness::new();
    harness
        .run(&["--debug", "--train", "iris.csv", "--output-dir", "out"])
        .expect("run");
    harness.run(&["--resume"]).expect("resume");
    harness.run(&["--resume", "--debug"]).expect("debug resume");

    let session = harness.lines("out/bigmler_sessions");
    assert!(session
        .iter()
        .any(|line| line.ends_with("Resuming: bigmler --train iris.csv --output-dir out")));
    let debug_resume = "Resuming: bigmler --train iris.csv --output-dir out --debug";
    assert!(session.iter().any(|line| line.ends_with(debug_resume)));
}

#[test]
fn public_cluster_without_description_makes_no_remote_calls() {
    let harness = Harness::new();
    let outcome = harness.run(&["cluster", "--train", "iris.csv", "--public-cluster"]);

    assert!(matches!(
        outcome,
        Err(BigmlerError::Validation(ValidationError::MissingDescription))
    ));
    assert_eq!(harness.api.call_count(), 0);
    assert!(harness.connector.connections().is_empty());
    assert!(harness.lines(".bigmler_cluster").is_empty());
}

#[test]
fn resume_without_history_is_a_corrupt_log() {
    let harness = Harness::new();
    assert!(matches!(
        harness.run(&["--resume"]),
        Err(BigmlerError::CorruptLog(_))
    ));
    assert_eq!(harness.api.call_count(), 0);
}

#[test]
fn evaluation_writes_result_files() {
    let harness = Harness::new();
    harness.api.set_template(
        ResourceKind::Evaluation,
        json!({"result": {"model": {"accuracy": 0.9}}}),
    );
    harness
        .run(&["--train", "iris.csv", "--evaluate", "--output-dir", "eval"])
        .expect("run");

    assert_eq!(harness.api.creates(ResourceKind::Evaluation).len(), 1);
    assert_eq!(
        std::fs::read_to_string(harness.path("eval/evaluation.txt")).expect("txt"),
        "model.accuracy: 0.9\n"
    );
    assert!(harness.path("eval/evaluation.json").exists());
    assert_eq!(harness.lines("eval/evaluations").len(), 1);
}

#[test]
fn test_data_runs_a_batch_prediction() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--test", "iris.csv", "--output-dir", "pred"])
        .expect("run");

    let batches = harness.api.creates(ResourceKind::BatchPrediction);
    assert_eq!(batches.len(), 1);
    let model = harness.lines("pred/models");
    let test_dataset = harness.lines("pred/test_dataset");
    assert_eq!(
        batches[0].origin,
        Origin::Pair(
            ResourceId::parse(&model[0]).expect("model"),
            ResourceId::parse(&test_dataset[0]).expect("test dataset"),
        )
    );
    assert!(harness.path("pred/predictions.csv").exists());
}

#[test]
fn cluster_run_builds_centroid_datasets_in_its_own_logs() {
    let harness = Harness::new();
    harness.api.set_template(
        ResourceKind::Cluster,
        json!({"clusters": {"clusters": [
            {"id": "000000", "name": "Cluster 0"},
            {"id": "000001", "name": "Cluster 1"}
        ]}}),
    );
    harness
        .run(&[
            "cluster",
            "--train",
            "iris.csv",
            "--k",
            "2",
            "--cluster-datasets",
            "--output-dir",
            "clusters",
        ])
        .expect("run");

    assert_eq!(harness.api.creates(ResourceKind::Cluster).len(), 1);
    assert_eq!(harness.api.creates(ResourceKind::Dataset).len(), 3);
    assert_eq!(harness.lines("clusters/cluster_datasets").len(), 2);
    assert_eq!(harness.lines(".bigmler_cluster").len(), 1);
    assert!(harness.lines(".bigmler").is_empty());
}

#[test]
fn reports_summarize_created_resources() {
    let harness = Harness::new();
    harness
        .run(&["--train", "iris.csv", "--reports", "--output-dir", "rep"])
        .expect("run");

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(harness.path("rep/reports/summary.json")).expect("summary"),
    )
    .expect("json");
    assert_eq!(summary["resources"]["source"].as_array().map(Vec::len), Some(1));
    assert_eq!(summary["resources"]["model"].as_array().map(Vec::len), Some(1));
    assert!(summary["run_id"].as_str().is_some_and(|id| id.starts_with("r-")));
}
