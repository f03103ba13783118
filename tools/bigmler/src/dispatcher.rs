//! Main pipeline: source, dataset, models, test data, one action, report.
//!
//! Every stage runs through [`PipelineCursor::run`]. Resources the run
//! creates go to their checkpoint file before being waited on, so a
//! `--resume` finds them and fetches instead of creating again.

use crate::api::{check_resource, resolve, CreateRequest, Origin, ResourceApi, WaitPolicy};
use crate::checkpoint::{Checkpoint, Checkpoints};
use crate::cli::{CommonArgs, MainCli};
use crate::config::{absolutize_path, ApiSettings};
use crate::errors::{BigmlerError, ValidationError};
use crate::evaluation;
use crate::logging::append_run_log;
use crate::reports::{self, RunSummary};
use crate::runtime::{Clock, FileSystem};
use crate::session_log::SessionLog;
use crate::stage::PipelineCursor;
use crate::types::{Resource, ResourceId, ResourceKind, ResourceRef, Stage};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Label given to the dataset that gathers the categories beyond `--max-categories`.
pub const OTHER_LABEL: &str = "*****other*****";
const DEFAULT_SEED: &str = "BigMLer";

/// Where a run reads inputs from and writes its outputs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub cwd: PathBuf,
    pub output_dir: PathBuf,
    pub predictions: PathBuf,
}

impl RunPaths {
    /// `--output-dir` wins; otherwise a `--predictions` path with a directory
    /// part names the directory; otherwise `fallback_dir` is used. A bare
    /// predictions file name always lands inside the output directory.
    pub fn resolve(
        cwd: &Path,
        output_dir: Option<&Path>,
        predictions: Option<&Path>,
        default_name: &str,
        fallback_dir: &Path,
    ) -> Self {
        let file_name = predictions
            .and_then(Path::file_name)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(default_name));
        if let Some(dir) = output_dir {
            let dir = absolutize_path(cwd, dir);
            return Self {
                cwd: cwd.to_path_buf(),
                predictions: dir.join(file_name),
                output_dir: dir,
            };
        }
        if let Some(path) = predictions {
            let has_dir = path
                .parent()
                .is_some_and(|parent| !parent.as_os_str().is_empty());
            if has_dir {
                let predictions = absolutize_path(cwd, path);
                let output_dir = predictions
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| cwd.to_path_buf());
                return Self {
                    cwd: cwd.to_path_buf(),
                    output_dir,
                    predictions,
                };
            }
        }
        let dir = absolutize_path(cwd, fallback_dir);
        Self {
            cwd: cwd.to_path_buf(),
            predictions: dir.join(file_name),
            output_dir: dir,
        }
    }
}

/// Collaborators and run facts shared by every stage.
#[derive(Clone, Copy)]
pub struct RunEnv<'a> {
    pub api: &'a dyn ResourceApi,
    pub clock: &'a dyn Clock,
    pub fs: &'a dyn FileSystem,
    pub session: &'a SessionLog<'a>,
    pub settings: &'a ApiSettings,
    pub paths: &'a RunPaths,
    pub run_id: Option<&'a str>,
    pub command: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingData {
    pub datasets: Vec<Resource>,
    /// Held-out half of a `--test-split`.
    pub split_test: Option<Resource>,
    /// Model metadata for `--max-categories` runs.
    pub category_metadata: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Predictor {
    pub ensemble: Option<Resource>,
    pub models: Vec<Resource>,
}

impl Predictor {
    /// The ensemble if there is one, else the first model.
    pub fn primary(&self) -> Option<&Resource> {
        self.ensemble.as_ref().or_else(|| self.models.first())
    }
}

pub struct Pipeline<'a> {
    env: RunEnv<'a>,
    policy: WaitPolicy,
    checkpoints: Checkpoints<'a>,
    produced: BTreeMap<String, Vec<String>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(env: RunEnv<'a>) -> Self {
        Self {
            policy: WaitPolicy::new(env.settings.poll_interval_ms, env.settings.max_polls),
            checkpoints: Checkpoints::new(env.fs, &env.paths.output_dir),
            produced: BTreeMap::new(),
            env,
        }
    }

    pub fn env(&self) -> RunEnv<'a> {
        self.env
    }

    /// Resource ids touched so far, by stage name.
    pub fn produced(&self) -> &BTreeMap<String, Vec<String>> {
        &self.produced
    }

    pub fn step(&self, message: &str) -> Result<(), BigmlerError> {
        self.env.session.step(message)
    }

    fn note(&mut self, stage: Stage, id: &ResourceId) {
        let ids = self.produced.entry(stage.as_str().to_string()).or_default();
        if !ids.iter().any(|known| known == &id.to_string()) {
            ids.push(id.to_string());
        }
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        absolutize_path(&self.env.paths.cwd, path)
    }

    /// Waits on a resource named by the user.
    pub fn fetch(
        &mut self,
        stage: Stage,
        reference: &ResourceRef,
    ) -> Result<Resource, BigmlerError> {
        if reference.resolved().is_none() {
            self.step(&format!("Retrieving {}.", reference.id()))?;
        }
        let resource = resolve(
            self.env.api,
            self.env.clock,
            self.policy,
            reference,
            None,
        )?;
        self.note(stage, &resource.id);
        Ok(resource)
    }

    fn wait(&mut self, stage: Stage, id: &ResourceId) -> Result<Resource, BigmlerError> {
        let resource = check_resource(self.env.api, self.env.clock, self.policy, id, None)?;
        self.note(stage, &resource.id);
        Ok(resource)
    }

    fn create(
        &mut self,
        stage: Stage,
        checkpoint: Checkpoint,
        request: &CreateRequest,
    ) -> Result<ResourceId, BigmlerError> {
        self.step(&format!("Creating {}.", request.kind.as_str()))?;
        let created = self.env.api.create(request)?;
        self.checkpoints.append(checkpoint, &created.id)?;
        append_run_log(
            "info",
            "resource.created",
            json!({"stage": stage.as_str(), "resource": created.id.to_string()}),
        );
        self.step(&format!("{} created: {}", request.kind.as_str(), created.id))?;
        Ok(created.id)
    }

    /// Reuses the checkpointed resource under resume, or creates it.
    pub fn obtain_one(
        &mut self,
        cursor: &mut PipelineCursor,
        stage: Stage,
        checkpoint: Checkpoint,
        request: CreateRequest,
    ) -> Result<Resource, BigmlerError> {
        if cursor.resuming() {
            if let Some(id) = self.checkpoints.first(checkpoint)? {
                self.step(&format!("Reusing {id}."))?;
                return self.wait(stage, &id);
            }
            cursor.checkpoint_missing();
        }
        let id = self.create(stage, checkpoint, &request)?;
        self.wait(stage, &id)
    }

    /// Batch form of [`Self::obtain_one`]: only the requests beyond the
    /// checkpointed ids are sent.
    pub fn obtain_many(
        &mut self,
        cursor: &mut PipelineCursor,
        stage: Stage,
        checkpoint: Checkpoint,
        requests: Vec<CreateRequest>,
    ) -> Result<Vec<Resource>, BigmlerError> {
        let mut ids = Vec::with_capacity(requests.len());
        if cursor.resuming() {
            ids = self.checkpoints.read(checkpoint)?;
            ids.truncate(requests.len());
            for id in &ids {
                self.step(&format!("Reusing {id}."))?;
            }
            if ids.len() < requests.len() {
                cursor.checkpoint_missing();
            }
        }
        for request in requests.iter().skip(ids.len()) {
            let id = self.create(stage, checkpoint, request)?;
            ids.push(id);
        }
        ids.iter().map(|id| self.wait(stage, id)).collect()
    }

    pub fn update(&self, resource: &Resource, changes: Value) -> Result<Resource, BigmlerError> {
        append_run_log(
            "debug",
            "resource.update",
            json!({"resource": resource.id.to_string(), "changes": changes}),
        );
        self.env.api.update(&resource.id, &changes)
    }

    /// Reads a file of ids, one per line.
    pub fn read_ids(
        &self,
        path: &Path,
        kind: ResourceKind,
    ) -> Result<Vec<ResourceId>, BigmlerError> {
        self.env
            .fs
            .read_to_string(&self.resolve_path(path))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| ResourceId::parse_kind(line, kind))
            .collect()
    }

    pub fn read_json(&self, path: &Path) -> Result<Value, BigmlerError> {
        let path = self.resolve_path(path);
        let raw = self.env.fs.read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            BigmlerError::Validation(ValidationError::InvalidValue(format!(
                "{} is not valid JSON: {e}",
                path.display()
            )))
        })
    }

    pub fn download_to(&self, id: &ResourceId, path: &Path) -> Result<(), BigmlerError> {
        let body = self.env.api.download(id)?;
        self.env.fs.write_string(path, &body)?;
        self.step(&format!("Saved {id} to {}.", path.display()))
    }

    /// Uploads the training file or fetches `--source`.
    pub fn source_stage(
        &mut self,
        cursor: &mut PipelineCursor,
        common: &CommonArgs,
    ) -> Result<Option<Resource>, BigmlerError> {
        if let Some(id) = &common.source {
            let id = ResourceId::parse_kind(id, ResourceKind::Source)?;
            return self.fetch(Stage::Source, &id.into()).map(Some);
        }
        let Some(path) = &common.training_set else {
            return Ok(None);
        };
        let request = CreateRequest::new(
            ResourceKind::Source,
            Origin::LocalFile(self.resolve_path(path)),
            Value::Object(base_args(common)),
        );
        self.obtain_one(cursor, Stage::Source, Checkpoint::Source, request)
            .map(Some)
    }

    /// Builds or fetches the training datasets and applies the dataset
    /// sub-stages in order: new fields, merge, publish, export, split,
    /// category limit.
    pub fn dataset_stage(
        &mut self,
        cursor: &mut PipelineCursor,
        common: &CommonArgs,
        source: Option<&Resource>,
        category_limit: Option<(&str, u32)>,
    ) -> Result<TrainingData, BigmlerError> {
        let mut datasets = Vec::new();
        if let Some(id) = &common.dataset {
            let id = ResourceId::parse_kind(id, ResourceKind::Dataset)?;
            datasets.push(self.fetch(Stage::Dataset, &id.into())?);
        }
        if let Some(path) = &common.datasets {
            for id in self.read_ids(path, ResourceKind::Dataset)? {
                datasets.push(self.fetch(Stage::Dataset, &id.into())?);
            }
        }
        if datasets.is_empty() {
            if let Some(source) = source {
                let request = CreateRequest::new(
                    ResourceKind::Dataset,
                    Origin::Resource(source.id.clone()),
                    Value::Object(base_args(common)),
                );
                let dataset =
                    self.obtain_one(cursor, Stage::Dataset, Checkpoint::Dataset, request)?;
                datasets.push(dataset);
            }
        }
        let Some(first) = datasets.first().cloned() else {
            return Ok(TrainingData::default());
        };

        if let Some(path) = &common.new_fields {
            let fields = self.read_json(path)?;
            let request = CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resource(first.id.clone()),
                with_args(common, json!({"new_fields": fields})),
            );
            let generated =
                self.obtain_one(cursor, Stage::Dataset, Checkpoint::DatasetGen, request)?;
            datasets = vec![generated];
        }

        if common.multi_dataset && datasets.len() > 1 {
            let ids = datasets.iter().map(|d| d.id.clone()).collect();
            let request = CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resources(ids),
                Value::Object(base_args(common)),
            );
            let merged =
                self.obtain_one(cursor, Stage::Dataset, Checkpoint::DatasetMulti, request)?;
            datasets = vec![merged];
        }

        if let Some(changes) = publish_changes(common, common.public_dataset, false) {
            for dataset in &datasets {
                self.update(dataset, changes.clone())?;
            }
            self.step("Dataset sharing settings updated.")?;
        }

        let mut training = TrainingData {
            datasets,
            ..TrainingData::default()
        };
        let Some(primary) = training.datasets.first().cloned() else {
            return Ok(training);
        };

        if let Some(name) = &common.to_csv {
            let target = self.env.paths.output_dir.join(name);
            self.download_to(&primary.id, &target)?;
        }

        if common.test_split > 0.0 {
            let seed = common.seed.clone().unwrap_or_else(|| DEFAULT_SEED.to_string());
            let rate = 1.0 - common.test_split;
            let train = CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resource(primary.id.clone()),
                with_args(
                    common,
                    json!({"sample_rate": rate, "seed": seed, "out_of_bag": false}),
                ),
            );
            let test = CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resource(primary.id.clone()),
                with_args(
                    common,
                    json!({"sample_rate": rate, "seed": seed, "out_of_bag": true}),
                ),
            );
            let train = self.obtain_one(cursor, Stage::Dataset, Checkpoint::DatasetTrain, train)?;
            let test = self.obtain_one(cursor, Stage::Dataset, Checkpoint::DatasetTest, test)?;
            training.datasets = vec![train];
            training.split_test = Some(test);
        }

        if let (Some((objective, limit)), Some(base)) =
            (category_limit, training.datasets.first().cloned())
        {
            let (field_id, categories) = objective_categories(&base, objective)?;
            let filters = category_filters(&field_id, &categories, limit as usize);
            let requests = filters
                .iter()
                .map(|(label, filter)| {
                    CreateRequest::new(
                        ResourceKind::Dataset,
                        Origin::Resource(base.id.clone()),
                        with_args(
                            common,
                            json!({
                                "name": format!("{} - {label}", common.name),
                                "lisp_filter": filter,
                            }),
                        ),
                    )
                })
                .collect();
            training.datasets =
                self.obtain_many(cursor, Stage::Dataset, Checkpoint::CategoryDatasets, requests)?;
            training.category_metadata = Some(json!({
                "max_categories": limit,
                "other_label": OTHER_LABEL,
                "objective_field": field_id,
            }));
        }
        Ok(training)
    }

    /// Test datasets, from a split, explicit ids, or a test source.
    pub fn test_data_stage(
        &mut self,
        cursor: &mut PipelineCursor,
        common: &CommonArgs,
        training: &TrainingData,
    ) -> Result<Vec<Resource>, BigmlerError> {
        if let Some(test) = &training.split_test {
            return Ok(vec![test.clone()]);
        }
        let mut datasets = Vec::new();
        if let Some(id) = &common.test_dataset {
            let id = ResourceId::parse_kind(id, ResourceKind::Dataset)?;
            datasets.push(self.fetch(Stage::TestData, &id.into())?);
        }
        if let Some(path) = &common.test_datasets {
            for id in self.read_ids(path, ResourceKind::Dataset)? {
                datasets.push(self.fetch(Stage::TestData, &id.into())?);
            }
        }
        if !datasets.is_empty() {
            return Ok(datasets);
        }

        let source = if let Some(id) = &common.test_source {
            let id = ResourceId::parse_kind(id, ResourceKind::Source)?;
            Some(self.fetch(Stage::TestData, &id.into())?)
        } else if let Some(path) = &common.test_set {
            let request = CreateRequest::new(
                ResourceKind::Source,
                Origin::LocalFile(self.resolve_path(path)),
                with_args(common, json!({"name": format!("{} - test", common.name)})),
            );
            Some(self.obtain_one(cursor, Stage::TestData, Checkpoint::TestSource, request)?)
        } else {
            None
        };
        if let Some(source) = source {
            let request = CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resource(source.id.clone()),
                with_args(common, json!({"name": format!("{} - test", common.name)})),
            );
            let dataset =
                self.obtain_one(cursor, Stage::TestData, Checkpoint::TestDataset, request)?;
            datasets.push(dataset);
        }
        Ok(datasets)
    }

    /// Lists outputs into the session log, then writes and uploads the
    /// summary when asked to.
    pub fn report_stage(&mut self, common: &CommonArgs) -> Result<(), BigmlerError> {
        let env = self.env;
        let files = reports::print_generated_files(env.fs, env.session, &env.paths.output_dir)?;
        if !common.reports && !common.upload {
            return Ok(());
        }
        let summary = RunSummary {
            run_id: env.run_id.map(str::to_string),
            command: env.command.to_string(),
            output_dir: env.paths.output_dir.display().to_string(),
            resources: self.produced.clone(),
            generated_files: files,
        };
        let path = reports::write_summary(env.fs, &env.paths.output_dir, &summary)?;
        self.step(&format!("Report written to {}.", path.display()))?;
        if common.upload {
            let location = reports::upload_summary(env.api, env.settings, &summary)?;
            self.step(&format!("Report uploaded to {location}."))?;
        }
        Ok(())
    }
}

pub fn base_args(common: &CommonArgs) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("name".to_string(), json!(common.name));
    if !common.tags.is_empty() {
        args.insert("tags".to_string(), json!(common.tags));
    }
    if let Some(description) = common.description_text() {
        args.insert("description".to_string(), json!(description));
    }
    args
}

pub fn with_args(common: &CommonArgs, extra: Value) -> Value {
    let mut args = base_args(common);
    if let Value::Object(extra) = extra {
        args.extend(extra);
    }
    Value::Object(args)
}

/// Update body for publishing and sharing flags, if any applies.
pub fn publish_changes(common: &CommonArgs, public: bool, white_box: bool) -> Option<Value> {
    let mut changes = Map::new();
    if public || white_box {
        changes.insert("private".to_string(), json!(false));
        if let Some(description) = common.description_text() {
            changes.insert("description".to_string(), json!(description));
        }
    }
    if white_box {
        changes.insert("white_box".to_string(), json!(true));
    }
    if let Some(shared) = common.shared_flag() {
        changes.insert("shared".to_string(), json!(shared));
    }
    (!changes.is_empty()).then_some(Value::Object(changes))
}

/// Training origin for one or many datasets.
pub fn dataset_origin(datasets: &[Resource]) -> Origin {
    match datasets {
        [single] => Origin::Resource(single.id.clone()),
        many => Origin::Resources(many.iter().map(|d| d.id.clone()).collect()),
    }
}

/// Field id and `(category, count)` pairs, most frequent first.
fn objective_categories(
    dataset: &Resource,
    objective: &str,
) -> Result<(String, Vec<(String, u64)>), BigmlerError> {
    let invalid =
        |message: String| BigmlerError::Validation(ValidationError::InvalidValue(message));
    let fields = dataset
        .object
        .get("fields")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(format!("{} has no field descriptions", dataset.id)))?;
    let (field_id, field) = fields
        .iter()
        .find(|(id, field)| {
            id.as_str() == objective
                || field.get("name").and_then(Value::as_str) == Some(objective)
                || field
                    .get("column_number")
                    .and_then(Value::as_u64)
                    .is_some_and(|column| column.to_string() == objective)
        })
        .ok_or_else(|| {
            invalid(format!("objective field {objective} not found in {}", dataset.id))
        })?;
    let mut categories = field
        .pointer("/summary/categories")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(format!("objective field {objective} is not categorical")))?
        .iter()
        .filter_map(|pair| {
            let name = pair.get(0)?.as_str()?.to_string();
            let count = pair.get(1)?.as_u64()?;
            Some((name, count))
        })
        .collect::<Vec<_>>();
    categories.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok((field_id.clone(), categories))
}

/// One `(label, lisp_filter)` per kept category, plus an "other" bucket
/// when there are more categories than `limit`.
fn category_filters(
    field_id: &str,
    categories: &[(String, u64)],
    limit: usize,
) -> Vec<(String, String)> {
    // The "other" bucket is only well formed next to at least one kept category.
    let limit = limit.max(2);
    let equals = |category: &str| format!("(= (f {}) {})", json!(field_id), json!(category));
    if categories.len() <= limit {
        return categories
            .iter()
            .map(|(name, _)| (name.clone(), equals(name)))
            .collect();
    }
    let kept = &categories[..limit.saturating_sub(1)];
    let mut filters = kept
        .iter()
        .map(|(name, _)| (name.clone(), equals(name)))
        .collect::<Vec<_>>();
    let any_kept = kept
        .iter()
        .map(|(name, _)| equals(name))
        .collect::<Vec<_>>()
        .join(" ");
    filters.push((OTHER_LABEL.to_string(), format!("(not (or {any_kept}))")));
    filters
}

/// `predictions.csv`, `predictions_1.csv`, ... for several outputs.
pub fn numbered_output(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Predict,
    Evaluate,
    CrossValidate,
}

fn choose_action(cli: &MainCli, has_test: bool) -> Action {
    if cli.cross_validation_rate > 0.0 {
        Action::CrossValidate
    } else if cli.evaluate {
        Action::Evaluate
    } else if has_test {
        Action::Predict
    } else {
        Action::None
    }
}

/// Runs the model pipeline end to end.
pub fn run_main(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &MainCli,
) -> Result<(), BigmlerError> {
    let common = &cli.common;
    let needs_source = common.dataset.is_none() && common.datasets.is_none() && !cli.has_models();
    let source = if needs_source {
        cursor.run(Stage::Source, |cursor| pipeline.source_stage(cursor, common))?
    } else {
        None
    };

    let category_limit = match (&common.objective, cli.max_categories) {
        (Some(objective), limit) if limit > 0 => Some((objective.as_str(), limit)),
        _ => None,
    };
    let training = if source.is_some() || common.dataset.is_some() || common.datasets.is_some() {
        cursor.run(Stage::Dataset, |cursor| {
            pipeline.dataset_stage(cursor, common, source.as_ref(), category_limit)
        })?
    } else {
        TrainingData::default()
    };

    let cross_validating = cli.cross_validation_rate > 0.0;
    let predictor = if !cross_validating || cli.has_models() {
        cursor.run(Stage::Model, |cursor| model_stage(pipeline, cursor, cli, &training))?
    } else {
        Predictor::default()
    };

    let has_test = common.has_test() || training.split_test.is_some();
    let action = choose_action(cli, has_test);
    let test_datasets = if matches!(action, Action::Predict | Action::Evaluate) && has_test {
        cursor.run(Stage::TestData, |cursor| {
            pipeline.test_data_stage(cursor, common, &training)
        })?
    } else {
        Vec::new()
    };

    if action != Action::None {
        cursor.run(Stage::Action, |cursor| match action {
            Action::Predict => predict(pipeline, cursor, common, &predictor, &test_datasets),
            Action::Evaluate => {
                evaluate(pipeline, cursor, common, &predictor, &training, &test_datasets)
            }
            Action::CrossValidate => cross_validate(pipeline, cursor, cli, &training),
            Action::None => Ok(()),
        })?;
    }

    cursor.run(Stage::Report, |_| pipeline.report_stage(common))
}

fn model_stage(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &MainCli,
    training: &TrainingData,
) -> Result<Predictor, BigmlerError> {
    let common = &cli.common;
    if let Some(id) = &cli.ensemble {
        let id = ResourceId::parse_kind(id, ResourceKind::Ensemble)?;
        let ensemble = pipeline.fetch(Stage::Model, &id.into())?;
        return Ok(Predictor {
            ensemble: Some(ensemble),
            models: Vec::new(),
        });
    }

    let mut models = Vec::new();
    if let Some(id) = &cli.model {
        let id = ResourceId::parse_kind(id, ResourceKind::Model)?;
        models.push(pipeline.fetch(Stage::Model, &id.into())?);
    }
    if let Some(path) = &cli.models {
        for id in pipeline.read_ids(path, ResourceKind::Model)? {
            models.push(pipeline.fetch(Stage::Model, &id.into())?);
        }
    }
    if !models.is_empty() {
        return Ok(Predictor {
            ensemble: None,
            models,
        });
    }
    if training.datasets.is_empty() {
        return Ok(Predictor::default());
    }

    let mut args = base_args(common);
    if let Some(objective) = &common.objective {
        args.insert("objective_field".to_string(), json!(objective));
    }
    if let Some(rate) = common.sample_rate {
        args.insert("sample_rate".to_string(), json!(rate));
    }

    let mut predictor = Predictor::default();
    if cli.ensembles {
        args.insert("number_of_models".to_string(), json!(cli.number_of_models));
        if let Some(seed) = &common.seed {
            args.insert("seed".to_string(), json!(seed));
        }
        let request = CreateRequest::new(
            ResourceKind::Ensemble,
            dataset_origin(&training.datasets),
            Value::Object(args),
        );
        predictor.ensemble =
            Some(pipeline.obtain_one(cursor, Stage::Model, Checkpoint::Ensembles, request)?);
    } else {
        let requests = match &training.category_metadata {
            Some(metadata) => training
                .datasets
                .iter()
                .map(|dataset| {
                    let mut args = args.clone();
                    args.insert("user_metadata".to_string(), metadata.clone());
                    if let Some(field) = metadata.get("objective_field") {
                        args.insert("objective_field".to_string(), field.clone());
                    }
                    CreateRequest::new(
                        ResourceKind::Model,
                        Origin::Resource(dataset.id.clone()),
                        Value::Object(args),
                    )
                })
                .collect::<Vec<_>>(),
            None => (0..cli.number_of_models)
                .map(|index| {
                    let mut args = args.clone();
                    if let Some(seed) = &common.seed {
                        let seed = if cli.number_of_models > 1 {
                            format!("{seed} - {index}")
                        } else {
                            seed.clone()
                        };
                        args.insert("seed".to_string(), json!(seed));
                    }
                    CreateRequest::new(
                        ResourceKind::Model,
                        dataset_origin(&training.datasets),
                        Value::Object(args),
                    )
                })
                .collect::<Vec<_>>(),
        };
        predictor.models =
            pipeline.obtain_many(cursor, Stage::Model, Checkpoint::Models, requests)?;
    }

    if let Some(changes) = publish_changes(common, cli.black_box, cli.white_box) {
        for resource in predictor.ensemble.iter().chain(predictor.models.iter()) {
            pipeline.update(resource, changes.clone())?;
        }
        pipeline.step("Model sharing settings updated.")?;
    }
    if let Some(primary) = predictor.primary() {
        pipeline.step(&format!("Primary predictor: {}.", primary.id))?;
    }
    Ok(predictor)
}

fn predict(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    common: &CommonArgs,
    predictor: &Predictor,
    test_datasets: &[Resource],
) -> Result<(), BigmlerError> {
    let primary = predictor.primary().ok_or_else(|| {
        BigmlerError::InvalidConfig("no model or ensemble available to predict with".to_string())
    })?;
    let requests = test_datasets
        .iter()
        .map(|dataset| {
            CreateRequest::new(
                ResourceKind::BatchPrediction,
                Origin::Pair(primary.id.clone(), dataset.id.clone()),
                with_args(common, json!({"header": true, "confidence": true})),
            )
        })
        .collect();
    let batches =
        pipeline.obtain_many(cursor, Stage::Action, Checkpoint::BatchPrediction, requests)?;
    let predictions = pipeline.env.paths.predictions.clone();
    for (index, batch) in batches.iter().enumerate() {
        pipeline.download_to(&batch.id, &numbered_output(&predictions, index))?;
    }
    Ok(())
}

fn evaluate(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    common: &CommonArgs,
    predictor: &Predictor,
    training: &TrainingData,
    test_datasets: &[Resource],
) -> Result<(), BigmlerError> {
    let primary = predictor.primary().ok_or_else(|| {
        BigmlerError::InvalidConfig("no model or ensemble available to evaluate".to_string())
    })?;
    let dataset = test_datasets
        .first()
        .or_else(|| training.datasets.first())
        .ok_or_else(|| {
            BigmlerError::InvalidConfig("no dataset available to evaluate against".to_string())
        })?;
    let request = CreateRequest::new(
        ResourceKind::Evaluation,
        Origin::Pair(primary.id.clone(), dataset.id.clone()),
        Value::Object(base_args(common)),
    );
    let evaluation = pipeline.obtain_one(cursor, Stage::Action, Checkpoint::Evaluations, request)?;
    let env = pipeline.env();
    let files = evaluation::write_evaluation(env.fs, &env.paths.predictions, &evaluation)?;
    for file in files {
        pipeline.step(&format!("Evaluation saved to {}.", file.display()))?;
    }
    Ok(())
}

fn cross_validate(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &MainCli,
    training: &TrainingData,
) -> Result<(), BigmlerError> {
    let common = &cli.common;
    let dataset = training.datasets.first().ok_or_else(|| {
        BigmlerError::InvalidConfig("cross-validation needs a training dataset".to_string())
    })?;
    let rate = 1.0 - cli.cross_validation_rate;
    let seed = |index: u32| format!("{} - {index}", common.seed.as_deref().unwrap_or(DEFAULT_SEED));

    let model_requests = (0..cli.number_of_evaluations)
        .map(|index| {
            CreateRequest::new(
                ResourceKind::Model,
                Origin::Resource(dataset.id.clone()),
                with_args(
                    common,
                    json!({
                        "name": format!("{} - cross-validation {index}", common.name),
                        "sample_rate": rate,
                        "seed": seed(index),
                    }),
                ),
            )
        })
        .collect();
    let models = pipeline.obtain_many(
        cursor,
        Stage::Action,
        Checkpoint::CrossValidationModels,
        model_requests,
    )?;

    let evaluation_requests = models
        .iter()
        .zip(0_u32..)
        .map(|(model, index)| {
            CreateRequest::new(
                ResourceKind::Evaluation,
                Origin::Pair(model.id.clone(), dataset.id.clone()),
                with_args(
                    common,
                    json!({"sample_rate": rate, "seed": seed(index), "out_of_bag": true}),
                ),
            )
        })
        .collect();
    let evaluations = pipeline.obtain_many(
        cursor,
        Stage::Action,
        Checkpoint::CrossValidationEvaluations,
        evaluation_requests,
    )?;

    let env = pipeline.env();
    let files = evaluation::write_cross_validation(env.fs, &env.paths.output_dir, &evaluations)?;
    for file in files {
        pipeline.step(&format!("Cross-validation saved to {}.", file.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
        pairs.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    #[test]
    fn bare_predictions_name_goes_inside_output_dir() {
        let cwd = Path::new("/work");
        let paths = RunPaths::resolve(
            cwd,
            Some(Path::new("out")),
            Some(Path::new("preds.csv")),
            "predictions.csv",
            Path::new("unused"),
        );
        assert_eq!(paths.output_dir, PathBuf::from("/work/out"));
        assert_eq!(paths.predictions, PathBuf::from("/work/out/preds.csv"));

        let paths = RunPaths::resolve(
            cwd,
            None,
            Some(Path::new("preds.csv")),
            "predictions.csv",
            Path::new("MonOct1926_093000"),
        );
        assert_eq!(paths.predictions, PathBuf::from("/work/MonOct1926_093000/preds.csv"));
    }

    #[test]
    fn predictions_path_with_directory_names_the_output_dir() {
        let paths = RunPaths::resolve(
            Path::new("/work"),
            None,
            Some(Path::new("runs/a/out.csv")),
            "predictions.csv",
            Path::new("unused"),
        );
        assert_eq!(paths.output_dir, PathBuf::from("/work/runs/a"));
        assert_eq!(paths.predictions, PathBuf::from("/work/runs/a/out.csv"));
    }

    #[test]
    fn category_filters_keep_top_categories_and_other() {
        let filters = category_filters(
            "000004",
            &categories(&[("setosa", 50), ("versicolor", 40), ("virginica", 10)]),
            2,
        );
        assert_eq!(filters.len(), 2);
        let setosa = r#"(= (f "000004") "setosa")"#.to_string();
        assert_eq!(filters[0], ("setosa".to_string(), setosa));
        assert_eq!(filters[1].0, OTHER_LABEL);
        assert_eq!(filters[1].1, r#"(not (or (= (f "000004") "setosa")))"#);

        let all = category_filters("000004", &categories(&[("a", 2), ("b", 1)]), 5);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn a_limit_below_two_still_keeps_one_category() {
        let filters =
            category_filters("000004", &categories(&[("a", 3), ("b", 2), ("c", 1)]), 1);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].0, "a");
        assert_eq!(filters[1].1, r#"(not (or (= (f "000004") "a")))"#);
        assert!(filters.iter().all(|(_, filter)| !filter.contains("(or )")));
    }

    #[test]
    fn numbered_outputs_keep_the_extension() {
        let path = Path::new("/out/predictions.csv");
        assert_eq!(numbered_output(path, 0), PathBuf::from("/out/predictions.csv"));
        assert_eq!(numbered_output(path, 2), PathBuf::from("/out/predictions_2.csv"));
    }

    #[test]
    fn publish_changes_follow_flags() {
        let cli = crate::cli::parse_invocation(&[
            "bigmler".to_string(),
            "--description".to_string(),
            "iris".to_string(),
            "--shared".to_string(),
        ])
        .expect("parse");
        let changes = publish_changes(cli.common(), true, true).expect("changes");
        assert_eq!(
            changes,
            json!({"private": false, "description": "iris", "white_box": true, "shared": true})
        );
    }

    fn main_cli(flags: &[&str]) -> MainCli {
        let argv = std::iter::once("bigmler")
            .chain(flags.iter().copied())
            .map(str::to_string)
            .collect::<Vec<_>>();
        match crate::cli::parse_invocation(&argv).expect("parse") {
            crate::cli::Invocation::Main(cli) => *cli,
            crate::cli::Invocation::Cluster(_) => panic!("expected a main invocation"),
        }
    }

    #[test]
    fn combined_action_flags_resolve_by_priority() {
        let cli = main_cli(&["--evaluate", "--cross-validation-rate", "0.1", "--remote"]);
        assert_eq!(choose_action(&cli, true), Action::CrossValidate);

        let cli = main_cli(&["--remote", "--evaluate"]);
        assert_eq!(choose_action(&cli, true), Action::Evaluate);

        let cli = main_cli(&["--remote"]);
        assert_eq!(choose_action(&cli, true), Action::Predict);
        assert_eq!(choose_action(&cli, false), Action::None);
    }
}
