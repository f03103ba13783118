//! `bigmler cluster`: source, dataset, clusters, test data, centroids,
//! per-centroid datasets, report.

use crate::api::{parse_resource, CreateRequest, Origin};
use crate::checkpoint::Checkpoint;
use crate::cli::ClusterCli;
use crate::dispatcher::{
    base_args, dataset_origin, numbered_output, publish_changes, with_args, Pipeline,
    TrainingData,
};
use crate::errors::BigmlerError;
use crate::stage::PipelineCursor;
use crate::types::{Resource, ResourceId, ResourceKind, ResourceRef, Stage};
use serde_json::{json, Value};

/// A centroid of a finished cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Centroid {
    pub id: String,
    pub name: String,
    /// Dataset already generated for this centroid, if the cluster reports one.
    pub dataset: Option<ResourceId>,
}

pub fn centroids(cluster: &Resource) -> Vec<Centroid> {
    let generated = cluster.object.get("cluster_datasets");
    cluster
        .object
        .pointer("/clusters/clusters")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    let name = item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(&id)
                        .to_string();
                    let dataset = generated
                        .and_then(|map| map.get(&id))
                        .and_then(Value::as_str)
                        .filter(|value| !value.is_empty())
                        .and_then(|value| {
                            ResourceId::parse_kind(value, ResourceKind::Dataset).ok()
                        });
                    Some(Centroid { id, name, dataset })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn run_cluster(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &ClusterCli,
) -> Result<(), BigmlerError> {
    let common = &cli.common;
    let needs_source = common.dataset.is_none() && common.datasets.is_none() && !cli.has_clusters();
    let source = if needs_source {
        cursor.run(Stage::Source, |cursor| pipeline.source_stage(cursor, common))?
    } else {
        None
    };

    let training = if source.is_some() || common.dataset.is_some() || common.datasets.is_some() {
        cursor.run(Stage::Dataset, |cursor| {
            pipeline.dataset_stage(cursor, common, source.as_ref(), None)
        })?
    } else {
        TrainingData::default()
    };

    let clusters = cursor.run(Stage::Model, |cursor| {
        cluster_stage(pipeline, cursor, cli, &training)
    })?;

    let has_test = common.has_test() || training.split_test.is_some();
    let test_datasets = if has_test {
        cursor.run(Stage::TestData, |cursor| {
            pipeline.test_data_stage(cursor, common, &training)
        })?
    } else {
        Vec::new()
    };

    let wanted = cli.cluster_dataset_names();
    if !test_datasets.is_empty() || wanted.is_some() {
        cursor.run(Stage::Action, |cursor| {
            let primary = clusters.first().ok_or_else(|| {
                BigmlerError::InvalidConfig("no cluster available".to_string())
            })?;
            if !test_datasets.is_empty() {
                batch_centroids(pipeline, cursor, cli, primary, &test_datasets)?;
            }
            if let Some(names) = &wanted {
                cluster_datasets(pipeline, cursor, primary, names)?;
            }
            Ok(())
        })?;
    }

    cursor.run(Stage::Report, |_| pipeline.report_stage(common))
}

fn cluster_stage(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &ClusterCli,
    training: &TrainingData,
) -> Result<Vec<Resource>, BigmlerError> {
    let common = &cli.common;
    let mut references = Vec::<ResourceRef>::new();
    if let Some(path) = &cli.cluster_file {
        let path = pipeline.resolve_path(path);
        let raw = pipeline.env().fs.read_to_string(&path)?;
        let body = serde_json::from_str::<Value>(&raw).map_err(|e| {
            BigmlerError::InvalidConfig(format!("{} is not a cluster: {e}", path.display()))
        })?;
        references.push(parse_resource(body)?.into());
    }
    if let Some(id) = &cli.cluster {
        references.push(ResourceId::parse_kind(id, ResourceKind::Cluster)?.into());
    }
    if let Some(path) = &cli.clusters {
        for id in pipeline.read_ids(path, ResourceKind::Cluster)? {
            references.push(id.into());
        }
    }
    if !references.is_empty() {
        return references
            .iter()
            .map(|reference| pipeline.fetch(Stage::Model, reference))
            .collect();
    }
    if training.datasets.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = base_args(common);
    if let Some(k) = cli.k {
        args.insert("k".to_string(), json!(k));
    }
    if let Some(seed) = &common.seed {
        args.insert("seed".to_string(), json!(seed));
    }
    let request = CreateRequest::new(
        ResourceKind::Cluster,
        dataset_origin(&training.datasets),
        Value::Object(args),
    );
    let cluster = pipeline.obtain_one(cursor, Stage::Model, Checkpoint::Clusters, request)?;
    if let Some(changes) = publish_changes(common, cli.public_cluster, false) {
        pipeline.update(&cluster, changes)?;
        pipeline.step("Cluster sharing settings updated.")?;
    }
    Ok(vec![cluster])
}

fn batch_centroids(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cli: &ClusterCli,
    cluster: &Resource,
    test_datasets: &[Resource],
) -> Result<(), BigmlerError> {
    let requests = test_datasets
        .iter()
        .map(|dataset| {
            CreateRequest::new(
                ResourceKind::BatchCentroid,
                Origin::Pair(cluster.id.clone(), dataset.id.clone()),
                with_args(&cli.common, json!({"header": true, "distance": true})),
            )
        })
        .collect();
    let batches = pipeline.obtain_many(cursor, Stage::Action, Checkpoint::BatchCentroid, requests)?;
    let centroids_path = pipeline.env().paths.predictions.clone();
    for (index, batch) in batches.iter().enumerate() {
        pipeline.download_to(&batch.id, &numbered_output(&centroids_path, index))?;
    }
    Ok(())
}

/// One dataset per selected centroid; an empty selection means all of them.
/// Centroids whose dataset the cluster already lists are fetched, not rebuilt.
fn cluster_datasets(
    pipeline: &mut Pipeline<'_>,
    cursor: &mut PipelineCursor,
    cluster: &Resource,
    names: &[String],
) -> Result<Vec<Resource>, BigmlerError> {
    let selected = centroids(cluster)
        .into_iter()
        .filter(|centroid| names.is_empty() || names.iter().any(|name| name == &centroid.name))
        .collect::<Vec<_>>();
    if selected.is_empty() {
        pipeline.step("No centroid matches the requested cluster datasets.")?;
        return Ok(Vec::new());
    }

    let mut datasets = Vec::new();
    for existing in selected.iter().filter_map(|centroid| centroid.dataset.as_ref()) {
        datasets.push(pipeline.fetch(Stage::Action, &existing.clone().into())?);
    }
    let requests = selected
        .iter()
        .filter(|centroid| centroid.dataset.is_none())
        .map(|centroid| {
            CreateRequest::new(
                ResourceKind::Dataset,
                Origin::Resource(cluster.id.clone()),
                json!({"centroid": centroid.id, "name": format!("Dataset from {}", centroid.name)}),
            )
        })
        .collect::<Vec<_>>();
    if !requests.is_empty() {
        datasets.extend(pipeline.obtain_many(
            cursor,
            Stage::Action,
            Checkpoint::ClusterDatasets,
            requests,
        )?);
    }
    Ok(datasets)
}
