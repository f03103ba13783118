use crate::types::CommandMode;
use clap::{Args, Parser};
use std::path::{Path, PathBuf};

pub const CLUSTER_SUBCOMMAND: &str = "cluster";

/// Flags shared by the model and cluster pipelines.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Local training data file to upload.
    #[arg(long = "train")]
    pub training_set: Option<PathBuf>,
    /// Existing source id to build the dataset from.
    #[arg(long)]
    pub source: Option<String>,
    /// Existing dataset id.
    #[arg(long)]
    pub dataset: Option<String>,
    /// File listing dataset ids, one per line.
    #[arg(long)]
    pub datasets: Option<PathBuf>,
    /// Local test data file to upload.
    #[arg(long = "test")]
    pub test_set: Option<PathBuf>,
    #[arg(long)]
    pub test_source: Option<String>,
    #[arg(long)]
    pub test_dataset: Option<String>,
    /// File listing test dataset ids, one per line.
    #[arg(long)]
    pub test_datasets: Option<PathBuf>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Output file for predictions, centroids or evaluations.
    #[arg(long)]
    pub predictions: Option<PathBuf>,
    /// Replay the last logged command, reusing what it already created.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
    /// Empty the command and directory logs before running.
    #[arg(long, default_value_t = false)]
    pub clear_logs: bool,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value_t = 1)]
    pub verbosity: u8,
    /// JSONL file receiving structured run events.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long, default_value = "BigMLer")]
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    #[arg(long)]
    pub objective: Option<String>,
    #[arg(long, default_value_t = false)]
    pub public_dataset: bool,
    #[arg(long, default_value_t = false, conflicts_with = "unshared")]
    pub shared: bool,
    #[arg(long, default_value_t = false)]
    pub unshared: bool,
    /// Fraction of the dataset held out as test data.
    #[arg(long, default_value_t = 0.0)]
    pub test_split: f64,
    /// JSON file with new field definitions; requires --dataset.
    #[arg(long)]
    pub new_fields: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub multi_dataset: bool,
    /// Export the dataset as CSV with this file name.
    #[arg(long)]
    pub to_csv: Option<String>,
    #[arg(long)]
    pub seed: Option<String>,
    #[arg(long)]
    pub sample_rate: Option<f64>,
    /// Compute predictions remotely as a batch job.
    #[arg(long, default_value_t = false)]
    pub remote: bool,
    #[arg(long, default_value_t = false)]
    pub reports: bool,
    #[arg(long, default_value_t = false)]
    pub upload: bool,
}

impl CommonArgs {
    pub fn shared_flag(&self) -> Option<bool> {
        if self.shared {
            Some(true)
        } else if self.unshared {
            Some(false)
        } else {
            None
        }
    }

    pub fn has_train(&self) -> bool {
        self.training_set.is_some()
            || self.source.is_some()
            || self.dataset.is_some()
            || self.datasets.is_some()
    }

    pub fn has_test(&self) -> bool {
        self.test_set.is_some()
            || self.test_source.is_some()
            || self.test_dataset.is_some()
            || self.test_datasets.is_some()
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "bigmler")]
#[command(about = "Builds remote sources, datasets, models and predictions in one resumable run")]
pub struct MainCli {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long)]
    pub model: Option<String>,
    /// File listing model ids, one per line.
    #[arg(long)]
    pub models: Option<PathBuf>,
    #[arg(long)]
    pub ensemble: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub number_of_models: u32,
    /// Build one remote ensemble instead of independent models.
    #[arg(long, default_value_t = false)]
    pub ensembles: bool,
    #[arg(long, default_value_t = 0)]
    pub max_categories: u32,
    #[arg(long, default_value_t = false)]
    pub black_box: bool,
    #[arg(long, default_value_t = false)]
    pub white_box: bool,
    #[arg(long, default_value_t = false)]
    pub evaluate: bool,
    #[arg(long, default_value_t = 0.0)]
    pub cross_validation_rate: f64,
    #[arg(long, default_value_t = 5)]
    pub number_of_evaluations: u32,
}

impl MainCli {
    pub fn has_models(&self) -> bool {
        self.model.is_some() || self.models.is_some() || self.ensemble.is_some()
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "bigmler cluster")]
#[command(about = "Builds remote clusters and centroids in one resumable run")]
pub struct ClusterCli {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long)]
    pub cluster: Option<String>,
    /// File listing cluster ids, one per line.
    #[arg(long)]
    pub clusters: Option<PathBuf>,
    /// Local JSON cluster resource used instead of a remote fetch.
    #[arg(long)]
    pub cluster_file: Option<PathBuf>,
    #[arg(long)]
    pub k: Option<u32>,
    #[arg(long, default_value_t = false)]
    pub public_cluster: bool,
    /// Comma-separated centroid names to build datasets for; empty for all.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    pub cluster_datasets: Option<String>,
}

impl ClusterCli {
    pub fn has_clusters(&self) -> bool {
        self.cluster.is_some() || self.clusters.is_some() || self.cluster_file.is_some()
    }

    pub fn cluster_dataset_names(&self) -> Option<Vec<String>> {
        self.cluster_datasets.as_ref().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

#[derive(Debug, Clone)]
pub enum Invocation {
    Main(Box<MainCli>),
    Cluster(Box<ClusterCli>),
}

impl Invocation {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Self::Main(cli) => &cli.common,
            Self::Cluster(cli) => &cli.common,
        }
    }

    pub fn mode(&self) -> CommandMode {
        match self {
            Self::Main(_) => CommandMode::Main,
            Self::Cluster(_) => CommandMode::Cluster,
        }
    }

    pub fn default_output_name(&self) -> &'static str {
        match self {
            Self::Main(cli) if cli.evaluate => "evaluation",
            Self::Main(_) => "predictions.csv",
            Self::Cluster(_) => "centroids.csv",
        }
    }

    /// Local files the run reads its inputs from.
    pub fn input_files(&self) -> Vec<&Path> {
        let common = self.common();
        let mut files = vec![
            common.training_set.as_deref(),
            common.datasets.as_deref(),
            common.test_set.as_deref(),
            common.test_datasets.as_deref(),
            common.new_fields.as_deref(),
        ];
        match self {
            Self::Main(cli) => files.push(cli.models.as_deref()),
            Self::Cluster(cli) => {
                files.push(cli.clusters.as_deref());
                files.push(cli.cluster_file.as_deref());
            }
        }
        files.into_iter().flatten().collect()
    }

    /// Whether there is anything for the pipeline to do.
    pub fn has_work(&self) -> bool {
        match self {
            Self::Main(cli) => cli.common.has_train() || cli.common.has_test() || cli.has_models(),
            Self::Cluster(cli) => {
                cli.common.has_train()
                    || cli.common.has_test()
                    || cli.has_clusters()
                    || cli.cluster_datasets.is_some()
            }
        }
    }
}

pub fn mode_of(argv: &[String]) -> CommandMode {
    if argv.get(1).map(String::as_str) == Some(CLUSTER_SUBCOMMAND) {
        CommandMode::Cluster
    } else {
        CommandMode::Main
    }
}

pub fn parse_invocation(argv: &[String]) -> Result<Invocation, clap::Error> {
    match mode_of(argv) {
        CommandMode::Main => Ok(Invocation::Main(Box::new(MainCli::try_parse_from(argv)?))),
        CommandMode::Cluster => {
            let rest = argv
                .iter()
                .take(1)
                .chain(argv.iter().skip(2))
                .cloned()
                .collect::<Vec<_>>();
            Ok(Invocation::Cluster(Box::new(ClusterCli::try_parse_from(rest)?)))
        }
    }
}
