//! Resource ids recorded inside a run's output directory.
//!
//! Each created resource is appended to its checkpoint file as soon as the
//! create call returns, so an interrupted run can pick up the same remote
//! artifacts on `--resume` instead of creating them again.

use crate::errors::BigmlerError;
use crate::runtime::FileSystem;
use crate::types::ResourceId;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Source,
    Dataset,
    DatasetTrain,
    DatasetTest,
    DatasetGen,
    DatasetMulti,
    CategoryDatasets,
    Models,
    Ensembles,
    Clusters,
    TestSource,
    TestDataset,
    BatchPrediction,
    BatchCentroid,
    Evaluations,
    CrossValidationModels,
    CrossValidationEvaluations,
    ClusterDatasets,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 18] = [
        Self::Source,
        Self::Dataset,
        Self::DatasetTrain,
        Self::DatasetTest,
        Self::DatasetGen,
        Self::DatasetMulti,
        Self::CategoryDatasets,
        Self::Models,
        Self::Ensembles,
        Self::Clusters,
        Self::TestSource,
        Self::TestDataset,
        Self::BatchPrediction,
        Self::BatchCentroid,
        Self::Evaluations,
        Self::CrossValidationModels,
        Self::CrossValidationEvaluations,
        Self::ClusterDatasets,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Dataset => "dataset",
            Self::DatasetTrain => "dataset_train",
            Self::DatasetTest => "dataset_test",
            Self::DatasetGen => "dataset_gen",
            Self::DatasetMulti => "dataset_multi",
            Self::CategoryDatasets => "datasets",
            Self::Models => "models",
            Self::Ensembles => "ensembles",
            Self::Clusters => "clusters",
            Self::TestSource => "test_source",
            Self::TestDataset => "test_dataset",
            Self::BatchPrediction => "batch_prediction",
            Self::BatchCentroid => "batch_centroid",
            Self::Evaluations => "evaluations",
            Self::CrossValidationModels => "cross_validation_models",
            Self::CrossValidationEvaluations => "cross_validation_evaluations",
            Self::ClusterDatasets => "cluster_datasets",
        }
    }
}

pub struct Checkpoints<'a> {
    fs: &'a dyn FileSystem,
    dir: PathBuf,
}

impl<'a> Checkpoints<'a> {
    pub fn new(fs: &'a dyn FileSystem, dir: impl AsRef<Path>) -> Self {
        Self {
            fs,
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, checkpoint: Checkpoint) -> PathBuf {
        self.dir.join(checkpoint.file_name())
    }

    pub fn read(&self, checkpoint: Checkpoint) -> Result<Vec<ResourceId>, BigmlerError> {
        let path = self.path(checkpoint);
        if !self.fs.exists(&path) {
            return Ok(Vec::new());
        }
        self.fs
            .read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                ResourceId::parse(line).map_err(|e| {
                    BigmlerError::CorruptLog(format!("{}: {e}", path.display()))
                })
            })
            .collect()
    }

    pub fn first(&self, checkpoint: Checkpoint) -> Result<Option<ResourceId>, BigmlerError> {
        Ok(self.read(checkpoint)?.into_iter().next())
    }

    pub fn append(&self, checkpoint: Checkpoint, id: &ResourceId) -> Result<(), BigmlerError> {
        self.fs.append_line(&self.path(checkpoint), &id.to_string())
    }

    /// Removes every checkpoint file left in the directory by an earlier run,
    /// except those in `inputs`. A fresh run calls this so `--resume` only
    /// ever sees its own resources.
    pub fn reset(&self, inputs: &[PathBuf]) -> Result<(), BigmlerError> {
        for checkpoint in Checkpoint::ALL {
            let path = self.path(checkpoint);
            if self.fs.exists(&path) && !inputs.contains(&path) {
                self.fs.remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;
    use crate::types::ResourceKind;

    #[test]
    fn missing_checkpoint_reads_empty() {
        let fs = FakeFileSystem::default();
        let checkpoints = Checkpoints::new(&fs, "/out");
        assert!(checkpoints.read(Checkpoint::Models).expect("read").is_empty());
        assert!(checkpoints.first(Checkpoint::Source).expect("read").is_none());
    }

    #[test]
    fn appended_ids_are_read_back_in_order() {
        let fs = FakeFileSystem::default();
        let checkpoints = Checkpoints::new(&fs, "/out");
        let a = ResourceId::new(ResourceKind::Model, "000000000000000000000001");
        let b = ResourceId::new(ResourceKind::Model, "000000000000000000000002");
        checkpoints.append(Checkpoint::Models, &a).expect("append");
        checkpoints.append(Checkpoint::Models, &b).expect("append");
        assert_eq!(checkpoints.read(Checkpoint::Models).expect("read"), vec![a, b]);
        assert_eq!(checkpoints.path(Checkpoint::Models), PathBuf::from("/out/models"));
    }

    #[test]
    fn reset_removes_every_checkpoint_but_nothing_else() {
        let fs = FakeFileSystem::with_file("/out/bigmler_sessions", "bigmler --train a.csv\n");
        let checkpoints = Checkpoints::new(&fs, "/out");
        let model = ResourceId::new(ResourceKind::Model, "000000000000000000000001");
        let dataset = ResourceId::new(ResourceKind::Dataset, "000000000000000000000002");
        checkpoints.append(Checkpoint::Models, &model).expect("append");
        checkpoints.append(Checkpoint::Dataset, &dataset).expect("append");

        checkpoints.reset(&[]).expect("reset");

        for checkpoint in Checkpoint::ALL {
            assert!(checkpoints.read(checkpoint).expect("read").is_empty());
        }
        assert!(fs.contents(Path::new("/out/bigmler_sessions")).is_some());
    }

    #[test]
    fn reset_keeps_checkpoints_given_as_inputs() {
        let fs = FakeFileSystem::default();
        let checkpoints = Checkpoints::new(&fs, "/out");
        let model = ResourceId::new(ResourceKind::Model, "000000000000000000000001");
        checkpoints.append(Checkpoint::Models, &model).expect("append");
        checkpoints.append(Checkpoint::Ensembles, &model).expect("append");

        checkpoints.reset(&[PathBuf::from("/out/models")]).expect("reset");

        assert_eq!(checkpoints.read(Checkpoint::Models).expect("read"), vec![model]);
        assert!(checkpoints.read(Checkpoint::Ensembles).expect("read").is_empty());
    }

    #[test]
    fn reset_surfaces_filesystem_errors() {
        let fs = FakeFileSystem::with_file("/out/source", "source/000000000000000000000001\n");
        fs.set_fail_next(BigmlerError::Io("read-only output dir".to_string()));
        let err = Checkpoints::new(&fs, "/out").reset(&[]).expect_err("must fail");
        assert!(matches!(err, BigmlerError::Io(_)));
    }

    #[test]
    fn garbage_in_a_checkpoint_is_corrupt() {
        let fs = FakeFileSystem::with_file("/out/dataset", "not-an-id\n");
        let checkpoints = Checkpoints::new(&fs, "/out");
        let err = checkpoints.read(Checkpoint::Dataset).expect_err("must fail");
        assert!(matches!(err, BigmlerError::CorruptLog(_)));
    }
}
