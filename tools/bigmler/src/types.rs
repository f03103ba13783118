use crate::errors::BigmlerError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const STATUS_FINISHED: i64 = 5;
pub const STATUS_FAULTY: i64 = -1;
pub const STATUS_UNKNOWN: i64 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Source,
    Dataset,
    Model,
    Ensemble,
    Cluster,
    Prediction,
    BatchPrediction,
    Centroid,
    BatchCentroid,
    Evaluation,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::Ensemble => "ensemble",
            Self::Cluster => "cluster",
            Self::Prediction => "prediction",
            Self::BatchPrediction => "batchprediction",
            Self::Centroid => "centroid",
            Self::BatchCentroid => "batchcentroid",
            Self::Evaluation => "evaluation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "source" => Some(Self::Source),
            "dataset" => Some(Self::Dataset),
            "model" => Some(Self::Model),
            "ensemble" => Some(Self::Ensemble),
            "cluster" => Some(Self::Cluster),
            "prediction" => Some(Self::Prediction),
            "batchprediction" => Some(Self::BatchPrediction),
            "centroid" => Some(Self::Centroid),
            "batchcentroid" => Some(Self::BatchCentroid),
            "evaluation" => Some(Self::Evaluation),
            _ => None,
        }
    }
}

/// A remote resource id of the form `kind/<24 hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    kind: ResourceKind,
    key: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, BigmlerError> {
        let trimmed = value.trim();
        let (kind, key) = trimmed
            .split_once('/')
            .ok_or_else(|| BigmlerError::Api(format!("malformed resource id `{trimmed}`")))?;
        let kind = ResourceKind::parse(kind)
            .ok_or_else(|| BigmlerError::Api(format!("unknown resource kind in `{trimmed}`")))?;
        if key.len() != 24 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BigmlerError::Api(format!(
                "malformed resource id `{trimmed}`"
            )));
        }
        Ok(Self::new(kind, key))
    }

    /// Parses `value` and checks it names a resource of `kind`.
    pub fn parse_kind(value: &str, kind: ResourceKind) -> Result<Self, BigmlerError> {
        let id = Self::parse(value)?;
        if id.kind != kind {
            return Err(BigmlerError::Api(format!(
                "expected a {} id, got `{}`",
                kind.as_str(),
                id
            )));
        }
        Ok(id)
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.key)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = BigmlerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress: f64,
}

impl ResourceStatus {
    pub fn is_finished(&self) -> bool {
        self.code == STATUS_FINISHED
    }

    pub fn is_failed(&self) -> bool {
        self.code == STATUS_FAULTY || self.code == STATUS_UNKNOWN
    }
}

/// A fully materialized remote resource as returned by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub status: ResourceStatus,
    /// The resource body (the API's `object` payload).
    pub object: Value,
}

impl Resource {
    pub fn name(&self) -> Option<&str> {
        self.object.get("name").and_then(Value::as_str)
    }

    pub fn user_metadata(&self, key: &str) -> Option<&Value> {
        self.object.get("user_metadata").and_then(|meta| meta.get(key))
    }
}

/// A resource that may or may not have been fetched yet.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceRef {
    Unresolved(ResourceId),
    Resolved(Resource),
}

impl ResourceRef {
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Unresolved(id) => id,
            Self::Resolved(resource) => &resource.id,
        }
    }

    pub fn resolved(&self) -> Option<&Resource> {
        match self {
            Self::Unresolved(_) => None,
            Self::Resolved(resource) => Some(resource),
        }
    }
}

impl From<ResourceId> for ResourceRef {
    fn from(value: ResourceId) -> Self {
        Self::Unresolved(value)
    }
}

impl From<Resource> for ResourceRef {
    fn from(value: Resource) -> Self {
        Self::Resolved(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Source,
    Dataset,
    Model,
    TestData,
    Action,
    Report,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Source,
        Stage::Dataset,
        Stage::Model,
        Stage::TestData,
        Stage::Action,
        Stage::Report,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Dataset => "dataset",
            Self::Model => "model",
            Self::TestData => "test_data",
            Self::Action => "action",
            Self::Report => "report",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Main,
    Cluster,
}

impl CommandMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Cluster => "cluster",
        }
    }
}
