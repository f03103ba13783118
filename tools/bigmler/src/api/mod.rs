//! Remote resource API seam.
//!
//! The dispatcher only talks to [`ResourceApi`]; the HTTP client and the
//! fake used by tests both live behind it. Every remote job is asynchronous
//! server side, so callers block on [`check_resource`] until it settles.

pub mod fake;
pub mod http;

use crate::errors::BigmlerError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{Resource, ResourceId, ResourceKind, ResourceRef, ResourceStatus};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// What a new resource is built from.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
    LocalFile(PathBuf),
    Resource(ResourceId),
    Resources(Vec<ResourceId>),
    Pair(ResourceId, ResourceId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub kind: ResourceKind,
    pub origin: Origin,
    pub args: Value,
}

impl CreateRequest {
    pub fn new(kind: ResourceKind, origin: Origin, args: Value) -> Self {
        Self { kind, origin, args }
    }

    /// Request body: the arguments plus the origin references the API expects.
    pub fn body(&self) -> Map<String, Value> {
        let mut body = match &self.args {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        match &self.origin {
            Origin::LocalFile(_) => {}
            Origin::Resource(id) => {
                let dataset_from_dataset =
                    self.kind == ResourceKind::Dataset && id.kind() == ResourceKind::Dataset;
                let key = if dataset_from_dataset {
                    "origin_dataset"
                } else {
                    id.kind().as_str()
                };
                body.insert(key.to_string(), json!(id.to_string()));
            }
            Origin::Resources(ids) => {
                let key = if self.kind == ResourceKind::Dataset {
                    "origin_datasets"
                } else {
                    "datasets"
                };
                let ids = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
                body.insert(key.to_string(), json!(ids));
            }
            Origin::Pair(first, second) => {
                body.insert(first.kind().as_str().to_string(), json!(first.to_string()));
                body.insert(second.kind().as_str().to_string(), json!(second.to_string()));
            }
        }
        body
    }
}

pub trait ResourceApi: Send + Sync {
    fn create(&self, request: &CreateRequest) -> Result<Resource, BigmlerError>;
    fn get(&self, id: &ResourceId, query: Option<&str>) -> Result<Resource, BigmlerError>;
    fn update(&self, id: &ResourceId, changes: &Value) -> Result<Resource, BigmlerError>;
    /// Fetches the CSV output of a dataset, batch prediction or batch centroid.
    fn download(&self, id: &ResourceId) -> Result<String, BigmlerError>;
    fn upload_report(&self, url: &str, body: &Value) -> Result<String, BigmlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl WaitPolicy {
    pub fn new(poll_interval_ms: u64, max_polls: u32) -> Self {
        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_polls,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(1000, 3600)
    }
}

/// Polls `id` until the remote job finishes, failing on a faulty or unknown status.
pub fn check_resource(
    api: &dyn ResourceApi,
    clock: &dyn Clock,
    policy: WaitPolicy,
    id: &ResourceId,
    query: Option<&str>,
) -> Result<Resource, BigmlerError> {
    for attempt in 0..policy.max_polls {
        let resource = api.get(id, query)?;
        if resource.status.is_finished() {
            append_run_log(
                "debug",
                "resource.ready",
                json!({"resource": id.to_string(), "polls": attempt + 1}),
            );
            return Ok(resource);
        }
        if resource.status.is_failed() {
            append_run_log(
                "error",
                "resource.failed",
                json!({"resource": id.to_string(), "status": status_json(&resource.status)}),
            );
            return Err(BigmlerError::Remote {
                resource_id: id.to_string(),
                message: failure_message(&resource.status),
            });
        }
        clock.sleep_until(clock.now() + policy.poll_interval)?;
    }
    Err(BigmlerError::Timeout {
        resource_id: id.to_string(),
    })
}

/// Returns the finished resource behind `reference`, fetching it when needed.
pub fn resolve(
    api: &dyn ResourceApi,
    clock: &dyn Clock,
    policy: WaitPolicy,
    reference: &ResourceRef,
    query: Option<&str>,
) -> Result<Resource, BigmlerError> {
    match reference {
        ResourceRef::Resolved(resource) if resource.status.is_finished() => Ok(resource.clone()),
        other => check_resource(api, clock, policy, other.id(), query),
    }
}

fn failure_message(status: &ResourceStatus) -> String {
    if status.message.trim().is_empty() {
        format!("remote job ended with status {}", status.code)
    } else {
        status.message.clone()
    }
}

fn status_json(status: &ResourceStatus) -> Value {
    json!({"code": status.code, "message": status.message, "progress": status.progress})
}

/// Builds a [`Resource`] from an API response body.
pub fn parse_resource(body: Value) -> Result<Resource, BigmlerError> {
    let id = body
        .get("resource")
        .and_then(Value::as_str)
        .ok_or_else(|| BigmlerError::Api("response carries no `resource` id".to_string()))
        .and_then(ResourceId::parse)?;
    let status = match body.get("status") {
        Some(status) => serde_json::from_value::<ResourceStatus>(status.clone())
            .map_err(|e| BigmlerError::Api(format!("invalid status for {id}: {e}")))?,
        None => {
            return Err(BigmlerError::Api(format!("response for {id} carries no status")));
        }
    };
    Ok(Resource {
        id,
        status,
        object: body,
    })
}
