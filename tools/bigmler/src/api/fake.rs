use super::{CreateRequest, ResourceApi};
use crate::errors::BigmlerError;
use crate::types::{Resource, ResourceId, ResourceKind, ResourceStatus, STATUS_FINISHED};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Create(CreateRequest),
    Get(ResourceId),
    Update(ResourceId, Value),
    Download(ResourceId),
    UploadReport(String),
}

#[derive(Default)]
struct FakeState {
    next_key: u64,
    resources: BTreeMap<ResourceId, Resource>,
    scripted: HashMap<ResourceId, VecDeque<i64>>,
    templates: HashMap<ResourceKind, Value>,
    create_statuses: HashMap<ResourceKind, VecDeque<i64>>,
    create_failures: HashMap<ResourceKind, String>,
    downloads: HashMap<ResourceId, String>,
    calls: Vec<ApiCall>,
}

impl FakeState {
    fn allocate(&mut self, kind: ResourceKind) -> ResourceId {
        self.next_key += 1;
        ResourceId::new(kind, format!("{:024x}", self.next_key))
    }
}

/// In-memory stand-in for the remote service. Every call is recorded.
#[derive(Default, Clone)]
pub struct FakeResourceApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeResourceApi {
    /// Adds a finished resource and returns its id.
    pub fn seed(&self, kind: ResourceKind, object: Value) -> ResourceId {
        let mut state = self.state.lock().expect("fake api lock");
        let id = state.allocate(kind);
        let resource = finished(&id, object);
        state.resources.insert(id.clone(), resource);
        id
    }

    /// Status codes returned by the next `get` calls for `id` before it reports finished.
    pub fn script_statuses(&self, id: &ResourceId, codes: &[i64]) {
        self.state
            .lock()
            .expect("fake api lock")
            .scripted
            .insert(id.clone(), codes.iter().copied().collect());
    }

    /// Fields merged into every resource of `kind` this fake creates.
    pub fn set_template(&self, kind: ResourceKind, object: Value) {
        self.state
            .lock()
            .expect("fake api lock")
            .templates
            .insert(kind, object);
    }

    /// Status codes the next created resource of `kind` goes through when polled.
    pub fn script_create_statuses(&self, kind: ResourceKind, codes: &[i64]) {
        self.state
            .lock()
            .expect("fake api lock")
            .create_statuses
            .insert(kind, codes.iter().copied().collect());
    }

    pub fn fail_creates(&self, kind: ResourceKind, message: &str) {
        self.state
            .lock()
            .expect("fake api lock")
            .create_failures
            .insert(kind, message.to_string());
    }

    pub fn allow_creates(&self, kind: ResourceKind) {
        self.state
            .lock()
            .expect("fake api lock")
            .create_failures
            .remove(&kind);
    }

    pub fn set_download(&self, id: &ResourceId, body: &str) {
        self.state
            .lock()
            .expect("fake api lock")
            .downloads
            .insert(id.clone(), body.to_string());
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().expect("fake api lock").calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().expect("fake api lock").calls.len()
    }

    pub fn creates(&self, kind: ResourceKind) -> Vec<CreateRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Create(request) if request.kind == kind => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn resource(&self, id: &ResourceId) -> Option<Resource> {
        self.state
            .lock()
            .expect("fake api lock")
            .resources
            .get(id)
            .cloned()
    }
}

fn finished(id: &ResourceId, object: Value) -> Resource {
    with_status(id, object, STATUS_FINISHED)
}

fn with_status(id: &ResourceId, object: Value, code: i64) -> Resource {
    let mut map = match object {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("resource".to_string(), json!(id.to_string()));
    Resource {
        id: id.clone(),
        status: ResourceStatus {
            code,
            message: String::new(),
            progress: if code == STATUS_FINISHED { 1.0 } else { 0.0 },
        },
        object: Value::Object(map),
    }
}

fn merge(target: &mut Map<String, Value>, extra: &Value) {
    if let Value::Object(extra) = extra {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
}

impl ResourceApi for FakeResourceApi {
    fn create(&self, request: &CreateRequest) -> Result<Resource, BigmlerError> {
        let mut state = self.state.lock().expect("fake api lock");
        state.calls.push(ApiCall::Create(request.clone()));
        if let Some(message) = state.create_failures.get(&request.kind) {
            return Err(BigmlerError::Api(message.clone()));
        }
        let id = state.allocate(request.kind);
        let mut object = Map::new();
        if let Some(template) = state.templates.get(&request.kind) {
            merge(&mut object, template);
        }
        merge(&mut object, &Value::Object(request.body()));
        let pending = state.create_statuses.remove(&request.kind);
        let resource = match pending {
            Some(codes) if !codes.is_empty() => {
                let first = codes.front().copied().unwrap_or(STATUS_FINISHED);
                state.scripted.insert(id.clone(), codes);
                with_status(&id, Value::Object(object), first)
            }
            _ => finished(&id, Value::Object(object)),
        };
        state.resources.insert(id, resource.clone());
        Ok(resource)
    }

    fn get(&self, id: &ResourceId, _query: Option<&str>) -> Result<Resource, BigmlerError> {
        let mut state = self.state.lock().expect("fake api lock");
        state.calls.push(ApiCall::Get(id.clone()));
        let code = state
            .scripted
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(STATUS_FINISHED);
        let resource = state.resources.get_mut(id).ok_or_else(|| BigmlerError::Remote {
            resource_id: id.to_string(),
            message: "not found".to_string(),
        })?;
        resource.status.code = code;
        resource.status.progress = if code == STATUS_FINISHED { 1.0 } else { 0.0 };
        if code < 0 {
            resource.status.message = "job failed".to_string();
        }
        Ok(resource.clone())
    }

    fn update(&self, id: &ResourceId, changes: &Value) -> Result<Resource, BigmlerError> {
        let mut state = self.state.lock().expect("fake api lock");
        state.calls.push(ApiCall::Update(id.clone(), changes.clone()));
        let resource = state.resources.get_mut(id).ok_or_else(|| BigmlerError::Remote {
            resource_id: id.to_string(),
            message: "not found".to_string(),
        })?;
        if let Value::Object(map) = &mut resource.object {
            merge(map, changes);
        }
        Ok(resource.clone())
    }

    fn download(&self, id: &ResourceId) -> Result<String, BigmlerError> {
        let mut state = self.state.lock().expect("fake api lock");
        state.calls.push(ApiCall::Download(id.clone()));
        Ok(state.downloads.get(id).cloned().unwrap_or_default())
    }

    fn upload_report(&self, url: &str, _body: &Value) -> Result<String, BigmlerError> {
        let mut state = self.state.lock().expect("fake api lock");
        state.calls.push(ApiCall::UploadReport(url.to_string()));
        Ok(format!("{url}/1"))
    }
}
