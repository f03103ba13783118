use super::{parse_resource, CreateRequest, Origin, ResourceApi};
use crate::config::ApiSettings;
use crate::errors::BigmlerError;
use crate::logging::append_run_log;
use crate::types::{Resource, ResourceId, ResourceKind};
use reqwest::blocking::{multipart, Client, Response};
use reqwest::Url;
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct HttpResourceApi {
    client: Client,
    base_url: String,
    username: String,
    api_key: String,
}

impl HttpResourceApi {
    pub fn new(settings: &ApiSettings) -> Result<Self, BigmlerError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("bigmler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BigmlerError::Api(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            username: settings.username.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    /// Resource URL with percent-encoded credentials, then any extra query.
    fn url(&self, path: &str, query: Option<&str>) -> Result<Url, BigmlerError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| BigmlerError::Api(format!("invalid url for {path}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("username", &self.username)
            .append_pair("api_key", &self.api_key);
        if let Some(extra) = query.filter(|q| !q.is_empty()) {
            let auth = url.query().unwrap_or_default().to_string();
            url.set_query(Some(&format!("{auth}&{extra}")));
        }
        Ok(url)
    }

    fn resource_response(
        &self,
        response: Response,
        label: &str,
    ) -> Result<Resource, BigmlerError> {
        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| BigmlerError::Api(format!("invalid response for {label}: {e}")))?;
        if !status.is_success() {
            let message = body
                .pointer("/status/message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(BigmlerError::Remote {
                resource_id: label.to_string(),
                message: format!("HTTP {}: {message}", status.as_u16()),
            });
        }
        parse_resource(body)
    }

    fn upload_form(
        &self,
        request: &CreateRequest,
        path: &std::path::Path,
    ) -> Result<multipart::Form, BigmlerError> {
        let mut form = multipart::Form::new()
            .file("file", path)
            .map_err(|e| BigmlerError::Io(format!("{}: {e}", path.display())))?;
        for (key, value) in request.body() {
            let text = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            form = form.text(key, text);
        }
        Ok(form)
    }
}

impl ResourceApi for HttpResourceApi {
    fn create(&self, request: &CreateRequest) -> Result<Resource, BigmlerError> {
        let label = request.kind.as_str();
        append_run_log(
            "debug",
            "api.create",
            json!({"kind": label, "body": Value::Object(request.body())}),
        );
        let url = self.url(label, None)?;
        let response = match (&request.origin, request.kind) {
            (Origin::LocalFile(path), ResourceKind::Source) => self
                .client
                .post(url)
                .multipart(self.upload_form(request, path)?)
                .send(),
            (Origin::LocalFile(path), kind) => {
                return Err(BigmlerError::Api(format!(
                    "a {} cannot be created from local file {}",
                    kind.as_str(),
                    path.display()
                )));
            }
            _ => self
                .client
                .post(url)
                .json(&Value::Object(request.body()))
                .send(),
        }
        .map_err(|e| BigmlerError::Api(format!("create {label}: {e}")))?;
        self.resource_response(response, label)
    }

    fn get(&self, id: &ResourceId, query: Option<&str>) -> Result<Resource, BigmlerError> {
        let label = id.to_string();
        let response = self
            .client
            .get(self.url(&label, query)?)
            .send()
            .map_err(|e| BigmlerError::Api(format!("get {label}: {e}")))?;
        self.resource_response(response, &label)
    }

    fn update(&self, id: &ResourceId, changes: &Value) -> Result<Resource, BigmlerError> {
        let label = id.to_string();
        append_run_log("debug", "api.update", json!({"resource": label, "changes": changes}));
        let response = self
            .client
            .put(self.url(&label, None)?)
            .json(changes)
            .send()
            .map_err(|e| BigmlerError::Api(format!("update {label}: {e}")))?;
        self.resource_response(response, &label)
    }

    fn download(&self, id: &ResourceId) -> Result<String, BigmlerError> {
        let label = id.to_string();
        let response = self
            .client
            .get(self.url(&format!("{label}/download"), None)?)
            .send()
            .map_err(|e| BigmlerError::Api(format!("download {label}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| BigmlerError::Api(format!("download {label}: {e}")))?;
        if !status.is_success() {
            return Err(BigmlerError::Remote {
                resource_id: label,
                message: format!("HTTP {}: download failed", status.as_u16()),
            });
        }
        Ok(text)
    }

    fn upload_report(&self, url: &str, body: &Value) -> Result<String, BigmlerError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| BigmlerError::Api(format!("upload report: {e}")))?;
        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if !status.is_success() {
            return Err(BigmlerError::Api(format!(
                "upload report: HTTP {}",
                status.as_u16()
            )));
        }
        Ok(location.unwrap_or_else(|| url.to_string()))
    }
}
