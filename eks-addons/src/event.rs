//! Infrastructure lifecycle events and their status responses
//!
//! A provisioning stack invokes the handler with a [`LifecycleEvent`] and
//! waits for exactly one [`StatusResponse`] at the event's response URL.

use crate::manifest::{apply_addon, Addon, ResourceApi, Verb};
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A lifecycle event delivered by the provisioning stack
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleEvent {
    /// The raw request type. See [`LifecycleEvent::request_type`].
    pub request_type: String,

    /// Where the status response must be sent.
    #[serde(rename = "ResponseURL")]
    pub response_url: String,

    /// The stack that owns the resource.
    pub stack_id: String,

    /// Identifies this request.
    pub request_id: String,

    /// The resource's name in the stack template.
    pub logical_resource_id: String,

    /// The physical ID reported when the resource was created. Absent on create.
    #[serde(default)]
    pub physical_resource_id: Option<String>,
}

/// The lifecycle action requested
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// The resource is being created
    Create,
    /// The resource's properties changed
    Update,
    /// The resource is being removed
    Delete,
}

/// The terminal status of an event
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// The request was handled
    Success,
    /// The request could not be handled
    Failed,
}

/// The body sent to an event's response URL
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    /// Whether the request was handled.
    pub status: Status,
    /// A human-readable explanation.
    pub reason: String,
    /// The resource's physical ID, which must not change across updates.
    pub physical_resource_id: String,
    /// Copied from the event.
    pub stack_id: String,
    /// Copied from the event.
    pub request_id: String,
    /// Copied from the event.
    pub logical_resource_id: String,
    /// Output attributes. Always empty.
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Indicates that an event could not be read or answered
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event could not be read
    #[error("failed to read event: {0}")]
    Read(#[from] std::io::Error),

    /// The event is not a valid event record
    #[error("invalid event: {0}")]
    Parse(#[from] serde_json::Error),

    /// The event's request type is not one of Create, Update or Delete
    #[error("unrecognized request type: {0}")]
    UnknownRequestType(String),

    /// The status response could not be delivered
    #[error("failed to deliver status response: {0}")]
    Delivery(#[from] reqwest::Error),
}

// === impl LifecycleEvent ===

impl LifecycleEvent {
    /// Parses an event record from JSON
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads an event record from `reader` until it is exhausted
    pub async fn read<R>(mut reader: R) -> Result<Self, EventError>
    where
        R: AsyncRead + Unpin,
    {
        let mut json = String::new();
        reader.read_to_string(&mut json).await?;
        Self::from_json(&json)
    }

    /// Reads an event record from a file
    pub async fn read_file(path: impl AsRef<Path>) -> Result<Self, EventError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// The requested action, or an error if the request type is not recognized
    pub fn request_type(&self) -> Result<RequestType, EventError> {
        self.request_type.parse()
    }

    /// Builds the status response for this event
    ///
    /// The physical ID reported on creation is the logical resource ID; later
    /// requests echo the ID they were sent.
    pub fn response(&self, status: Status, reason: impl Into<String>) -> StatusResponse {
        StatusResponse {
            status,
            reason: reason.into(),
            physical_resource_id: self
                .physical_resource_id
                .clone()
                .unwrap_or_else(|| self.logical_resource_id.clone()),
            stack_id: self.stack_id.clone(),
            request_id: self.request_id.clone(),
            logical_resource_id: self.logical_resource_id.clone(),
            data: serde_json::Map::new(),
        }
    }
}

/// Handles an event for `addon` and decides its status
///
/// `api` is `None` when no cluster configuration could be assembled, in
/// which case nothing is applied and the event fails. An unrecognized request
/// type also fails without touching the cluster. Otherwise the request's verb
/// is applied to every manifest and the event succeeds even if individual
/// resources failed; those failures are logged and summarized in the reason.
pub async fn handle<A, D>(event: &LifecycleEvent, api: Option<&A>, addon: &D) -> StatusResponse
where
    A: ResourceApi + ?Sized,
    D: Addon + ?Sized,
{
    let request_type = match event.request_type() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!(%error, request_id = %event.request_id, "Cannot handle event");
            return event.response(Status::Failed, error.to_string());
        }
    };
    tracing::info!(
        ?request_type,
        request_id = %event.request_id,
        addon = %addon.name(),
        "Handling event"
    );

    let Some(api) = api else {
        tracing::error!(request_id = %event.request_id, "No cluster configuration");
        return event.response(Status::Failed, "cluster configuration unavailable");
    };

    let batch = apply_addon(api, request_type.into(), addon).await;
    let failures = batch.failures().count();
    let reason = if failures == 0 {
        format!("{} {} resources", batch.verb(), batch.len())
    } else {
        format!(
            "{} {} resources; {failures} failed",
            batch.verb(),
            batch.len()
        )
    };
    event.response(Status::Success, reason)
}

// === impl RequestType ===

impl FromStr for RequestType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Update" => Ok(Self::Update),
            "Delete" => Ok(Self::Delete),
            s => Err(EventError::UnknownRequestType(s.to_string())),
        }
    }
}

impl From<RequestType> for Verb {
    fn from(rt: RequestType) -> Self {
        match rt {
            RequestType::Create => Verb::Create,
            RequestType::Update => Verb::Patch,
            RequestType::Delete => Verb::Delete,
        }
    }
}

// === impl Status ===

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

// === impl StatusResponse ===

impl StatusResponse {
    /// Serializes the response body
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Builds the PUT that delivers this response to `url`
    ///
    /// Response URLs are presigned without a content type, so the header is
    /// sent empty.
    pub fn request(
        &self,
        client: &reqwest::Client,
        url: &str,
    ) -> Result<reqwest::Request, EventError> {
        let req = client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "")
            .body(self.to_json()?)
            .build()?;
        Ok(req)
    }

    /// Delivers this response to `url`
    pub async fn send(&self, client: &reqwest::Client, url: &str) -> Result<(), EventError> {
        let req = self.request(client, url)?;
        tracing::info!(status = %self.status, reason = %self.reason, "Sending status");
        client.execute(req).await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addons::ExternalDns,
        manifest::{tests::recording_api, ApplyError, Manifest, MockResourceApi},
    };
    use std::sync::{Arc, Mutex};

    const RESPONSE_URL: &str =
        "https://cloudformation-custom-resource-response.example.com/?sig=abc";

    fn event_json(request_type: &str, physical_id: Option<&str>) -> String {
        let mut json = serde_json::json!({
            "RequestType": request_type,
            "ResponseURL": RESPONSE_URL,
            "StackId": "arn:aws:cloudformation:us-east-1:123456789012:stack/addons/guid",
            "RequestId": "unique-request-id",
            "ResourceType": "Custom::ExternalDNS",
            "LogicalResourceId": "ExternalDNS",
            "ResourceProperties": {
                "ServiceToken": "arn:aws:lambda:us-east-1:123456789012:function:addons",
            },
        });
        if let Some(id) = physical_id {
            json["PhysicalResourceId"] = id.into();
        }
        json.to_string()
    }

    fn event(request_type: &str, physical_id: Option<&str>) -> LifecycleEvent {
        LifecycleEvent::from_json(&event_json(request_type, physical_id)).expect("event parses")
    }

    fn addon() -> ExternalDns {
        ExternalDns::new("arn:aws:iam::123456789012:role/ExternalDNS", "example.com")
    }

    #[test]
    fn parses_event_record() {
        let ev = event("Update", Some("ExternalDNS-1"));
        assert_eq!(ev.request_type().expect("known"), RequestType::Update);
        assert_eq!(ev.response_url, RESPONSE_URL);
        assert_eq!(ev.physical_resource_id.as_deref(), Some("ExternalDNS-1"));
        assert_eq!(event("Create", None).physical_resource_id, None);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = LifecycleEvent::from_json(r#"{"RequestType":"Create"}"#).expect_err("invalid");
        assert!(matches!(err, EventError::Parse(_)));
    }

    #[test]
    fn request_types_are_closed() {
        assert_eq!("Create".parse::<RequestType>().unwrap(), RequestType::Create);
        assert_eq!("Delete".parse::<RequestType>().unwrap(), RequestType::Delete);
        for unknown in ["create", "Replace", ""] {
            assert!(matches!(
                unknown.parse::<RequestType>(),
                Err(EventError::UnknownRequestType(s)) if s == unknown
            ));
        }
        assert_eq!(Verb::from(RequestType::Update), Verb::Patch);
    }

    #[test]
    fn response_body() {
        let body = event("Create", None).response(Status::Success, "ok");
        let json: serde_json::Value =
            serde_json::from_str(&body.to_json().expect("serializes")).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "Status": "SUCCESS",
                "Reason": "ok",
                "PhysicalResourceId": "ExternalDNS",
                "StackId": "arn:aws:cloudformation:us-east-1:123456789012:stack/addons/guid",
                "RequestId": "unique-request-id",
                "LogicalResourceId": "ExternalDNS",
                "Data": {},
            })
        );
    }

    #[tokio::test]
    async fn reads_event_from_reader_or_file() {
        let json = event_json("Delete", Some("ExternalDNS-1"));
        let from_reader = LifecycleEvent::read(json.as_bytes())
            .await
            .expect("event from reader");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("event.json");
        std::fs::write(&path, &json).expect("write event");
        let from_file = LifecycleEvent::read_file(&path)
            .await
            .expect("event from file");

        assert_eq!(from_reader, from_file);
        assert_eq!(from_file.request_type().expect("known"), RequestType::Delete);

        let missing = LifecycleEvent::read_file(dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(EventError::Read(_))));
        let garbage = LifecycleEvent::read(&b"not json"[..]).await;
        assert!(matches!(garbage, Err(EventError::Parse(_))));
    }

    #[test]
    fn status_is_put_with_an_empty_content_type() {
        let rsp = event("Create", None).response(Status::Success, "create 4 resources");
        let req = rsp
            .request(&reqwest::Client::new(), RESPONSE_URL)
            .expect("request");

        assert_eq!(req.method(), reqwest::Method::PUT);
        assert_eq!(req.url().as_str(), RESPONSE_URL);
        assert_eq!(
            req.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .map(|v| v.as_bytes()),
            Some(&b""[..])
        );

        let body = req.body().and_then(|b| b.as_bytes()).expect("buffered body");
        let json: serde_json::Value = serde_json::from_slice(body).expect("json");
        assert_eq!(json["Status"], "SUCCESS");
        assert_eq!(json["Reason"], "create 4 resources");
        assert_eq!(json["PhysicalResourceId"], "ExternalDNS");
        assert_eq!(json["RequestId"], "unique-request-id");
    }

    #[test]
    fn physical_id_is_stable_across_updates() {
        let body = event("Update", Some("ExternalDNS-1")).response(Status::Failed, "no");
        assert_eq!(body.physical_resource_id, "ExternalDNS-1");
        assert_eq!(body.status.to_string(), "FAILED");
    }

    #[tokio::test]
    async fn create_applies_and_succeeds() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let api = recording_api(calls.clone());
        let rsp = handle(&event("Create", None), Some(&api), &addon()).await;
        assert_eq!(rsp.status, Status::Success);
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert_eq!(calls.lock().unwrap()[0], "Deployment/external-dns");
    }

    #[tokio::test]
    async fn delete_applies_in_reverse() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let api = recording_api(calls.clone());
        let rsp = handle(&event("Delete", Some("ExternalDNS")), Some(&api), &addon()).await;
        assert_eq!(rsp.status, Status::Success);
        assert_eq!(
            calls.lock().unwrap()[0],
            "ClusterRoleBinding/external-dns-viewer"
        );
    }

    #[tokio::test]
    async fn unknown_request_type_fails_without_api_calls() {
        let mut api = MockResourceApi::new();
        api.expect_apply().never();
        let rsp = handle(&event("Replace", None), Some(&api), &addon()).await;
        assert_eq!(rsp.status, Status::Failed);
        assert!(rsp.reason.contains("Replace"));
    }

    #[tokio::test]
    async fn missing_configuration_fails() {
        let rsp = handle::<MockResourceApi, _>(&event("Create", None), None, &addon()).await;
        assert_eq!(rsp.status, Status::Failed);
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let mut api = MockResourceApi::new();
        api.expect_apply().times(4).returning(|_, manifest| match manifest {
            Manifest::ClusterRole(_) => Err(ApplyError::MissingName("ClusterRole")),
            _ => Ok(()),
        });
        let rsp = handle(&event("Update", Some("ExternalDNS")), Some(&api), &addon()).await;
        assert_eq!(rsp.status, Status::Success);
        assert_eq!(rsp.reason, "patch 4 resources; 1 failed");
    }
}
