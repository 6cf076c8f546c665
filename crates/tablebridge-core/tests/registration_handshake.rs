//! Artifact uploads through `upload_table` with a scripted HTTP transport.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};

use arrow::{
    array::{Float64Array, Int64Array},
    record_batch::RecordBatch,
};
use async_trait::async_trait;
use bytes::Bytes;
use tablebridge_core::{
    entity::{EntityRef, GroupId},
    progress::NoProgress,
    push::{BatchSource, PushError, UploadRequest, Uploaded, upload_table},
    registration::{
        ArtifactLocation, HttpReply, RegistrationError, RegistrationResult, RegistrationTransport,
        SECRET_TOKEN_KEY, read_artifact_metadata,
    },
    remote::memory::InMemoryService,
    session::Session,
};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct ScriptedTransport {
    token_status: u16,
    posts: Mutex<Vec<(String, Vec<(String, String)>, serde_json::Value)>>,
}

impl ScriptedTransport {
    fn new(token_status: u16) -> Self {
        Self {
            token_status,
            posts: Mutex::new(Vec::new()),
        }
    }
}

fn reply(status: u16, body: serde_json::Value) -> HttpReply {
    HttpReply {
        status,
        set_cookies: vec!["csrftoken=abc; Path=/".to_string(), "sessionid=s1".to_string()],
        body: Bytes::from(body.to_string()),
    }
}

#[async_trait]
impl RegistrationTransport for ScriptedTransport {
    async fn get(&self, _url: &str) -> RegistrationResult<HttpReply> {
        if self.token_status == 200 {
            Ok(reply(200, serde_json::json!({"data": "csrf-1"})))
        } else {
            Ok(reply(self.token_status, serde_json::json!({"message": "login required"})))
        }
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &serde_json::Value,
    ) -> RegistrationResult<HttpReply> {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.posts
            .lock()
            .unwrap()
            .push((url.to_string(), headers, body.clone()));
        Ok(reply(200, serde_json::json!({"data": {"file_annotation": 900}})))
    }
}

fn setup() -> Result<(InMemoryService, Session, BatchSource), Box<dyn std::error::Error>> {
    let service = InMemoryService::new();
    service.add_entity(EntityRef::image(5), GroupId(0));
    let session = Session::from_client(service.client("imaging.example.org", 4064));
    let batch = RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as _),
        ("score", Arc::new(Float64Array::from(vec![0.1, 0.2, 0.3, 0.4])) as _),
    ])?;
    Ok((service, session, BatchSource::new(batch)))
}

#[tokio::test]
async fn artifact_upload_registers_instead_of_pushing() -> TestResult {
    let tmp = TempDir::new()?;
    let (service, session, mut source) = setup()?;
    let transport = ScriptedTransport::new(200);

    let mut request = UploadRequest::new("measurements", [EntityRef::image(5)]);
    request.artifact = ArtifactLocation {
        local_path: Some(tmp.path().join("measurements")),
        remote_path: Some("/shared/tables/measurements".to_string()),
        prefix: "custom".to_string(),
    };
    let uploaded = upload_table(&session, &mut source, &request, &transport, &mut NoProgress).await?;
    assert_eq!(uploaded, Uploaded::Registered(EntityRef::file_annotation(900)));
    assert_eq!(service.stats().tables_opened, 0);

    let metadata = read_artifact_metadata(&tmp.path().join("measurements.parquet"))?;
    let posts = transport.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    let (url, headers, body) = &posts[0];
    assert!(url.starts_with("https://imaging.example.org/custom/table?bsession="));
    let secret = headers
        .iter()
        .find(|(k, _)| k == "X-SecretToken")
        .map(|(_, v)| v.clone());
    assert_eq!(secret.as_ref(), metadata.get(SECRET_TOKEN_KEY));
    assert_eq!(body["uri"], "/shared/tables/measurements.parquet");
    assert_eq!(body["targets"], serde_json::json!(["Image:5"]));
    Ok(())
}

#[tokio::test]
async fn rejected_token_request_surfaces_status() -> TestResult {
    let tmp = TempDir::new()?;
    let (_service, session, mut source) = setup()?;
    let transport = ScriptedTransport::new(403);

    let mut request = UploadRequest::new("measurements", [EntityRef::image(5)]);
    request.artifact.local_path = Some(tmp.path().join("rejected"));
    let err = upload_table(&session, &mut source, &request, &transport, &mut NoProgress)
        .await
        .unwrap_err();

    match err {
        PushError::Registration { source } => match *source {
            RegistrationError::RegistrationRejected { status, ref message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "login required");
            }
            other => panic!("unexpected registration error: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(transport.posts.lock().unwrap().is_empty());
    assert!(tmp.path().join("rejected.parquet").exists());
    Ok(())
}
