//! Out-of-band registration of large tables.
//!
//! Instead of streaming a table cell by cell, the caller writes it as a
//! Parquet artifact on a filesystem the server can also read, then asks the
//! server to register it:
//!
//! 1. generate a random [`RegistrationToken`] and embed it in the artifact's
//!    key/value metadata while writing it,
//! 2. `GET <base>/token` for an anti-forgery token and its cookies,
//! 3. `POST <base>/table?bsession=<session id>` carrying the secret, the
//!    server-visible path, the table name and the link targets.
//!
//! The server only accepts the artifact if the secret in the request matches
//! the one in the file, proving the caller wrote it.

mod artifact;
mod error;
mod transport;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use log::{debug, info};
use rand::{RngCore, rngs::OsRng};
use serde::Deserialize;
use snafu::prelude::*;

pub use artifact::{
    ARTIFACT_VERSION, ArtifactWriter, DEFAULT_ARTIFACT_CHUNK_ROWS, INITIALIZED_KEY,
    ParquetArtifactWriter, SECRET_TOKEN_KEY, VERSION_KEY, read_artifact_metadata,
};
pub use error::{RegistrationError, RegistrationResult};
pub use transport::{HttpReply, RegistrationTransport, ReqwestTransport};

use crate::{
    entity::EntityRef,
    progress::ProgressSink,
    push::TableSource,
    session::Session,
    storage,
};
use error::{
    ArtifactAlreadyExistsSnafu, ArtifactStorageSnafu, ConfigurationSnafu, MalformedResponseSnafu,
    RegistrationRejectedSnafu, SessionSnafu,
};

/// File extension of registration artifacts.
pub const ARTIFACT_EXTENSION: &str = "parquet";

/// Secret proving who wrote an artifact.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    /// 256 random bits from the operating system, URL-safe base64 encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Encoded secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegistrationToken(<redacted>)")
    }
}

/// Where an artifact is written and how the server sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactLocation {
    /// Path to write locally.
    pub local_path: Option<PathBuf>,
    /// The same location as seen by the server, if it differs.
    pub remote_path: Option<String>,
    /// API prefix of the server's web interface, e.g. `custom_omero`.
    pub prefix: String,
}

impl ArtifactLocation {
    /// True when either path is set.
    pub fn is_set(&self) -> bool {
        self.local_path.is_some() || self.remote_path.is_some()
    }

    /// Local write path and server-visible path, both with the artifact
    /// extension. The server path always uses `/` separators.
    pub fn resolve(&self) -> RegistrationResult<(PathBuf, String)> {
        let local = match (&self.local_path, &self.remote_path) {
            (Some(local), _) => local.clone(),
            (None, Some(remote)) => PathBuf::from(remote),
            (None, None) => {
                return ConfigurationSnafu {
                    message: "a local or remote artifact path is required",
                }
                .fail();
            }
        };
        let remote = match &self.remote_path {
            Some(remote) => PathBuf::from(remote),
            None => local.clone(),
        };
        let local = local.with_extension(ARTIFACT_EXTENSION);
        let remote = posix_path(&remote.with_extension(ARTIFACT_EXTENSION));
        Ok((local, remote))
    }
}

fn posix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// A table to write and register.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Name of the new table.
    pub table_name: String,
    /// Objects to link the table to.
    pub targets: Vec<EntityRef>,
    /// Artifact paths.
    pub location: ArtifactLocation,
}

/// `https://<server>[/<prefix>]`.
pub fn base_url(server: &str, prefix: &str) -> String {
    let server = server.trim_end_matches('/');
    let mut base = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{server}")
    };
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        base.push('/');
        base.push_str(prefix);
    }
    base
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    data: String,
}

#[derive(Debug, Deserialize)]
struct RegisteredReply {
    data: RegisteredData,
}

#[derive(Debug, Deserialize)]
struct RegisteredData {
    file_annotation: i64,
}

/// Anti-forgery token and the cookie header to send with it.
async fn fetch_csrf_token(
    transport: &dyn RegistrationTransport,
    base: &str,
) -> RegistrationResult<(String, String)> {
    let url = format!("{base}/token");
    let reply = transport.get(&url).await?;
    ensure!(
        reply.is_success(),
        RegistrationRejectedSnafu {
            status: reply.status,
            message: reply.failure_message(),
        }
    );
    let parsed: TokenReply = serde_json::from_slice(&reply.body)
        .ok()
        .context(MalformedResponseSnafu {
            url: &url,
            message: "expected {\"data\": <token>}",
        })?;
    Ok((parsed.data, reply.cookie_header()))
}

/// Write `source` as an artifact and register it with the server.
///
/// Returns the file annotation wrapping the registered table. The artifact is
/// left in place if registration fails after it was written.
pub async fn register_remote_artifact(
    request: &RegistrationRequest,
    session: &Session,
    source: &mut dyn TableSource,
    writer: &dyn ArtifactWriter,
    transport: &dyn RegistrationTransport,
    progress: &mut dyn ProgressSink,
) -> RegistrationResult<EntityRef> {
    ensure!(
        !request.table_name.trim().is_empty(),
        ConfigurationSnafu {
            message: "table name must not be empty",
        }
    );
    ensure!(
        !request.targets.is_empty(),
        ConfigurationSnafu {
            message: "no objects to link the table to",
        }
    );
    let (local_path, remote_path) = request.location.resolve()?;
    debug!("Remote path would be {remote_path}");
    match storage::ensure_absent(&local_path).await {
        Ok(()) => {}
        Err(e) if e.is_already_exists() => {
            return ArtifactAlreadyExistsSnafu {
                path: local_path.display().to_string(),
            }
            .fail();
        }
        Err(e) => return Err(e).context(ArtifactStorageSnafu),
    }

    let scope = session.enter().await.context(SessionSnafu)?;
    let client = scope.client().context(SessionSnafu)?;
    let server = session
        .server()
        .or_else(|| client.host())
        .context(ConfigurationSnafu {
            message: "the session has no known server address",
        })?;
    let session_id = client.session_id();

    let secret = RegistrationToken::generate();
    let initialized = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    let metadata = vec![
        (VERSION_KEY.to_string(), ARTIFACT_VERSION.to_string()),
        (INITIALIZED_KEY.to_string(), initialized.to_string()),
        (SECRET_TOKEN_KEY.to_string(), secret.as_str().to_string()),
    ];
    info!("Writing table artifact to {}", local_path.display());
    let rows = writer.write_artifact(source, &local_path, &metadata, progress)?;
    info!("Artifact saved ({rows} rows), registering with {server}");

    let base = base_url(&server, &request.location.prefix);
    let (csrf, cookies) = fetch_csrf_token(transport, &base).await?;

    let url = format!("{base}/table?bsession={session_id}");
    let headers = [
        ("X-SecretToken", secret.as_str().to_string()),
        ("X-CSRFToken", csrf),
        ("Cookie", cookies),
        ("Referer", base.clone()),
    ];
    let targets: Vec<String> = request.targets.iter().map(ToString::to_string).collect();
    let body = serde_json::json!({
        "uri": remote_path,
        "name": request.table_name,
        "targets": targets,
    });
    let reply = transport.post_json(&url, &headers, &body).await?;
    ensure!(
        reply.is_success(),
        RegistrationRejectedSnafu {
            status: reply.status,
            message: reply.failure_message(),
        }
    );
    let registered: RegisteredReply = serde_json::from_slice(&reply.body)
        .ok()
        .context(MalformedResponseSnafu {
            url: &url,
            message: "expected {\"data\": {\"file_annotation\": <id>}}",
        })?;

    let annotation = EntityRef::file_annotation(registered.data.file_annotation);
    info!("Registered table as {annotation}");
    Ok(annotation)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{HttpReply, RegistrationResult, RegistrationTransport};

    /// A request seen by [`RecordingTransport`].
    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub(crate) method: &'static str,
        pub(crate) url: String,
        pub(crate) headers: Vec<(String, String)>,
        pub(crate) body: Option<serde_json::Value>,
    }

    /// Transport answering with canned replies and recording every request.
    #[derive(Debug)]
    pub(crate) struct RecordingTransport {
        pub(crate) token_reply: HttpReply,
        pub(crate) post_reply: HttpReply,
        pub(crate) requests: Mutex<Vec<RecordedRequest>>,
    }

    pub(crate) fn json_reply(status: u16, body: serde_json::Value) -> HttpReply {
        HttpReply {
            status,
            set_cookies: vec!["csrftoken=tok123; Path=/".to_string()],
            body: Bytes::from(body.to_string()),
        }
    }

    impl RecordingTransport {
        pub(crate) fn new(token_reply: HttpReply, post_reply: HttpReply) -> Self {
            Self {
                token_reply,
                post_reply,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl RegistrationTransport for RecordingTransport {
        async fn get(&self, url: &str) -> RegistrationResult<HttpReply> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(RecordedRequest {
                    method: "GET",
                    url: url.to_string(),
                    headers: Vec::new(),
                    body: None,
                });
            }
            Ok(self.token_reply.clone())
        }

        async fn post_json(
            &self,
            url: &str,
            headers: &[(&str, String)],
            body: &serde_json::Value,
        ) -> RegistrationResult<HttpReply> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(RecordedRequest {
                    method: "POST",
                    url: url.to_string(),
                    headers: headers
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect(),
                    body: Some(body.clone()),
                });
            }
            Ok(self.post_reply.clone())
        }
    }
}
