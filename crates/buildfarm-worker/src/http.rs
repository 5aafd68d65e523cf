//! HTTP/JSON worker proxy.

use async_trait::async_trait;
use buildfarm_core::filemap::FileLocator;
use buildfarm_core::worker::*;
use buildfarm_core::{BuildCookie, Error, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct EnsurePresentResponse {
    present: bool,
}

/// Talks to a worker over HTTP with JSON bodies.
pub struct HttpWorkerProxy {
    info: WorkerInfo,
    base: Url,
    client: reqwest::Client,
}

impl HttpWorkerProxy {
    pub fn new(info: WorkerInfo) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_client(info, client)
    }

    /// Create with a custom HTTP client.
    pub fn with_client(info: WorkerInfo, client: reqwest::Client) -> Result<Self> {
        let base = Url::parse(&info.url)
            .map_err(|e| Error::Internal(format!("Invalid worker URL {}: {}", info.url, e)))?;
        Ok(Self { info, base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Internal(format!("Invalid worker endpoint {}: {}", path, e)))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        self.client
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport)
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::Transport(e.to_string())
}

/// Body of an ensure-present call. Credentials go out in cleartext here
/// and nowhere else.
fn ensure_present_body(locator: &FileLocator) -> Value {
    let mut body = json!({
        "url": locator.url,
        "sha256": locator.sha256,
    });
    if let Some(creds) = &locator.credentials {
        body["username"] = json!(creds.username);
        body["password"] = json!(creds.password.expose());
    }
    body
}

/// Body of a start-build call.
fn build_body(request: &BuildRequest) -> Value {
    json!({
        "cookie": request.cookie.as_str(),
        "builder_type": request.kind,
        "image_type": request.image_type.to_string(),
        "image_sha256": request.base_image.sha256,
        "pocket": request.pocket.to_string(),
        "filemap": request.filemap(),
        "args": request.args.to_wire(),
    })
}

#[async_trait]
impl WorkerProxy for HttpWorkerProxy {
    fn info(&self) -> &WorkerInfo {
        &self.info
    }

    async fn ensure_present(&self, locator: &FileLocator) -> Result<bool> {
        let response: EnsurePresentResponse = self
            .post_json("ensure-present", &ensure_present_body(locator))
            .await?
            .json()
            .await
            .map_err(transport)?;
        Ok(response.present)
    }

    async fn start_build(&self, request: &BuildRequest) -> Result<StartBuildResponse> {
        self.post_json("build", &build_body(request))
            .await?
            .json()
            .await
            .map_err(transport)
    }

    async fn get_status(&self, cookie: &BuildCookie) -> Result<WorkerStatus> {
        self.client
            .get(self.endpoint(&format!("status/{}", cookie))?)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)
    }

    async fn get_file(&self, key: &str, destination: &Path) -> Result<()> {
        debug!(worker = %self.info.name, key = %key, dest = %destination.display(), "Fetching file");
        let data = self
            .client
            .get(self.endpoint(&format!("files/{}", key))?)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(transport)?
            .bytes()
            .await
            .map_err(transport)?;
        tokio::fs::write(destination, &data).await?;
        Ok(())
    }

    async fn abort(&self, cookie: &BuildCookie) -> Result<()> {
        self.post_json(&format!("abort/{}", cookie), &json!({})).await?;
        Ok(())
    }

    async fn clean(&self, cookie: &BuildCookie) -> Result<()> {
        self.post_json(&format!("clean/{}", cookie), &json!({})).await?;
        Ok(())
    }
}
