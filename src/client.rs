//! HTTP client for the receiver's API.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fn_error_context::context;
use reqwest::header;
use reqwest::multipart::{Form, Part};

use crate::api::{
    format_checksum_part, InfoResponse, ObjectName, ObjectsResponse, QueueRequest, QueueResponse,
    RevisionPair,
};
use crate::push::ObjectSource;

/// Closures can be very large; give slow links plenty of room.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A connection to one receiver, carrying the bearer token.
#[derive(Clone, Debug)]
pub struct Client {
    base: reqwest::Url,
    http: reqwest::Client,
    token: String,
}

impl Client {
    #[context("Creating client for {address}")]
    pub fn new(address: &str, token: &str) -> Result<Self> {
        let base = reqwest::Url::parse(address)?;
        let http = reqwest::Client::builder()
            .user_agent("ostree-publish")
            .timeout(CLIENT_TIMEOUT)
            .build()?;
        Ok(Self {
            base,
            http,
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url> {
        self.base
            .join(path)
            .with_context(|| format!("Resolving {path}"))
    }

    /// Send a request with auth headers attached, turning any non-success
    /// status into an error carrying the server's message.
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let resp = req
            .header(header::AUTHORIZATION, format!("BEARER {}", self.token))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Server returned {status}: {}", body.trim_end());
        }
        Ok(resp)
    }

    /// Phase 1: repository mode and current refs.
    #[context("Retrieving repository information")]
    pub async fn info(&self) -> Result<InfoResponse> {
        let resp = self.execute(self.http.get(self.url("api/v1/info")?)).await?;
        Ok(resp.json().await?)
    }

    /// Phase 2: open a publish transaction.
    #[context("Creating queue entry")]
    pub async fn create_queue(
        &self,
        update_refs: &BTreeMap<String, RevisionPair>,
        objects: Vec<ObjectName>,
    ) -> Result<String> {
        let body = QueueRequest {
            refs: update_refs.clone(),
            objects,
        };
        let req = self.http.post(self.url("api/v1/queue")?).json(&body);
        let resp: QueueResponse = self.execute(req).await?.json().await?;
        Ok(resp.id)
    }

    /// Phase 3a: which objects the server still needs.
    #[context("Retrieving missing objects")]
    pub async fn missing_objects(&self, id: &str) -> Result<Vec<ObjectName>> {
        let req = self.http.get(self.url(&format!("api/v1/queue/{id}"))?);
        let resp: ObjectsResponse = self.execute(req).await?.json().await?;
        Ok(resp.objects)
    }

    /// Phase 3b: stream a batch of objects. Each object contributes a `file`
    /// part followed by a `checksum` part the server verifies after storing.
    #[context("Uploading objects")]
    pub async fn upload(&self, id: &str, batch: &[(&ObjectName, &ObjectSource)]) -> Result<()> {
        let mut form = Form::new();
        for (name, source) in batch {
            tracing::debug!("Sending {name}");
            let file = tokio::fs::File::open(&source.path)
                .await
                .with_context(|| format!("Opening {}", source.path))?;
            let stream = tokio_util::io::ReaderStream::new(file);
            let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), source.size)
                .file_name(name.to_string());
            form = form
                .part("file", part)
                .text("checksum", format_checksum_part(name, &source.checksum));
        }
        let req = self
            .http
            .put(self.url(&format!("api/v1/queue/{id}"))?)
            .multipart(form);
        self.execute(req).await?;
        Ok(())
    }

    /// Phase 4: promote staged objects and advance refs.
    #[context("Finalizing publish")]
    pub async fn done(&self, id: &str) -> Result<()> {
        self.execute(self.http.get(self.url(&format!("api/v1/done/{id}"))?))
            .await?;
        Ok(())
    }

    /// Abort: drop the queue entry (staged files are left for the operator).
    #[context("Deleting queue entry")]
    pub async fn delete_queue(&self, id: &str) -> Result<()> {
        self.execute(self.http.delete(self.url(&format!("api/v1/queue/{id}"))?))
            .await?;
        Ok(())
    }
}
