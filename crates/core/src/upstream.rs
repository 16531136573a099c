use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::job::MediaKind;

/// Raw status and body of an upstream call whose outcome is relayed to the client as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: String,
}

impl UpstreamReply {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamJobState {
    Pending,
    Completed,
    Failed,
}

/// Job status as reported by `GET /api/jobs/{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusDocument {
    pub state: UpstreamJobState,
    pub end_time: Option<String>,
    pub error_message: Option<String>,
}

impl JobStatusDocument {
    pub fn pending() -> Self {
        Self {
            state: UpstreamJobState::Pending,
            end_time: None,
            error_message: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            state: UpstreamJobState::Completed,
            ..Self::pending()
        }
    }

    pub fn failed(message: Option<&str>) -> Self {
        Self {
            state: UpstreamJobState::Failed,
            error_message: message.map(ToOwned::to_owned),
            ..Self::pending()
        }
    }

    /// Lenient parse: unknown or missing status strings count as still pending.
    pub fn from_value(value: &Value) -> Self {
        let status = value
            .get("status")
            .and_then(|status| match status {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("status_str").and_then(Value::as_str),
                _ => None,
            })
            .unwrap_or_default()
            .to_ascii_lowercase();

        let state = match status.as_str() {
            "completed" | "success" => UpstreamJobState::Completed,
            "failed" | "error" | "cancelled" | "interrupted" => UpstreamJobState::Failed,
            _ => UpstreamJobState::Pending,
        };

        let end_time = value
            .get("execution_end_time")
            .or_else(|| value.get("end_time"))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let error_message = value
            .get("execution_error")
            .and_then(|e| e.get("exception_message"))
            .or_else(|| value.get("error").and_then(|e| e.get("message")))
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .map(ToOwned::to_owned);

        Self {
            state,
            end_time,
            error_message,
        }
    }
}

/// A file written by the execution host, addressed the way `/view` expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutputs {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
}

/// Outputs of one prompt, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryDocument {
    pub outputs: BTreeMap<String, NodeOutputs>,
}

impl HistoryDocument {
    /// `GET /history/{id}` answers `{ "<id>": { "outputs": { ... } } }`; an empty
    /// object means the host does not know the prompt (yet).
    pub fn from_response(prompt_id: &str, value: &Value) -> Result<Self> {
        let Some(entry) = value.get(prompt_id) else {
            return Ok(Self::default());
        };
        let outputs = match entry.get("outputs") {
            Some(outputs) => serde_json::from_value(outputs.clone())
                .context("failed to parse history outputs")?,
            None => BTreeMap::new(),
        };
        Ok(Self { outputs })
    }

    /// Saved files of the requested kind, in node-id order.
    pub fn files(&self, kind: MediaKind) -> Vec<&OutputFile> {
        let extension = format!(".{}", kind.extension());
        let mut files = Vec::new();
        for node in self.outputs.values() {
            match kind {
                MediaKind::Image => files.extend(node.images.iter()),
                MediaKind::Video => {
                    files.extend(node.videos.iter());
                    files.extend(node.gifs.iter());
                }
            }
        }
        files.retain(|file| {
            file.kind == "output" && file.filename.to_ascii_lowercase().ends_with(&extension)
        });
        files
    }
}

/// The node-graph execution host this server submits jobs to.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn submit(&self, workflow: &Value, client_id: &str, prompt_id: &str)
        -> Result<UpstreamReply>;

    async fn job_status(&self, prompt_id: &str) -> Result<JobStatusDocument>;

    async fn history(&self, prompt_id: &str) -> Result<HistoryDocument>;

    async fn fetch_output(&self, file: &OutputFile) -> Result<Vec<u8>>;

    async fn interrupt(&self, prompt_id: &str) -> Result<UpstreamReply>;

    async fn model_types(&self) -> Result<Vec<String>>;

    async fn models(&self, model_type: &str) -> Result<Vec<String>>;
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    prompt: &'a Value,
    client_id: &'a str,
    prompt_id: &'a str,
}

#[derive(Serialize)]
struct InterruptBody<'a> {
    prompt_id: &'a str,
}

/// `ExecutionHost` over the host's HTTP API.
#[derive(Debug)]
pub struct HttpExecutionHost {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpExecutionHost {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid upstream base URL")?;
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build URL for path: {path}"))
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach upstream host for {path}"))?;

        if !resp.status().is_success() {
            bail!("upstream {path} returned HTTP {}", resp.status().as_u16());
        }

        resp.json::<Value>()
            .await
            .with_context(|| format!("failed to parse upstream {path} response"))
    }

    async fn post_json<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<UpstreamReply> {
        let url = self.url(path)?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to reach upstream host for {path}"))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .with_context(|| format!("failed to read upstream {path} response"))?;
        Ok(UpstreamReply { status, body })
    }
}

#[async_trait]
impl ExecutionHost for HttpExecutionHost {
    async fn submit(
        &self,
        workflow: &Value,
        client_id: &str,
        prompt_id: &str,
    ) -> Result<UpstreamReply> {
        let body = SubmitBody {
            prompt: workflow,
            client_id,
            prompt_id,
        };
        self.post_json("/prompt", &body).await
    }

    async fn job_status(&self, prompt_id: &str) -> Result<JobStatusDocument> {
        let value = self.get_json(&format!("/api/jobs/{prompt_id}")).await?;
        Ok(JobStatusDocument::from_value(&value))
    }

    async fn history(&self, prompt_id: &str) -> Result<HistoryDocument> {
        let value = self.get_json(&format!("/history/{prompt_id}")).await?;
        HistoryDocument::from_response(prompt_id, &value)
    }

    async fn fetch_output(&self, file: &OutputFile) -> Result<Vec<u8>> {
        let mut url = self.url("/view")?;
        url.query_pairs_mut()
            .append_pair("filename", &file.filename)
            .append_pair("subfolder", &file.subfolder)
            .append_pair("type", &file.kind);

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to reach upstream host for /view")?;

        if !resp.status().is_success() {
            bail!(
                "upstream /view for {} returned HTTP {}",
                file.filename,
                resp.status().as_u16()
            );
        }

        let bytes = resp.bytes().await.context("failed to read /view body")?;
        Ok(bytes.to_vec())
    }

    async fn interrupt(&self, prompt_id: &str) -> Result<UpstreamReply> {
        self.post_json("/interrupt", &InterruptBody { prompt_id }).await
    }

    async fn model_types(&self) -> Result<Vec<String>> {
        let value = self.get_json("/models").await?;
        serde_json::from_value(value).context("failed to parse /models response")
    }

    async fn models(&self, model_type: &str) -> Result<Vec<String>> {
        let value = self.get_json(&format!("/models/{model_type}")).await?;
        serde_json::from_value(value).context("failed to parse model list response")
    }
}
