//! In-flight job registry: idempotent enqueue, status mapping and one-time
//! relocation of finished artifacts.
//!
//! Each fingerprint moves through `Submitting -> InFlight -> Resolving` and is
//! removed once its primary artifact lands in the output area, or when the job is
//! interrupted. Transitions go through the map's per-key entry API and no map guard
//! is held across an upstream call, so two callers can never submit or relocate the
//! same job twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{Local, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::UpstreamConfig;
use crate::fingerprint::Fingerprint;
use crate::job::{
    ClientStatus, EnqueueResponse, InterruptResponse, MediaKind, QueueRequest, StatusResponse,
};
use crate::locator::{LocatedOutput, OutputLocator};
use crate::relocate::{
    artifact_name, relocate_file, relocate_last_frame, remove_first_frame, write_artifact,
};
use crate::upstream::{ExecutionHost, OutputFile, UpstreamJobState};
use crate::workflow::{TemplateOverrides, WorkflowCatalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Reserved while the submit call is outstanding.
    Submitting,
    InFlight,
    /// Reserved while outputs are being relocated.
    Resolving,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    request: QueueRequest,
    phase: EntryPhase,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub client_id: String,
    pub upstream: UpstreamConfig,
    pub release_failed_jobs: bool,
}

pub struct JobRegistry {
    host: Arc<dyn ExecutionHost>,
    catalog: WorkflowCatalog,
    locator: OutputLocator,
    options: RegistryOptions,
    entries: DashMap<Fingerprint, RegistryEntry>,
}

impl JobRegistry {
    pub fn new(
        host: Arc<dyn ExecutionHost>,
        catalog: WorkflowCatalog,
        locator: OutputLocator,
        options: RegistryOptions,
    ) -> Self {
        Self {
            host,
            catalog,
            locator,
            options,
            entries: DashMap::new(),
        }
    }

    pub fn host(&self) -> &Arc<dyn ExecutionHost> {
        &self.host
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn locator(&self) -> &OutputLocator {
        &self.locator
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    pub fn contains(&self, prompt_id: &Fingerprint) -> bool {
        self.entries.contains_key(prompt_id)
    }

    pub fn phase(&self, prompt_id: &Fingerprint) -> Option<EntryPhase> {
        self.entries.get(prompt_id).map(|entry| entry.phase)
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries.len()
    }

    /// Finished artifact for a prompt id, searched on disk only.
    pub async fn locate(&self, prompt_id: &Fingerprint) -> Option<LocatedOutput> {
        self.locator.find(&prompt_id.request_id()).await
    }

    pub async fn enqueue(&self, request: QueueRequest) -> Result<EnqueueResponse> {
        let prompt_id = Fingerprint::of(&request);

        if let Some(found) = self.locate(&prompt_id).await {
            debug!(prompt_id = %prompt_id, file = %found.primary_name(), "Artifact already on disk");
            return Ok(enqueue_response(
                &prompt_id,
                request,
                StatusCode::OK.as_u16(),
                "file already exists".to_string(),
                Some(true),
            ));
        }

        match self.entries.entry(prompt_id.clone()) {
            Entry::Occupied(_) => {
                info!(prompt_id = %prompt_id, "Duplicate request while job is in flight");
                return Ok(enqueue_response(
                    &prompt_id,
                    request,
                    StatusCode::CONFLICT.as_u16(),
                    "request already in progress".to_string(),
                    None,
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    request: request.clone(),
                    phase: EntryPhase::Submitting,
                });
            }
        }

        let outcome = self.submit_reserved(&prompt_id, &request).await;
        let submitted = matches!(&outcome, Ok((code, _)) if *code == StatusCode::OK.as_u16());
        if submitted {
            if let Some(mut entry) = self.entries.get_mut(&prompt_id) {
                entry.phase = EntryPhase::InFlight;
            }
            info!(prompt_id = %prompt_id, workflow = %request.workflow, "Job submitted");
        } else {
            self.entries
                .remove_if(&prompt_id, |_, entry| entry.phase == EntryPhase::Submitting);
        }

        let (code, message) = outcome?;
        Ok(enqueue_response(&prompt_id, request, code, message, None))
    }

    async fn submit_reserved(
        &self,
        prompt_id: &Fingerprint,
        request: &QueueRequest,
    ) -> Result<(u16, String)> {
        let Some(kind) = self.catalog.lookup(&request.workflow) else {
            warn!(prompt_id = %prompt_id, workflow = %request.workflow, "Unknown workflow requested");
            return Ok((
                StatusCode::NOT_FOUND.as_u16(),
                format!("workflow '{}' not found", request.workflow),
            ));
        };

        let Some(workflow) = self.catalog.resolve(kind, &TemplateOverrides::from(request)) else {
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                format!("failed to prepare workflow '{}'", request.workflow),
            ));
        };

        let reply = self
            .host
            .submit(&workflow, &self.options.client_id, prompt_id.as_str())
            .await?;
        if reply.is_ok() {
            Ok((reply.status, "queued".to_string()))
        } else {
            warn!(prompt_id = %prompt_id, status = reply.status, "Upstream rejected submission");
            Ok((reply.status, reply.body))
        }
    }

    pub async fn status(&self, prompt_id: &Fingerprint) -> Result<StatusResponse> {
        let request = match self.entries.get(prompt_id) {
            None => return Ok(self.disk_status(prompt_id).await),
            Some(entry) if entry.phase != EntryPhase::InFlight => {
                return Ok(still_processing(prompt_id));
            }
            Some(entry) => entry.request.clone(),
        };

        let document = self.host.job_status(prompt_id.as_str()).await?;
        match document.state {
            UpstreamJobState::Pending => Ok(StatusResponse {
                end_time: document.end_time,
                ..StatusResponse::new(
                    prompt_id.as_str(),
                    StatusCode::ACCEPTED,
                    ClientStatus::Processing,
                    "processing",
                )
            }),
            UpstreamJobState::Failed => {
                let message = document
                    .error_message
                    .unwrap_or_else(|| "generation failed".to_string());
                if self.options.release_failed_jobs {
                    // Only the entry this poll observed; a fresh reservation may have replaced it.
                    if self
                        .entries
                        .remove_if(prompt_id, |_, entry| entry.phase == EntryPhase::InFlight)
                        .is_some()
                    {
                        info!(prompt_id = %prompt_id, "Released failed job");
                    }
                } else {
                    warn!(prompt_id = %prompt_id, error = %message, "Upstream job failed");
                }
                Ok(StatusResponse::new(
                    prompt_id.as_str(),
                    StatusCode::EXPECTATION_FAILED,
                    ClientStatus::Failed,
                    message,
                ))
            }
            UpstreamJobState::Completed => self.resolve(prompt_id, &request).await,
        }
    }

    async fn resolve(&self, prompt_id: &Fingerprint, request: &QueueRequest) -> Result<StatusResponse> {
        match self.entries.get_mut(prompt_id) {
            None => return Ok(self.disk_status(prompt_id).await),
            Some(mut entry) => {
                if entry.phase != EntryPhase::InFlight {
                    return Ok(still_processing(prompt_id));
                }
                entry.phase = EntryPhase::Resolving;
            }
        }

        let kind = request.media_kind();
        let outcome = self.relocate_outputs(prompt_id, request, kind).await;
        match outcome {
            Ok(Some(filename)) => {
                self.entries
                    .remove_if(prompt_id, |_, entry| entry.phase == EntryPhase::Resolving);
                info!(prompt_id = %prompt_id, file = %filename, "Job completed");
                Ok(StatusResponse::completed(prompt_id.as_str(), kind, filename))
            }
            Ok(None) => {
                self.revert_resolving(prompt_id);
                Ok(still_processing(prompt_id))
            }
            Err(err) => {
                self.revert_resolving(prompt_id);
                Err(err)
            }
        }
    }

    fn revert_resolving(&self, prompt_id: &Fingerprint) {
        if let Some(mut entry) = self.entries.get_mut(prompt_id) {
            if entry.phase == EntryPhase::Resolving {
                entry.phase = EntryPhase::InFlight;
            }
        }
    }

    /// Returns the primary artifact's new file name once it exists on disk.
    async fn relocate_outputs(
        &self,
        prompt_id: &Fingerprint,
        request: &QueueRequest,
        kind: MediaKind,
    ) -> Result<Option<String>> {
        let history = self.host.history(prompt_id.as_str()).await?;
        let files = history.files(kind);
        if files.is_empty() {
            debug!(prompt_id = %prompt_id, "No outputs recorded yet");
            return Ok(None);
        }

        let request_id = prompt_id.request_id();
        let dest_dir = self.locator.today_dir();
        let now = Local::now();
        let mut primary: Option<PathBuf> = None;

        for (sequence, file) in files.into_iter().enumerate() {
            if let Some(existing) = self.locator.find_sequence(&request_id, sequence, kind).await {
                debug!(prompt_id = %prompt_id, file = %existing.display(), "Output already relocated");
                primary.get_or_insert(existing);
                continue;
            }
            let dest = dest_dir.join(artifact_name(now, request.seed, &request_id, sequence, kind));
            if let Err(err) = self.relocate_one(file, &dest, kind).await {
                warn!(prompt_id = %prompt_id, file = %file.filename, error = %format!("{err:#}"), "Failed to relocate output");
            }
            primary.get_or_insert(dest);
        }

        let Some(primary) = primary else {
            return Ok(None);
        };
        if !fs::try_exists(&primary).await.unwrap_or(false) {
            return Ok(None);
        }
        Ok(primary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()))
    }

    async fn relocate_one(&self, file: &OutputFile, dest: &Path, kind: MediaKind) -> Result<()> {
        let src = self
            .options
            .upstream
            .folder_for(&file.kind)
            .join(&file.subfolder)
            .join(&file.filename);

        if fs::try_exists(&src).await.unwrap_or(false) {
            relocate_file(&src, dest).await?;
        } else {
            debug!(file = %file.filename, "Output not on shared filesystem, fetching from host");
            let bytes = self.host.fetch_output(file).await?;
            write_artifact(dest, &bytes).await?;
        }

        if kind == MediaKind::Video {
            if let Err(err) = relocate_last_frame(&src, dest).await {
                warn!(file = %file.filename, error = %format!("{err:#}"), "Failed to relocate last frame");
            }
            if let Err(err) = remove_first_frame(&src).await {
                warn!(file = %file.filename, error = %format!("{err:#}"), "Failed to remove first frame");
            }
        }
        Ok(())
    }

    async fn disk_status(&self, prompt_id: &Fingerprint) -> StatusResponse {
        match self.locate(prompt_id).await {
            Some(found) => {
                let filename = found.primary_name();
                StatusResponse::completed(prompt_id.as_str(), found.kind, filename)
            }
            None => StatusResponse::new(
                prompt_id.as_str(),
                StatusCode::NOT_FOUND,
                ClientStatus::NotFound,
                "not found",
            ),
        }
    }

    pub async fn interrupt(&self, prompt_id: &Fingerprint) -> Result<InterruptResponse> {
        let reply = self.host.interrupt(prompt_id.as_str()).await?;
        let message = if reply.is_ok() {
            // A reservation still submitting belongs to its enqueue call, which settles it.
            let removed = self
                .entries
                .remove_if(prompt_id, |_, entry| entry.phase != EntryPhase::Submitting);
            if removed.is_some() {
                info!(prompt_id = %prompt_id, "Job interrupted");
            } else if self.contains(prompt_id) {
                warn!(prompt_id = %prompt_id, "Interrupted while submitting, keeping reservation");
            }
            "interrupted".to_string()
        } else {
            warn!(prompt_id = %prompt_id, status = reply.status, "Upstream rejected interrupt");
            reply.body
        };

        Ok(InterruptResponse {
            prompt_id: prompt_id.to_string(),
            code: reply.status,
            message,
            utc_timestamp: Utc::now(),
        })
    }
}

fn still_processing(prompt_id: &Fingerprint) -> StatusResponse {
    StatusResponse::new(
        prompt_id.as_str(),
        StatusCode::NO_CONTENT,
        ClientStatus::Processing,
        "processing",
    )
}

fn enqueue_response(
    prompt_id: &Fingerprint,
    parameters: QueueRequest,
    code: u16,
    message: String,
    file_exists: Option<bool>,
) -> EnqueueResponse {
    EnqueueResponse {
        prompt_id: prompt_id.to_string(),
        code,
        message,
        parameters,
        utc_timestamp: Utc::now(),
        file_exists,
    }
}
