use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameters of one generation job, as posted by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub workflow: String,
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default, alias = "img_width")]
    pub width: Option<u32>,
    #[serde(default, alias = "img_height")]
    pub height: Option<u32>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub upscale_factor: Option<f64>,
    #[serde(default, alias = "steps")]
    pub step: Option<u32>,
    #[serde(default)]
    pub cfg: Option<f64>,
    #[serde(default)]
    pub seconds: Option<u32>,
}

impl QueueRequest {
    /// Video and image results are mutually exclusive; a nonzero duration selects video.
    pub fn media_kind(&self) -> MediaKind {
        if self.seconds.unwrap_or(0) > 0 {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn mime(self) -> &'static str {
        match self {
            Self::Image => "image/png",
            Self::Video => "video/mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
        }
    }
}

/// Coarse status string relayed alongside the numeric `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Processing,
    Completed,
    Failed,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResponse {
    pub prompt_id: String,
    pub code: u16,
    pub message: String,
    pub parameters: QueueRequest,
    pub utc_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_exists: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub prompt_id: String,
    pub code: u16,
    pub message: String,
    pub status: ClientStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub utc_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterruptResponse {
    pub prompt_id: String,
    pub code: u16,
    pub message: String,
    pub utc_timestamp: DateTime<Utc>,
}

impl StatusResponse {
    pub fn new(prompt_id: &str, code: StatusCode, status: ClientStatus, message: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.to_string(),
            code: code.as_u16(),
            message: message.into(),
            status,
            media_type: None,
            filename: None,
            end_time: None,
            utc_timestamp: Utc::now(),
        }
    }

    pub fn completed(prompt_id: &str, kind: MediaKind, filename: String) -> Self {
        Self {
            media_type: Some(kind.mime().to_string()),
            filename: Some(filename),
            ..Self::new(prompt_id, StatusCode::OK, ClientStatus::Completed, "completed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_request_with_aliases() {
        let request: QueueRequest = serde_json::from_value(serde_json::json!({
            "workflow": "t2i",
            "prompt": "a cat",
            "img_width": 640,
            "img_height": 480,
            "steps": 12
        }))
        .expect("deserialize request");

        assert_eq!(request.width, Some(640));
        assert_eq!(request.height, Some(480));
        assert_eq!(request.step, Some(12));
        assert_eq!(request.seed, None);
        assert_eq!(request.media_kind(), MediaKind::Image);
    }

    #[test]
    fn nonzero_seconds_selects_video() {
        let zero = QueueRequest { seconds: Some(0), ..QueueRequest::default() };
        let three = QueueRequest { seconds: Some(3), ..QueueRequest::default() };
        assert_eq!(zero.media_kind(), MediaKind::Image);
        assert_eq!(three.media_kind(), MediaKind::Video);
        assert_eq!(three.media_kind().mime(), "video/mp4");
    }

    #[test]
    fn status_response_omits_absent_fields() {
        let response = StatusResponse::new(
            "abc",
            StatusCode::NOT_FOUND,
            ClientStatus::NotFound,
            "not found",
        );
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["code"], 404);
        assert_eq!(value["status"], "not_found");
        assert!(value.get("filename").is_none());
        assert!(value.get("media_type").is_none());
    }
}
