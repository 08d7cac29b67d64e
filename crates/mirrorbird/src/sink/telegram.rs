//! Telegram sink over the Bot HTTP API.
//!
//! Deliberately thin: albums go out as `sendMediaGroup` multipart uploads
//! with `attach://` file parts, reports as `sendMessage`, and the health
//! probe is `getMe`. The HTTP transport is stateless, so `disconnect` has
//! nothing to tear down.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{chunk_caption, chunks, MediaGroup, MessageId, SinkClient, SinkError};
use crate::state::MediaType;

const API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Credentials for the archive channel.
///
/// `api_id` and `api_hash` compose the bot token (`<id>:<hash>`).
/// `string_session` belongs to the interactive user-session bootstrap flow
/// and is not consumed by the HTTP transport.
#[derive(Debug, Clone)]
pub struct SinkCredentials {
    pub api_id: i64,
    pub api_hash: String,
    pub string_session: Option<String>,
    /// Channel id (`-100…`) or `@name` of the archive channel.
    pub channel_id: String,
}

impl SinkCredentials {
    #[must_use]
    pub fn bot_token(&self) -> String {
        format!("{}:{}", self.api_id, self.api_hash)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    description: Option<String>,
}

impl ApiResponse {
    fn into_result(self, method: &str) -> Result<Value, SinkError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(SinkError::api(format!(
                "{method}: {}",
                self.description.unwrap_or_else(|| "unknown error".into())
            )))
        }
    }
}

/// Production [`SinkClient`] for a Telegram archive channel.
pub struct TelegramSink {
    http: reqwest::Client,
    credentials: SinkCredentials,
    api_base: String,
}

impl TelegramSink {
    pub fn new(credentials: SinkCredentials) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            credentials,
            api_base: API_BASE.to_string(),
        })
    }

    /// Point the client at a different API base. Used by tests.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.credentials.bot_token()
        )
    }

    /// Send one album chunk and return its message ids in order.
    async fn send_album_chunk(
        &self,
        group: &MediaGroup,
        part_index: usize,
        files: &[crate::download::LocalFile],
    ) -> Result<Vec<MessageId>, SinkError> {
        let caption = chunk_caption(group, part_index);

        let mut media_spec: Vec<Value> = Vec::with_capacity(files.len());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", self.credentials.channel_id.clone());
        for (index, file) in files.iter().enumerate() {
            let attach_name = format!("file{index}");
            let kind = match file.media_type {
                MediaType::Photo => "photo",
                // Albums accept photos and videos only; GIF media is mp4
                // already and goes out as video.
                MediaType::Video | MediaType::Gif => "video",
            };
            let mut item = serde_json::json!({
                "type": kind,
                "media": format!("attach://{attach_name}"),
            });
            if index == 0 {
                item["caption"] = Value::String(caption.clone());
            }
            media_spec.push(item);

            let bytes = tokio::fs::read(&file.path).await?;
            let file_name = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| attach_name.clone());
            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
            form = form.part(attach_name, part);
        }
        form = form.text("media", Value::Array(media_spec).to_string());

        let response: ApiResponse = self
            .http
            .post(self.method_url("sendMediaGroup"))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;
        let result = response.into_result("sendMediaGroup")?;

        let messages = result
            .as_array()
            .ok_or_else(|| SinkError::api("sendMediaGroup: result is not an array"))?;
        messages
            .iter()
            .map(|message| {
                message
                    .get("message_id")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| SinkError::api("sendMediaGroup: message without message_id"))
            })
            .collect()
    }
}

#[async_trait]
impl SinkClient for TelegramSink {
    async fn send_media_group(&self, group: &MediaGroup) -> Result<Vec<MessageId>, SinkError> {
        let mut message_ids = Vec::with_capacity(group.files.len());
        for (part_index, chunk) in chunks(&group.files).into_iter().enumerate() {
            let ids = self.send_album_chunk(group, part_index, chunk).await?;
            tracing::debug!(
                post_url = %group.post_url,
                part = part_index + 1,
                messages = ids.len(),
                "sent album chunk"
            );
            message_ids.extend(ids);
        }
        Ok(message_ids)
    }

    async fn send_text(&self, text: &str) -> Result<(), SinkError> {
        let response: ApiResponse = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": self.credentials.channel_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?
            .json()
            .await?;
        response.into_result("sendMessage").map(|_| ())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        let response: ApiResponse = self
            .http
            .get(self.method_url("getMe"))
            .send()
            .await?
            .json()
            .await?;
        response.into_result("getMe").map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
