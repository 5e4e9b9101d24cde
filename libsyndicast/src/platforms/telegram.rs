//! Telegram Bot API implementation
//!
//! Posts go to a single channel or chat in HTML parse mode. Media posts
//! carry the text as caption when it fits the caption limit; longer text is
//! sent as a separate message right after the media. If that message fails
//! the error is final, since retrying would repeat the media.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::TelegramConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::{
    classify_status, map_reqwest_error, read_token_file, Capabilities, Platform, PostShape,
};
use crate::sanitizer::{plan_delivery, visible_len, DeliveryPlan, MarkupDialect};
use crate::types::{MediaKind, MediaRef, PlatformKind, PublishedPost};

/// `sendMediaGroup` accepts 2 to 10 items
const MAX_MEDIA_GROUP: usize = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Chat {
    username: Option<String>,
}

pub struct TelegramPlatform {
    client: reqwest::Client,
    token: SecretString,
    chat_id: String,
    api_base: String,
    caption_limit: usize,
    message_limit: usize,
}

impl TelegramPlatform {
    pub fn new(config: &TelegramConfig, token: SecretString, client: reqwest::Client) -> Result<Self> {
        if config.chat_id.trim().is_empty() {
            return Err(PlatformError::NotConfigured("telegram.chat_id is empty".to_string()).into());
        }

        Ok(Self {
            client,
            token,
            chat_id: config.chat_id.trim().to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            caption_limit: config.caption_limit,
            message_limit: config.message_limit,
        })
    }

    /// Create the adapter, reading the bot token from `token_file`
    pub fn from_config(config: &TelegramConfig, client: reqwest::Client) -> Result<Self> {
        let token = read_token_file(&config.token_file)?;
        Self::new(config, token, client)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> std::result::Result<T, PlatformError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.token.expose_secret(), method);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        let parsed: ApiResponse<T> = serde_json::from_str(&text).map_err(|_| {
            classify_status(
                status.as_u16(),
                format!("{} returned HTTP {} with an unreadable body", method, status),
            )
        })?;

        if parsed.ok {
            return parsed
                .result
                .ok_or_else(|| PlatformError::Rejected(format!("{} returned no result", method)));
        }

        let code = parsed.error_code.unwrap_or(status.as_u16());
        let mut message = format!(
            "{} failed ({}): {}",
            method,
            code,
            parsed.description.unwrap_or_else(|| "no description".to_string())
        );
        if let Some(retry_after) = parsed.parameters.and_then(|p| p.retry_after) {
            message.push_str(&format!(", retry after {}s", retry_after));
        }
        Err(classify_status(code, message))
    }

    async fn send_text(&self, text: &str) -> std::result::Result<Message, PlatformError> {
        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
            }),
        )
        .await
    }

    async fn send_media(
        &self,
        shape: PostShape<'_>,
        caption: Option<&str>,
    ) -> std::result::Result<Message, PlatformError> {
        match shape {
            PostShape::Single(media) => {
                let (method, field) = match media.kind {
                    MediaKind::Image => ("sendPhoto", "photo"),
                    MediaKind::Video => ("sendVideo", "video"),
                };
                let mut body = json!({ "chat_id": self.chat_id });
                body[field] = json!(media.url);
                if let Some(caption) = caption {
                    body["caption"] = json!(caption);
                    body["parse_mode"] = json!("HTML");
                }
                self.call(method, body).await
            }
            PostShape::Carousel(items) => {
                let media: Vec<Value> = items
                    .iter()
                    .enumerate()
                    .map(|(index, media)| {
                        let mut entry = json!({
                            "type": match media.kind {
                                MediaKind::Image => "photo",
                                MediaKind::Video => "video",
                            },
                            "media": media.url,
                        });
                        // The group caption is the first item's caption
                        if let (0, Some(caption)) = (index, caption) {
                            entry["caption"] = json!(caption);
                            entry["parse_mode"] = json!("HTML");
                        }
                        entry
                    })
                    .collect();

                let messages: Vec<Message> = self
                    .call(
                        "sendMediaGroup",
                        json!({
                            "chat_id": self.chat_id,
                            "media": media,
                        }),
                    )
                    .await?;
                messages
                    .into_iter()
                    .next()
                    .ok_or_else(|| PlatformError::Rejected("sendMediaGroup returned no messages".to_string()))
            }
            PostShape::TextOnly => Err(PlatformError::Rejected("no media to send".to_string())),
        }
    }

    fn published(&self, message: &Message) -> PublishedPost {
        PublishedPost {
            post_id: message.message_id.to_string(),
            post_url: post_url(&self.chat_id, message.chat.username.as_deref(), message.message_id),
        }
    }
}

#[async_trait]
impl Platform for TelegramPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Telegram
    }

    fn dialect(&self) -> &MarkupDialect {
        &MarkupDialect::TELEGRAM_HTML
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_only: true,
            max_media: MAX_MEDIA_GROUP,
        }
    }

    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost> {
        let shape = self.capabilities().shape(media)?;
        let has_media = shape != PostShape::TextOnly;

        if visible_len(payload) > self.message_limit {
            return Err(PlatformError::Rejected(format!(
                "text is {} characters, Telegram allows {}",
                visible_len(payload),
                self.message_limit
            ))
            .into());
        }
        if !has_media && payload.trim().is_empty() {
            return Err(PlatformError::Rejected("nothing to publish".to_string()).into());
        }

        let message = match plan_delivery(payload, has_media, self.caption_limit) {
            DeliveryPlan::TextOnly { text } => self.send_text(&text).await?,
            DeliveryPlan::Captioned { caption } => {
                let caption = (!caption.is_empty()).then_some(caption.as_str());
                self.send_media(shape, caption).await?
            }
            DeliveryPlan::MediaThenText { text } => {
                tracing::debug!(
                    chat_id = %self.chat_id,
                    limit = self.caption_limit,
                    "Text exceeds caption limit, sending media and text separately"
                );
                let first = self.send_media(shape, None).await?;
                if let Err(e) = self.send_text(&text).await {
                    // The media is already live, so a retry would post it twice
                    let post = self.published(&first);
                    return Err(PlatformError::Rejected(format!(
                        "media published at {} but the text message failed: {}",
                        post.post_url, e
                    ))
                    .into());
                }
                first
            }
        };

        let post = self.published(&message);
        tracing::info!(platform = "telegram", post_url = %post.post_url, "Published to Telegram");
        Ok(post)
    }
}

/// Public link to a message
///
/// Public channels link by username; private chats use the `t.me/c/` form
/// with the `-100` channel prefix removed.
pub fn post_url(chat_id: &str, username: Option<&str>, message_id: i64) -> String {
    if let Some(username) = username.filter(|u| !u.is_empty()) {
        return format!("https://t.me/{}/{}", username, message_id);
    }
    if let Some(username) = chat_id.strip_prefix('@') {
        return format!("https://t.me/{}/{}", username, message_id);
    }

    let internal = chat_id
        .strip_prefix("-100")
        .or_else(|| chat_id.strip_prefix('-'))
        .unwrap_or(chat_id);
    format!("https://t.me/c/{}/{}", internal, message_id)
}
