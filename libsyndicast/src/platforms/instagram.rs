//! Instagram Graph API implementation
//!
//! Every post goes through media containers (see [`super::container`]).
//! Single media posts publish one container; carousels create and await a
//! container per item, then a composite `CAROUSEL` container. A failed item
//! aborts the attempt before the composite is created, so partial carousels
//! are never published.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::InstagramConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::container::{
    ContainerApi, ContainerRequest, ContainerStatus, MediaPipeline, PollPolicy,
};
use crate::platforms::graph;
use crate::platforms::{read_token_file, Capabilities, Platform, PostShape};
use crate::sanitizer::{truncate_plain, MarkupDialect};
use crate::types::{MediaKind, MediaRef, PlatformKind, PublishedPost};

const MAX_CAROUSEL_ITEMS: usize = 10;

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink: Option<String>,
}

pub struct InstagramPlatform {
    client: reqwest::Client,
    token: SecretString,
    account_id: String,
    api_base: String,
    poll: PollPolicy,
    caption_limit: usize,
}

impl InstagramPlatform {
    pub fn new(config: &InstagramConfig, token: SecretString, client: reqwest::Client) -> Result<Self> {
        if config.account_id.trim().is_empty() {
            return Err(
                PlatformError::NotConfigured("instagram.account_id is empty".to_string()).into(),
            );
        }

        Ok(Self {
            client,
            token,
            account_id: config.account_id.trim().to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            poll: PollPolicy {
                interval: Duration::from_millis(config.poll_interval_ms),
                max_attempts: config.poll_max_attempts,
            },
            caption_limit: config.caption_limit,
        })
    }

    pub fn from_config(config: &InstagramConfig, client: reqwest::Client) -> Result<Self> {
        let token = read_token_file(&config.token_file)?;
        Self::new(config, token, client)
    }

    async fn permalink(&self, media_id: &str) -> Option<String> {
        let request = self
            .client
            .get(format!("{}/{}", self.api_base, media_id))
            .query(&[("fields", "permalink"), ("access_token", self.token.expose_secret())]);

        match graph::send::<PermalinkResponse>(request, "permalink lookup").await {
            Ok(response) => response.permalink,
            Err(e) => {
                tracing::debug!(media_id = %media_id, error = %e, "Permalink lookup failed, using fallback");
                None
            }
        }
    }

    async fn publish_carousel(
        &self,
        items: &[MediaRef],
        caption: Option<String>,
    ) -> std::result::Result<PublishedPost, PlatformError> {
        let pipeline = MediaPipeline::new(self, self.poll);

        let mut children = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let child = media_request(item, None, true);
            let id = pipeline.prepare(&child).await.map_err(|e| {
                tracing::warn!(item = index, error = %e, "Carousel item failed, aborting carousel");
                e
            })?;
            children.push(id);
        }

        pipeline
            .run(&ContainerRequest::Carousel { children, caption })
            .await
    }
}

fn media_request(media: &MediaRef, caption: Option<String>, carousel_item: bool) -> ContainerRequest {
    match media.kind {
        MediaKind::Image => ContainerRequest::Image {
            url: media.url.clone(),
            caption,
            carousel_item,
        },
        MediaKind::Video => ContainerRequest::Video {
            url: media.url.clone(),
            caption,
            carousel_item,
        },
    }
}

/// Map a Graph API error object onto the error taxonomy
#[async_trait]
impl ContainerApi for InstagramPlatform {
    async fn create_container(
        &self,
        request: &ContainerRequest,
    ) -> std::result::Result<String, PlatformError> {
        let mut form: Vec<(&str, String)> = Vec::new();
        let caption = match request {
            ContainerRequest::Image {
                url,
                caption,
                carousel_item,
            } => {
                form.push(("image_url", url.clone()));
                if *carousel_item {
                    form.push(("is_carousel_item", "true".to_string()));
                }
                caption
            }
            ContainerRequest::Video {
                url,
                caption,
                carousel_item,
            } => {
                form.push(("video_url", url.clone()));
                if *carousel_item {
                    form.push(("media_type", "VIDEO".to_string()));
                    form.push(("is_carousel_item", "true".to_string()));
                } else {
                    form.push(("media_type", "REELS".to_string()));
                }
                caption
            }
            ContainerRequest::Carousel { children, caption } => {
                form.push(("media_type", "CAROUSEL".to_string()));
                form.push(("children", children.join(",")));
                caption
            }
        };
        if let Some(caption) = caption {
            form.push(("caption", caption.clone()));
        }
        form.push(("access_token", self.token.expose_secret().to_string()));

        let request = self
            .client
            .post(format!("{}/{}/media", self.api_base, self.account_id))
            .form(&form);
        let response: IdResponse = graph::send(request, "container create").await?;
        Ok(response.id)
    }

    async fn container_status(
        &self,
        container_id: &str,
    ) -> std::result::Result<ContainerStatus, PlatformError> {
        let request = self
            .client
            .get(format!("{}/{}", self.api_base, container_id))
            .query(&[("fields", "status_code"), ("access_token", self.token.expose_secret())]);
        let response: StatusResponse = graph::send(request, "container status").await?;

        Ok(match response.status_code.as_deref() {
            Some("FINISHED") | Some("PUBLISHED") => ContainerStatus::Ready,
            Some(code @ ("ERROR" | "EXPIRED")) => ContainerStatus::Failed(code.to_string()),
            _ => ContainerStatus::Pending,
        })
    }

    async fn publish_container(
        &self,
        container_id: &str,
    ) -> std::result::Result<PublishedPost, PlatformError> {
        let request = self
            .client
            .post(format!("{}/{}/media_publish", self.api_base, self.account_id))
            .form(&[
                ("creation_id", container_id),
                ("access_token", self.token.expose_secret()),
            ]);
        let response: IdResponse = graph::send(request, "media publish").await?;

        let post_url = match self.permalink(&response.id).await {
            Some(url) => url,
            None => format!("https://www.instagram.com/p/{}/", response.id),
        };
        Ok(PublishedPost {
            post_id: response.id,
            post_url,
        })
    }
}

#[async_trait]
impl Platform for InstagramPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Instagram
    }

    fn dialect(&self) -> &MarkupDialect {
        &MarkupDialect::PLAIN_TEXT
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_only: false,
            max_media: MAX_CAROUSEL_ITEMS,
        }
    }

    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost> {
        let shape = self.capabilities().shape(media)?;

        let caption = truncate_plain(payload, self.caption_limit);
        let caption = (!caption.is_empty()).then_some(caption);

        let post = match shape {
            PostShape::Single(item) => {
                MediaPipeline::new(self, self.poll)
                    .run(&media_request(item, caption, false))
                    .await?
            }
            PostShape::Carousel(items) => self.publish_carousel(items, caption).await?,
            PostShape::TextOnly => {
                return Err(PlatformError::Rejected("Instagram posts need media".to_string()).into())
            }
        };

        tracing::info!(platform = "instagram", post_url = %post.post_url, "Published to Instagram");
        Ok(post)
    }
}
