//! Facebook Page posting through the Graph API
//!
//! Text goes to the page feed. A single image is posted through
//! `/{page}/photos` with the text as caption; several images are uploaded
//! unpublished first and attached to one feed post. Video posts carry the
//! first video only.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::config::FacebookConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::graph;
use crate::platforms::{read_token_file, Capabilities, Platform, PostShape};
use crate::sanitizer::MarkupDialect;
use crate::types::{MediaKind, MediaRef, PlatformKind, PublishedPost};

/// Photos attached to one multi-photo post
const MAX_PHOTOS: usize = 10;

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
    /// Set by `/photos` when the photo becomes a feed post
    post_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink_url: Option<String>,
}

pub struct FacebookPlatform {
    client: reqwest::Client,
    token: SecretString,
    page_id: String,
    api_base: String,
}

impl FacebookPlatform {
    pub fn new(config: &FacebookConfig, token: SecretString, client: reqwest::Client) -> Result<Self> {
        if config.page_id.trim().is_empty() {
            return Err(PlatformError::NotConfigured("facebook.page_id is empty".to_string()).into());
        }

        Ok(Self {
            client,
            token,
            page_id: config.page_id.trim().to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Create the adapter, reading the page access token from `token_file`
    pub fn from_config(config: &FacebookConfig, client: reqwest::Client) -> Result<Self> {
        let token = read_token_file(&config.token_file)?;
        Self::new(config, token, client)
    }

    async fn create(
        &self,
        edge: &str,
        mut form: Vec<(&str, String)>,
    ) -> std::result::Result<CreatedResponse, PlatformError> {
        form.push(("access_token", self.token.expose_secret().to_string()));
        let request = self
            .client
            .post(format!("{}/{}/{}", self.api_base, self.page_id, edge))
            .form(&form);
        graph::send(request, edge).await
    }

    async fn permalink(&self, post_id: &str) -> String {
        let request = self
            .client
            .get(format!("{}/{}", self.api_base, post_id))
            .query(&[("fields", "permalink_url"), ("access_token", self.token.expose_secret())]);

        match graph::send::<PermalinkResponse>(request, "permalink lookup").await {
            Ok(PermalinkResponse {
                permalink_url: Some(url),
            }) => url,
            Ok(_) => fallback_url(&self.page_id, post_id),
            Err(e) => {
                tracing::debug!(post_id = %post_id, error = %e, "Permalink lookup failed, using fallback");
                fallback_url(&self.page_id, post_id)
            }
        }
    }

    async fn post_text(&self, text: &str) -> std::result::Result<String, PlatformError> {
        let created = self.create("feed", vec![("message", text.to_string())]).await?;
        Ok(created.id)
    }

    async fn post_photo(&self, photo: &MediaRef, text: &str) -> std::result::Result<String, PlatformError> {
        let mut form = vec![("url", photo.url.clone()), ("published", "true".to_string())];
        if !text.is_empty() {
            form.push(("caption", text.to_string()));
        }
        let created = self.create("photos", form).await?;
        Ok(created.post_id.unwrap_or(created.id))
    }

    async fn post_photos(&self, photos: &[&MediaRef], text: &str) -> std::result::Result<String, PlatformError> {
        // Unpublished photos stay off the page until the feed post attaches them
        let mut media_ids = Vec::with_capacity(photos.len());
        for photo in photos {
            let created = self
                .create(
                    "photos",
                    vec![("url", photo.url.clone()), ("published", "false".to_string())],
                )
                .await?;
            media_ids.push(created.id);
        }

        let keys: Vec<String> = (0..media_ids.len())
            .map(|i| format!("attached_media[{}]", i))
            .collect();
        let mut form: Vec<(&str, String)> = keys
            .iter()
            .zip(&media_ids)
            .map(|(key, id)| (key.as_str(), json!({ "media_fbid": id }).to_string()))
            .collect();
        if !text.is_empty() {
            form.push(("message", text.to_string()));
        }

        let created = self.create("feed", form).await?;
        Ok(created.id)
    }

    async fn post_video(&self, video: &MediaRef, text: &str) -> std::result::Result<String, PlatformError> {
        let mut form = vec![("file_url", video.url.clone())];
        if !text.is_empty() {
            form.push(("description", text.to_string()));
        }
        let created = self.create("videos", form).await?;
        Ok(created.id)
    }
}

#[async_trait]
impl Platform for FacebookPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Facebook
    }

    fn dialect(&self) -> &MarkupDialect {
        &MarkupDialect::PLAIN_TEXT
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_only: true,
            max_media: MAX_PHOTOS,
        }
    }

    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost> {
        let media: &[MediaRef] = match self.capabilities().shape(media)? {
            PostShape::TextOnly => &[],
            PostShape::Single(single) => std::slice::from_ref(single),
            PostShape::Carousel(many) => many,
        };
        let text = payload.trim();
        let (photos, videos): (Vec<&MediaRef>, Vec<&MediaRef>) =
            media.iter().partition(|m| m.kind == MediaKind::Image);

        let post_id = match (photos.as_slice(), videos.first()) {
            ([], None) if text.is_empty() => {
                return Err(PlatformError::Rejected("nothing to publish".to_string()).into())
            }
            ([], None) => self.post_text(text).await?,
            ([], Some(video)) => {
                if videos.len() > 1 {
                    tracing::warn!(dropped = videos.len() - 1, "Facebook posts carry one video, dropping the rest");
                }
                self.post_video(video, text).await?
            }
            (photos, _) => {
                if !videos.is_empty() {
                    tracing::warn!(dropped = videos.len(), "Facebook photo posts cannot mix in video, dropping it");
                }
                match photos {
                    [photo] => self.post_photo(photo, text).await?,
                    many => self.post_photos(many, text).await?,
                }
            }
        };

        let post = PublishedPost {
            post_url: self.permalink(&post_id).await,
            post_id,
        };
        tracing::info!(platform = "facebook", post_url = %post.post_url, "Published to Facebook");
        Ok(post)
    }
}

fn fallback_url(page_id: &str, post_id: &str) -> String {
    format!("https://www.facebook.com/{}/posts/{}", page_id, post_id)
}
