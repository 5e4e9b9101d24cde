//! VK wall posting via `wall.post`
//!
//! Images are uploaded to the wall's photo server first
//! (`photos.getWallUploadServer`, a multipart upload, `photos.saveWallPhoto`)
//! and attached as `photo<owner>_<id>`. Videos are attached as a link.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::VkConfig;
use crate::error::{PlatformError, Result};
use crate::platforms::{
    classify_status, map_reqwest_error, read_token_file, Capabilities, Platform, PostShape,
};
use crate::sanitizer::MarkupDialect;
use crate::types::{MediaKind, MediaRef, PlatformKind, PublishedPost};

/// Attachments VK accepts on one wall post
const MAX_ATTACHMENTS: usize = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    response: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_code: i64,
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct WallPost {
    post_id: i64,
}

#[derive(Debug, Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct UploadedPhoto {
    server: i64,
    photo: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct SavedPhoto {
    id: i64,
    owner_id: i64,
}

pub struct VkPlatform {
    client: reqwest::Client,
    token: SecretString,
    owner_id: i64,
    api_base: String,
    api_version: String,
}

impl VkPlatform {
    pub fn new(config: &VkConfig, token: SecretString, client: reqwest::Client) -> Result<Self> {
        if config.owner_id == 0 {
            return Err(PlatformError::NotConfigured("vk.owner_id must be non-zero".to_string()).into());
        }

        Ok(Self {
            client,
            token,
            owner_id: config.owner_id,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        })
    }

    pub fn from_config(config: &VkConfig, client: reqwest::Client) -> Result<Self> {
        let token = read_token_file(&config.token_file)?;
        Self::new(config, token, client)
    }

    /// Community id for photo methods; user walls pass none
    fn group_id(&self) -> Option<String> {
        (self.owner_id < 0).then(|| (-self.owner_id).to_string())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<T, PlatformError> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("access_token", self.token.expose_secret()));
        form.push(("v", self.api_version.as_str()));

        let response = self
            .client
            .post(format!("{}/{}", self.api_base, method))
            .form(&form)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;

        let parsed: ApiResponse<T> = serde_json::from_str(&body).map_err(|_| {
            classify_status(
                status.as_u16(),
                format!("{} returned HTTP {} with an unreadable body", method, status),
            )
        })?;

        if let Some(error) = parsed.error {
            return Err(classify_api_error(error.error_code, error.error_msg));
        }
        parsed
            .response
            .ok_or_else(|| PlatformError::Rejected(format!("{} returned no response", method)))
    }

    /// Upload one image to the wall photo server and return its attachment id
    async fn upload_photo(&self, media: &MediaRef) -> std::result::Result<String, PlatformError> {
        let group_id = self.group_id();
        let mut params = Vec::new();
        if let Some(group_id) = group_id.as_deref() {
            params.push(("group_id", group_id));
        }
        let server: UploadServer = self.call("photos.getWallUploadServer", &params).await?;

        let image = self
            .client
            .get(&media.url)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = image.status();
        if !status.is_success() {
            return Err(classify_status(
                status.as_u16(),
                format!("downloading {} returned HTTP {}", media.url, status),
            ));
        }
        let bytes = image.bytes().await.map_err(map_reqwest_error)?;

        let (file_name, mime) = image_file(&media.url);
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name)
            .mime_str(mime)
            .map_err(map_reqwest_error)?;
        let form = reqwest::multipart::Form::new().part("photo", part);

        let response = self
            .client
            .post(&server.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest_error)?;
        let uploaded: UploadedPhoto = serde_json::from_str(&body).map_err(|_| {
            classify_status(
                status.as_u16(),
                format!("photo upload returned HTTP {} with an unreadable body", status),
            )
        })?;
        if uploaded.photo.is_empty() || uploaded.photo == "[]" {
            return Err(PlatformError::Rejected(format!(
                "VK did not accept the image at {}",
                media.url
            )));
        }

        let server_id = uploaded.server.to_string();
        let mut params = vec![
            ("photo", uploaded.photo.as_str()),
            ("server", server_id.as_str()),
            ("hash", uploaded.hash.as_str()),
        ];
        if let Some(group_id) = group_id.as_deref() {
            params.push(("group_id", group_id));
        }
        let saved: Vec<SavedPhoto> = self.call("photos.saveWallPhoto", &params).await?;
        let photo = saved
            .first()
            .ok_or_else(|| PlatformError::Rejected("photos.saveWallPhoto returned no photo".to_string()))?;

        Ok(format!("photo{}_{}", photo.owner_id, photo.id))
    }

    /// Build the `attachments` list for `media`
    ///
    /// An image VK refuses is skipped with a warning; failures a later
    /// attempt could get past end the attempt.
    async fn attachments(&self, media: &[MediaRef]) -> std::result::Result<Vec<String>, PlatformError> {
        let mut attachments = Vec::new();
        let mut link = None;

        for item in media {
            match item.kind {
                MediaKind::Image => match self.upload_photo(item).await {
                    Ok(photo) => attachments.push(photo),
                    Err(e @ PlatformError::Rejected(_)) => {
                        tracing::warn!(platform = "vk", url = %item.url, error = %e, "Skipping image")
                    }
                    Err(e) => return Err(e),
                },
                // A post carries at most one link attachment
                MediaKind::Video if link.is_none() => link = Some(item.url.clone()),
                MediaKind::Video => {
                    tracing::warn!(platform = "vk", url = %item.url, "Only one video link per post, skipping")
                }
            }
        }

        attachments.extend(link);
        Ok(attachments)
    }
}

#[async_trait]
impl Platform for VkPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Vk
    }

    fn dialect(&self) -> &MarkupDialect {
        &MarkupDialect::PLAIN_TEXT
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            text_only: true,
            max_media: MAX_ATTACHMENTS,
        }
    }

    async fn publish(&self, payload: &str, media: &[MediaRef]) -> Result<PublishedPost> {
        let media: &[MediaRef] = match self.capabilities().shape(media)? {
            PostShape::TextOnly => &[],
            PostShape::Single(single) => std::slice::from_ref(single),
            PostShape::Carousel(many) => many,
        };

        let attachments = self.attachments(media).await?.join(",");
        if attachments.is_empty() && payload.trim().is_empty() {
            return Err(PlatformError::Rejected("nothing to publish".to_string()).into());
        }

        let owner_id = self.owner_id.to_string();
        let mut params: Vec<(&str, &str)> = vec![("owner_id", owner_id.as_str()), ("message", payload)];
        // Community walls post on behalf of the community
        if self.owner_id < 0 {
            params.push(("from_group", "1"));
        }
        if !attachments.is_empty() {
            params.push(("attachments", attachments.as_str()));
        }

        let post: WallPost = self.call("wall.post", &params).await?;

        let published = PublishedPost {
            post_id: post.post_id.to_string(),
            post_url: format!("https://vk.com/wall{}_{}", self.owner_id, post.post_id),
        };
        tracing::info!(platform = "vk", post_url = %published.post_url, "Published to VK");
        Ok(published)
    }
}

/// Upload file name and content type for an image URL
fn image_file(url: &str) -> (String, &'static str) {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    let name = path
        .rsplit('/')
        .next()
        .filter(|name| name.contains('.'))
        .unwrap_or("image.jpg");
    let mime = match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    (name.to_string(), mime)
}

/// Map a VK API error code onto the error taxonomy
fn classify_api_error(code: i64, message: String) -> PlatformError {
    let message = format!("VK error {}: {}", code, message);
    match code {
        // auth failed, access denied, no permission for the wall
        5 | 14 | 15 | 17 | 27 | 28 | 214 => PlatformError::Authentication(message),
        // too many requests per second, internal server error
        6 | 10 => PlatformError::Network(message),
        // flood control, rate limit reached
        9 | 29 => PlatformError::QuotaExceeded(message),
        _ => PlatformError::Rejected(message),
    }
}
