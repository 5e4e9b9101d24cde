//! Asynchronous media container pipeline
//!
//! Some platforms process uploaded media out of band: a container is
//! created from a media URL, processed server-side, and only a finished
//! container can be published. [`MediaPipeline`] drives one container
//! through
//!
//! ```text
//! Uploading -> ContainerPending -> Ready -> Published
//!          \___________\____________\______> Failed
//! ```
//!
//! polling the container status on a bounded schedule. A container still
//! pending once the poll budget is spent fails with
//! [`PlatformError::MediaNotReady`], which is retryable: the whole attempt
//! is deferred to a later scheduler tick.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PlatformError;
use crate::types::PublishedPost;

/// What a container is created from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRequest {
    Image { url: String, caption: Option<String>, carousel_item: bool },
    Video { url: String, caption: Option<String>, carousel_item: bool },
    /// Composite of already created child containers
    Carousel { children: Vec<String>, caption: Option<String> },
}

/// Server-side processing state of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Ready,
    Pending,
    Failed(String),
}

/// Platform calls the pipeline needs
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Create a container and return its id
    async fn create_container(&self, request: &ContainerRequest) -> Result<String, PlatformError>;

    async fn container_status(&self, container_id: &str) -> Result<ContainerStatus, PlatformError>;

    /// Publish a ready container
    async fn publish_container(&self, container_id: &str) -> Result<PublishedPost, PlatformError>;
}

/// Bounded polling schedule for `ContainerPending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Uploading,
    ContainerPending { container_id: String, polls: u32 },
    Ready { container_id: String },
    Published(PublishedPost),
    Failed(PlatformError),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Published(_) | PipelineState::Failed(_))
    }
}

/// Drives one container through its states
pub struct MediaPipeline<'a, A: ContainerApi + ?Sized> {
    api: &'a A,
    policy: PollPolicy,
}

impl<'a, A: ContainerApi + ?Sized> MediaPipeline<'a, A> {
    pub fn new(api: &'a A, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    /// Create, await and publish a container
    pub async fn run(&self, request: &ContainerRequest) -> Result<PublishedPost, PlatformError> {
        match self.drive(request, true).await {
            PipelineState::Published(post) => Ok(post),
            PipelineState::Failed(error) => Err(error),
            other => Err(PlatformError::Rejected(format!(
                "media pipeline stopped in state {:?}",
                other
            ))),
        }
    }

    /// Create a container and wait until it is ready, without publishing
    ///
    /// Used for carousel children, which are never published on their own.
    pub async fn prepare(&self, request: &ContainerRequest) -> Result<String, PlatformError> {
        match self.drive(request, false).await {
            PipelineState::Ready { container_id } => Ok(container_id),
            PipelineState::Failed(error) => Err(error),
            other => Err(PlatformError::Rejected(format!(
                "media pipeline stopped in state {:?}",
                other
            ))),
        }
    }

    async fn drive(&self, request: &ContainerRequest, publish: bool) -> PipelineState {
        let mut state = PipelineState::Uploading;

        loop {
            state = match state {
                PipelineState::Uploading => match self.api.create_container(request).await {
                    Ok(container_id) => {
                        tracing::debug!(container_id = %container_id, "Media container created");
                        PipelineState::ContainerPending {
                            container_id,
                            polls: 0,
                        }
                    }
                    Err(e) => PipelineState::Failed(e),
                },

                PipelineState::ContainerPending { container_id, polls } => {
                    if polls >= self.policy.max_attempts {
                        PipelineState::Failed(PlatformError::MediaNotReady(format!(
                            "container {} not ready after {} status checks",
                            container_id, polls
                        )))
                    } else {
                        if polls > 0 {
                            tokio::time::sleep(self.policy.interval).await;
                        }
                        match self.api.container_status(&container_id).await {
                            Ok(ContainerStatus::Ready) => PipelineState::Ready { container_id },
                            Ok(ContainerStatus::Pending) => PipelineState::ContainerPending {
                                container_id,
                                polls: polls + 1,
                            },
                            Ok(ContainerStatus::Failed(reason)) => {
                                PipelineState::Failed(PlatformError::Rejected(format!(
                                    "container {} failed processing: {}",
                                    container_id, reason
                                )))
                            }
                            // A flaky status check counts against the budget
                            Err(e) if e.is_retryable() => {
                                tracing::debug!(container_id = %container_id, error = %e, "Status check failed");
                                PipelineState::ContainerPending {
                                    container_id,
                                    polls: polls + 1,
                                }
                            }
                            Err(e) => PipelineState::Failed(e),
                        }
                    }
                }

                PipelineState::Ready { container_id } if publish => {
                    match self.api.publish_container(&container_id).await {
                        Ok(post) => PipelineState::Published(post),
                        Err(e) => PipelineState::Failed(e),
                    }
                }

                done => return done,
            };

            if state.is_terminal() {
                return state;
            }
        }
    }
}
