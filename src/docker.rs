use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::image::ListImagesOptions;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    /// The engine does not know the given id, tag or name.
    NotFound(String),
    /// Another entry is already stored under the same engine id.
    AlreadyExists(String),
    /// Any other engine-side failure (network, conflict, 5xx).
    Api(String),
    Connection(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(key) => write!(f, "not found: {key}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Api(e) => write!(f, "engine error: {e}"),
            EngineError::Connection(e) => write!(f, "engine connection error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Engine-side description of an image, as returned by inspection.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub id: String,
    /// Id of the image this one layers upon. Empty parent strings from the
    /// engine are normalized to `None`.
    pub parent_id: Option<String>,
    pub repo_tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Engine-side description of a container.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Container,
    Image,
    Other,
}

/// One decoded entry of the engine event stream.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub action: String,
    pub kind: SubjectKind,
    pub id: String,
}

/// The injected container-engine capability. Everything the daemon knows
/// about the outside world goes through this trait.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Ids of all images known to the engine, including intermediate layers.
    async fn list_images(&self) -> EngineResult<Vec<String>>;

    /// Ids of all containers, running or stopped.
    async fn list_containers(&self) -> EngineResult<Vec<String>>;

    /// Inspect an image by id, tag or short id.
    async fn inspect_image(&self, key: &str) -> EngineResult<ImageDetails>;

    /// Inspect a container by id or name.
    async fn inspect_container(&self, key: &str) -> EngineResult<ContainerDetails>;

    /// Remove an image by tag or id. Removing a tag of a multi-tagged image
    /// only unbinds that tag.
    async fn remove_image(&self, key: &str) -> EngineResult<()>;

    /// The decoded event feed. The stream ends when the engine goes away.
    async fn events(&self) -> EngineResult<BoxStream<'static, EngineResult<EngineEvent>>>;
}

// ── bollard-backed implementation ────────────────────────────────

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn map_err(e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        other => EngineError::Api(other.to_string()),
    }
}

fn into_event(msg: EventMessage) -> EngineEvent {
    let kind = match msg.typ {
        Some(EventMessageTypeEnum::CONTAINER) => SubjectKind::Container,
        Some(EventMessageTypeEnum::IMAGE) => SubjectKind::Image,
        _ => SubjectKind::Other,
    };
    EngineEvent {
        action: msg.action.unwrap_or_default(),
        kind,
        id: msg.actor.and_then(|a| a.id).unwrap_or_default(),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_images(&self) -> EngineResult<Vec<String>> {
        let summaries = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;
        Ok(summaries.into_iter().map(|s| s.id).collect())
    }

    async fn list_containers(&self) -> EngineResult<Vec<String>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;
        Ok(summaries.into_iter().filter_map(|s| s.id).collect())
    }

    async fn inspect_image(&self, key: &str) -> EngineResult<ImageDetails> {
        let inspect = self.docker.inspect_image(key).await.map_err(map_err)?;
        let id = inspect
            .id
            .ok_or_else(|| EngineError::Api(format!("image {key} inspected without an id")))?;
        Ok(ImageDetails {
            id,
            parent_id: inspect.parent.filter(|p| !p.is_empty()),
            repo_tags: inspect.repo_tags.unwrap_or_default(),
            labels: inspect
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default(),
        })
    }

    async fn inspect_container(&self, key: &str) -> EngineResult<ContainerDetails> {
        let inspect = self
            .docker
            .inspect_container(key, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        let id = inspect
            .id
            .ok_or_else(|| EngineError::Api(format!("container {key} inspected without an id")))?;
        let image_id = inspect
            .image
            .ok_or_else(|| EngineError::Api(format!("container {key} inspected without an image")))?;
        Ok(ContainerDetails {
            id,
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image_id,
        })
    }

    async fn remove_image(&self, key: &str) -> EngineResult<()> {
        self.docker
            .remove_image(key, None, None)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn events(&self) -> EngineResult<BoxStream<'static, EngineResult<EngineEvent>>> {
        let stream = self.docker.events(None::<EventsOptions<String>>);
        Ok(stream
            .map(|item| item.map(into_event).map_err(map_err))
            .boxed())
    }
}
