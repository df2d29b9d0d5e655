use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::docker::{ContainerEngine, EngineResult};
use crate::images::Images;
use crate::observability;
use crate::registry::{EntrySource, SyncRegistry};

/// Immutable record of one container. Identity is the engine id.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image_id: String,
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Container {}

impl std::hash::Hash for Container {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Container<id: {}, name: {}>", self.id, self.name)
    }
}

/// The container registry. Adding a container registers it as a reference on
/// its image; popping releases that reference.
pub struct Containers {
    registry: SyncRegistry<ContainerSource>,
    images: Arc<Images>,
}

struct ContainerSource {
    engine: Arc<dyn ContainerEngine>,
    images: Arc<Images>,
}

#[async_trait]
impl EntrySource for ContainerSource {
    type Entry = Container;

    fn kind(&self) -> &'static str {
        "container"
    }

    async fn list_ids(&self) -> EngineResult<Vec<String>> {
        self.engine.list_containers().await
    }

    async fn resolve_id(&self, key: &str) -> EngineResult<String> {
        Ok(self.engine.inspect_container(key).await?.id)
    }

    async fn instantiate(&self, id: &str) -> EngineResult<Arc<Container>> {
        let details = self.engine.inspect_container(id).await?;
        let container = Arc::new(Container {
            id: details.id,
            name: details.name,
            image_id: details.image_id,
        });
        match self.images.get(&container.image_id).await {
            Some(image) => image.add_container(&container),
            None => error!(
                "{container} is running on not found image {}. It looks like it has been deleted --force",
                container.image_id
            ),
        }
        Ok(container)
    }
}

impl Containers {
    pub fn new(engine: Arc<dyn ContainerEngine>, images: Arc<Images>) -> Arc<Self> {
        Arc::new(Self {
            registry: SyncRegistry::new(ContainerSource {
                engine,
                images: images.clone(),
            }),
            images,
        })
    }

    /// Populate from the engine's current container list, linking each
    /// container to its image.
    pub async fn initial_sync(&self) -> EngineResult<()> {
        let count = self.registry.initial_sync().await?;
        info!("tracking {count} containers");
        metrics::gauge!(observability::CONTAINERS_TRACKED).set(count as f64);
        Ok(())
    }

    pub async fn add(&self, key: &str) -> Option<Arc<Container>> {
        let container = self.registry.add(key).await;
        metrics::gauge!(observability::CONTAINERS_TRACKED).set(self.registry.len().await as f64);
        container
    }

    #[allow(dead_code)]
    pub async fn get(&self, key: &str) -> Option<Arc<Container>> {
        self.registry.get(key).await
    }

    /// Remove a container and release its reference on the image.
    pub async fn pop(&self, key: &str) -> Option<Arc<Container>> {
        let container = self.registry.pop(key).await?;
        info!("container {container} was removed");
        match self.images.get(&container.image_id).await {
            Some(image) => image.remove_container(&container),
            None => error!(
                "{container} is running on not found image {}. It looks like it has been deleted --force",
                container.image_id
            ),
        }
        metrics::gauge!(observability::CONTAINERS_TRACKED).set(self.registry.len().await as f64);
        Some(container)
    }

    #[allow(dead_code)]
    pub async fn contains(&self, id: &str) -> bool {
        self.registry.contains(id).await
    }

    #[allow(dead_code)]
    pub async fn len(&self) -> usize {
        self.registry.len().await
    }
}
