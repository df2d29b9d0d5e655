use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::docker::{ContainerEngine, EngineResult};
use crate::image::Image;
use crate::observability;
use crate::registry::{EntrySource, SyncRegistry};

/// The image registry: one entry per engine image, lazily instantiated,
/// addressed by id or any alias.
pub struct Images {
    registry: SyncRegistry<ImageSource>,
}

struct ImageSource {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<Config>,
    default_grace: String,
    images: Weak<Images>,
}

#[async_trait]
impl EntrySource for ImageSource {
    type Entry = Image;

    fn kind(&self) -> &'static str {
        "image"
    }

    async fn list_ids(&self) -> EngineResult<Vec<String>> {
        self.engine.list_images().await
    }

    async fn resolve_id(&self, key: &str) -> EngineResult<String> {
        Ok(self.engine.inspect_image(key).await?.id)
    }

    async fn instantiate(&self, id: &str) -> EngineResult<Arc<Image>> {
        let details = self.engine.inspect_image(id).await?;
        let image = Image::new(
            details,
            self.engine.clone(),
            self.config.clone(),
            self.default_grace.clone(),
            self.images.clone(),
        );
        // Link into the parent's children set, lazily creating the parent.
        if let Some(parent_id) = image.parent_id() {
            if let Some(images) = self.images.upgrade() {
                match images.get(parent_id).await {
                    Some(parent) => parent.add_child(image.id()),
                    None => warn!(
                        "parent {parent_id} of image {} cannot be inspected",
                        image.id()
                    ),
                }
            }
        }
        Ok(image)
    }
}

impl Images {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        config: Arc<Config>,
        default_grace: String,
    ) -> Arc<Self> {
        Arc::new_cyclic(|images| Self {
            registry: SyncRegistry::new(ImageSource {
                engine,
                config,
                default_grace,
                images: images.clone(),
            }),
        })
    }

    /// Populate from the engine's current image list.
    pub async fn initial_sync(&self) -> EngineResult<()> {
        let count = self.registry.initial_sync().await?;
        info!("tracking {count} images");
        metrics::gauge!(observability::IMAGES_TRACKED).set(count as f64);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Image>> {
        self.registry.get(key).await
    }

    #[allow(dead_code)]
    pub async fn add(&self, key: &str) -> Option<Arc<Image>> {
        self.registry.add(key).await
    }

    /// Remove an image from the registry and cascade: cancel its timer and
    /// shrink its parent's children set.
    pub async fn pop(&self, key: &str) -> Option<Arc<Image>> {
        let image = self.registry.pop(key).await?;
        info!("image {image} was removed");
        image.on_deleted().await;
        metrics::gauge!(observability::IMAGES_TRACKED).set(self.registry.len().await as f64);
        Some(image)
    }

    /// Reconsider every timer. Run once after the initial sync: a fully idle
    /// engine state needs its schedules armed.
    pub async fn update_timers(&self) {
        for image in self.registry.values().await {
            image.update_timer();
        }
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
