use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, warn};

use crate::containers::Containers;
use crate::docker::{ContainerEngine, EngineEvent, EngineResult, SubjectKind};
use crate::images::Images;
use crate::observability;

/// Single consumer of the engine event stream. Dispatches by action to the
/// registries; a failing handler never takes the loop down.
pub struct Watcher {
    engine: Arc<dyn ContainerEngine>,
    images: Arc<Images>,
    containers: Arc<Containers>,
}

impl Watcher {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        images: Arc<Images>,
        containers: Arc<Containers>,
    ) -> Self {
        Self {
            engine,
            images,
            containers,
        }
    }

    /// Consume events until the engine closes the stream.
    pub async fn watch(&self) -> EngineResult<()> {
        let mut events = self.engine.events().await?;
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => self.dispatch(&event).await,
                Err(e) => warn!("failed to decode engine event: {e}"),
            }
        }
        Ok(())
    }

    pub async fn dispatch(&self, event: &EngineEvent) {
        metrics::counter!(observability::EVENTS_TOTAL, "action" => event.action.clone())
            .increment(1);
        match event.action.as_str() {
            "tag" => self.on_tag(event).await,
            "untag" => self.on_untag(event).await,
            "commit" => self.on_commit(event),
            "delete" => self.on_delete(event).await,
            "create" => self.on_create(event).await,
            "destroy" => self.on_destroy(event).await,
            other => debug!("no op for {other:?} event on {}", event.id),
        }
    }

    async fn on_tag(&self, event: &EngineEvent) {
        self.refresh_image(&event.id).await;
    }

    async fn on_untag(&self, event: &EngineEvent) {
        self.refresh_image(&event.id).await;
    }

    /// Re-inspect an image after its tag set changed. An image the engine no
    /// longer knows gets popped; one we never tracked gets instantiated by
    /// the lookup itself.
    async fn refresh_image(&self, id: &str) {
        let Some(image) = self.images.get(id).await else {
            debug!("{id} was deleted before handling event");
            return;
        };
        if let Err(e) = image.refresh().await {
            if e.is_not_found() {
                self.images.pop(id).await;
            } else {
                error!("failed to refresh image {id}: {e}");
            }
        }
    }

    fn on_commit(&self, event: &EngineEvent) {
        // a tag event is expected to follow and brings the image in
        debug!("would re-load image list for commit of {}", event.id);
    }

    async fn on_delete(&self, event: &EngineEvent) {
        if self.images.pop(&event.id).await.is_none() {
            // receiving the event twice happens; stay resilient to it
            debug!(
                "failed to destroy image {}, it was expected to be already deleted",
                event.id
            );
        }
    }

    async fn on_create(&self, event: &EngineEvent) {
        if event.kind != SubjectKind::Container {
            return;
        }
        self.containers.add(&event.id).await;
    }

    async fn on_destroy(&self, event: &EngineEvent) {
        if self.containers.pop(&event.id).await.is_none() {
            error!(
                "failed to destroy container {}, it was expected to be already deleted",
                event.id
            );
        }
    }
}
