//! Test fakes: a concrete, scripted in-memory engine. No mock framework,
//! just pre-loaded state and recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;

use crate::docker::{
    ContainerDetails, ContainerEngine, EngineError, EngineEvent, EngineResult, ImageDetails,
    SubjectKind,
};

/// `timer::cancel_all` sweeps the process-wide timer table; tests that arm
/// timers serialize on this lock so they cannot cancel each other's
/// schedules.
static TIMER_LOCK: Mutex<()> = Mutex::new(());

pub fn timer_lock() -> MutexGuard<'static, ()> {
    TIMER_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn image(
    id: &str,
    parent: Option<&str>,
    tags: &[&str],
    labels: &[(&str, &str)],
) -> ImageDetails {
    ImageDetails {
        id: id.to_string(),
        parent_id: parent.map(|p| p.to_string()),
        repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

pub fn container(id: &str, name: &str, image_id: &str) -> ContainerDetails {
    ContainerDetails {
        id: id.to_string(),
        name: name.to_string(),
        image_id: image_id.to_string(),
    }
}

/// An in-memory container engine. State is mutated through the same calls
/// the daemon makes, every `remove_image` call is recorded, and the event
/// feed is a broadcast channel the test writes into.
pub struct FakeEngine {
    images: Mutex<HashMap<String, ImageDetails>>,
    containers: Mutex<HashMap<String, ContainerDetails>>,
    /// tag / short id / name → engine id
    aliases: Mutex<HashMap<String, String>>,
    /// Every key passed to `remove_image`, in call order.
    removals: Mutex<Vec<String>>,
    /// Scripted failures consumed by the next `remove_image` calls.
    failures: Mutex<Vec<EngineError>>,
    events_tx: broadcast::Sender<EngineEvent>,
    /// When set, removing an image by id also broadcasts the engine's
    /// `delete` event, like a live engine would.
    emit_delete_events: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            images: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            removals: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            events_tx,
            emit_delete_events: AtomicBool::new(false),
        }
    }

    pub fn put_image(&self, details: ImageDetails) {
        let mut aliases = self.aliases.lock().unwrap();
        for tag in &details.repo_tags {
            aliases.insert(tag.clone(), details.id.clone());
        }
        drop(aliases);
        self.images
            .lock()
            .unwrap()
            .insert(details.id.clone(), details);
    }

    pub fn put_container(&self, details: ContainerDetails) {
        if !details.name.is_empty() {
            self.aliases
                .lock()
                .unwrap()
                .insert(details.name.clone(), details.id.clone());
        }
        self.containers
            .lock()
            .unwrap()
            .insert(details.id.clone(), details);
    }

    /// Register an extra lookup alias (e.g. a short id prefix).
    pub fn alias(&self, key: &str, id: &str) {
        self.aliases
            .lock()
            .unwrap()
            .insert(key.to_string(), id.to_string());
    }

    pub fn drop_container(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    /// Remove an image out-of-band, without a delete event.
    pub fn drop_image(&self, id: &str) {
        let mut images = self.images.lock().unwrap();
        if let Some(details) = images.remove(id) {
            let mut aliases = self.aliases.lock().unwrap();
            for tag in &details.repo_tags {
                aliases.remove(tag);
            }
        }
    }

    pub fn emit(&self, action: &str, kind: SubjectKind, id: &str) {
        let _ = self.events_tx.send(EngineEvent {
            action: action.to_string(),
            kind,
            id: id.to_string(),
        });
    }

    pub fn removals(&self) -> Vec<String> {
        self.removals.lock().unwrap().clone()
    }

    pub fn fail_next_removal(&self, error: EngineError) {
        self.failures.lock().unwrap().push(error);
    }

    pub fn set_emit_delete_events(&self, on: bool) {
        self.emit_delete_events.store(on, Ordering::SeqCst);
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.images.lock().unwrap().contains_key(id)
    }

    fn resolve(&self, key: &str) -> Option<String> {
        self.aliases.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_images(&self) -> EngineResult<Vec<String>> {
        Ok(self.images.lock().unwrap().keys().cloned().collect())
    }

    async fn list_containers(&self) -> EngineResult<Vec<String>> {
        Ok(self.containers.lock().unwrap().keys().cloned().collect())
    }

    async fn inspect_image(&self, key: &str) -> EngineResult<ImageDetails> {
        let images = self.images.lock().unwrap();
        if let Some(details) = images.get(key) {
            return Ok(details.clone());
        }
        drop(images);
        if let Some(id) = self.resolve(key) {
            if let Some(details) = self.images.lock().unwrap().get(&id) {
                return Ok(details.clone());
            }
        }
        Err(EngineError::NotFound(key.to_string()))
    }

    async fn inspect_container(&self, key: &str) -> EngineResult<ContainerDetails> {
        let containers = self.containers.lock().unwrap();
        if let Some(details) = containers.get(key) {
            return Ok(details.clone());
        }
        drop(containers);
        if let Some(id) = self.resolve(key) {
            if let Some(details) = self.containers.lock().unwrap().get(&id) {
                return Ok(details.clone());
            }
        }
        Err(EngineError::NotFound(key.to_string()))
    }

    async fn remove_image(&self, key: &str) -> EngineResult<()> {
        self.removals.lock().unwrap().push(key.to_string());
        {
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let mut images = self.images.lock().unwrap();
        // removing by tag only unbinds the tag
        if let Some(id) = self.aliases.lock().unwrap().get(key).cloned() {
            if let Some(details) = images.get_mut(&id) {
                details.repo_tags.retain(|t| t != key);
                self.aliases.lock().unwrap().remove(key);
                return Ok(());
            }
        }
        let Some(details) = images.remove(key) else {
            return Err(EngineError::NotFound(key.to_string()));
        };
        let mut aliases = self.aliases.lock().unwrap();
        for tag in &details.repo_tags {
            aliases.remove(tag);
        }
        drop(aliases);
        drop(images);
        if self.emit_delete_events.load(Ordering::SeqCst) {
            self.emit("delete", SubjectKind::Image, &details.id);
        }
        Ok(())
    }

    async fn events(&self) -> EngineResult<BoxStream<'static, EngineResult<EngineEvent>>> {
        let rx = self.events_tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => Some((
                    Err(EngineError::Api(format!("event feed lagged by {n}"))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream.boxed())
    }
}
