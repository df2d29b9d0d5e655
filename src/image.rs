use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::containers::Container;
use crate::docker::{ContainerEngine, EngineResult, ImageDetails};
use crate::grace::{self, GraceTime};
use crate::images::Images;
use crate::observability;
use crate::timer::GraceTimer;

/// Permits for concurrent engine delete calls: unbounded concurrent deletes
/// exhaust the engine client's connection pool under bulk reclaim.
const DELETE_PERMITS: usize = 5;

static DELETE_GATE: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(DELETE_PERMITS));

/// One node of the image graph: the containers and child images referencing
/// it, and the delete timer armed whenever both sets are empty.
pub struct Image {
    id: String,
    parent_id: Option<String>,
    engine: Arc<dyn ContainerEngine>,
    config: Arc<Config>,
    default_grace: String,
    images: Weak<Images>,
    state: Mutex<ImageState>,
}

#[derive(Default)]
struct ImageState {
    tags: Vec<String>,
    labels: HashMap<String, String>,
    containers: HashSet<String>,
    children: HashSet<String>,
    timer: Option<GraceTimer>,
}

impl Image {
    pub(crate) fn new(
        details: ImageDetails,
        engine: Arc<dyn ContainerEngine>,
        config: Arc<Config>,
        default_grace: String,
        images: Weak<Images>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: details.id,
            parent_id: details.parent_id,
            engine,
            config,
            default_grace,
            images,
            state: Mutex::new(ImageState {
                tags: details.repo_tags,
                labels: details.labels,
                ..Default::default()
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    #[allow(dead_code)]
    pub fn tags(&self) -> Vec<String> {
        self.state.lock().unwrap().tags.clone()
    }

    #[allow(dead_code)]
    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    #[allow(dead_code)]
    pub fn child_count(&self) -> usize {
        self.state.lock().unwrap().children.len()
    }

    /// Whether a delete timer is currently armed.
    #[allow(dead_code)]
    pub fn has_pending_removal(&self) -> bool {
        self.state.lock().unwrap().timer.is_some()
    }

    pub fn add_container(self: &Arc<Self>, container: &Container) {
        debug!("{self} is required to run {container}");
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container.id.clone());
        self.update_timer();
    }

    pub fn remove_container(self: &Arc<Self>, container: &Container) {
        self.state.lock().unwrap().containers.remove(&container.id);
        self.update_timer();
    }

    pub fn add_child(self: &Arc<Self>, child_id: &str) {
        debug!("{child_id} inherits {self}");
        self.state
            .lock()
            .unwrap()
            .children
            .insert(child_id.to_string());
        self.update_timer();
    }

    pub fn remove_child(self: &Arc<Self>, child_id: &str) {
        debug!("{self} sub image {child_id} was deleted");
        self.state.lock().unwrap().children.remove(child_id);
        self.update_timer();
    }

    /// Re-inspect from the engine, refresh the derived tag and label sets,
    /// and reconsider the timer.
    pub async fn refresh(self: &Arc<Self>) -> EngineResult<()> {
        let details = self.engine.inspect_image(&self.id).await?;
        {
            let mut state = self.state.lock().unwrap();
            state.tags = details.repo_tags;
            state.labels = details.labels;
        }
        self.update_timer();
        Ok(())
    }

    /// Schedule a removal when the image is unreferenced, cancel any pending
    /// one otherwise.
    pub fn update_timer(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.containers.is_empty() && state.children.is_empty() {
            self.schedule_removal_locked(&mut state);
        } else {
            self.cancel_removal_locked(&mut state);
        }
    }

    /// Arm the delete timer after the effective grace time. No-op when a
    /// timer is already armed, when every candidate is `Never`, or when the
    /// grace text cannot be understood.
    pub fn schedule_removal(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        self.schedule_removal_locked(&mut state);
    }

    /// Cancel any pending removal. Idempotent.
    pub fn cancel_removal(&self) {
        let mut state = self.state.lock().unwrap();
        self.cancel_removal_locked(&mut state);
    }

    fn schedule_removal_locked(self: &Arc<Self>, state: &mut ImageState) {
        if state.timer.is_some() {
            return;
        }
        let candidates =
            grace::candidates(&self.config, &state.labels, &state.tags, &self.default_grace);
        match grace::max_grace(&candidates) {
            None | Some(GraceTime::Never) => {
                debug!(
                    "not scheduling {} removal, delete delay is negative or infinite",
                    self.describe(state)
                );
            }
            Some(GraceTime::After(delay)) => {
                info!(
                    "scheduling {} removal in {}",
                    self.describe(state),
                    humantime::format_duration(delay)
                );
                let image = Arc::clone(self);
                let timer = GraceTimer::new(delay, async move { image.delete().await });
                timer.start();
                state.timer = Some(timer);
                metrics::gauge!(observability::TIMERS_ARMED)
                    .set(crate::timer::live_count() as f64);
            }
        }
    }

    fn cancel_removal_locked(&self, state: &mut ImageState) {
        if let Some(timer) = state.timer.take() {
            info!("cancelling {} removal", self.describe(state));
            timer.cancel();
            metrics::gauge!(observability::TIMERS_ARMED).set(crate::timer::live_count() as f64);
        }
    }

    /// The engine confirmed this image is gone: drop any pending timer and
    /// detach from the parent's children set.
    pub async fn on_deleted(&self) {
        self.cancel_removal();
        let Some(parent_id) = &self.parent_id else {
            return;
        };
        let Some(images) = self.images.upgrade() else {
            return;
        };
        match images.get(parent_id).await {
            Some(parent) => parent.remove_child(&self.id),
            None => debug!("parent {parent_id} of {} is already gone", self.id),
        }
    }

    /// Timer callback: attempt the actual engine-side removal.
    ///
    /// On success the in-memory entry stays and a fresh timer is armed; the
    /// entry only leaves the registry when the engine's own `delete` event is
    /// consumed. If that event never comes (lost, or the image got a new tag
    /// in the meantime), the next firing retries.
    pub async fn delete(self: Arc<Self>) {
        let Ok(_permit) = DELETE_GATE.acquire().await else {
            return;
        };
        // the timer that got us here has fired; clear it so a retry can arm
        self.cancel_removal();
        info!("deleting image {self}");

        let details = match self.engine.inspect_image(&self.id).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => {
                debug!("image {} is already gone", self.id);
                metrics::counter!(observability::REMOVALS_TOTAL, "status" => "not_found")
                    .increment(1);
                self.pop_self().await;
                return;
            }
            Err(e) => {
                error!("failed to inspect {self} before removal: {e}");
                metrics::counter!(observability::REMOVALS_TOTAL, "status" => "error").increment(1);
                self.schedule_removal();
                return;
            }
        };
        {
            let mut state = self.state.lock().unwrap();
            state.tags = details.repo_tags.clone();
            state.labels = details.labels;
        }

        for tag in &details.repo_tags {
            match self.engine.remove_image(tag).await {
                Ok(()) => debug!("untagged {tag}"),
                Err(e) if e.is_not_found() => {
                    debug!("tag {tag} was already removed out-of-band: {e}");
                }
                Err(e) => {
                    error!("failed removing {self}: {e}");
                    metrics::counter!(observability::REMOVALS_TOTAL, "status" => "error")
                        .increment(1);
                    self.schedule_removal();
                    return;
                }
            }
        }

        match self.engine.remove_image(&self.id).await {
            Ok(()) => {
                debug!(
                    "removed {}, keeping it in memory until the engine confirms the deletion",
                    self.id
                );
                metrics::counter!(observability::REMOVALS_TOTAL, "status" => "removed")
                    .increment(1);
                self.schedule_removal();
            }
            Err(e) if e.is_not_found() => {
                metrics::counter!(observability::REMOVALS_TOTAL, "status" => "not_found")
                    .increment(1);
                self.pop_self().await;
            }
            Err(e) => {
                error!("failed removing {self}: {e}");
                metrics::counter!(observability::REMOVALS_TOTAL, "status" => "error").increment(1);
                self.schedule_removal();
            }
        }
    }

    async fn pop_self(&self) {
        if let Some(images) = self.images.upgrade() {
            images.pop(&self.id).await;
        }
    }

    fn describe(&self, state: &ImageState) -> String {
        format!(
            "Image<id: {}, tags: {:?}, parent: {:?}>",
            self.id, state.tags, self.parent_id
        )
    }
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // try_lock: Display must stay usable from within state-holding code
        match self.state.try_lock() {
            Ok(state) => f.write_str(&self.describe(&state)),
            Err(_) => write!(f, "Image<id: {}>", self.id),
        }
    }
}
