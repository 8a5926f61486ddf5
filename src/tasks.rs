//! In-memory registry of download tasks.
//!
//! Task ids are derived from the artifact key, so two requests for the same
//! (content, kind, discriminator, extension) land on the same task. Callers
//! only ever see [`DownloadTask`] snapshots; the live records stay behind the
//! registry lock.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DownloadError, FormatTokenError, TaskError};
use crate::executor::DownloadExecutor;
use crate::format_token::FormatToken;
use crate::metadata::OfferedFormats;
use crate::progress::ProgressUpdate;
use crate::reference::ContentReference;
use crate::storage::Storage;

const TASK_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Point-in-time copy of a task, as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadTask {
    pub task_id: String,
    pub state: TaskState,
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub download_url: String,
    pub error: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Hex blake3 prefix of the artifact key.
pub fn task_id_for(artifact_key: &str) -> String {
    let mut id = blake3::hash(artifact_key.as_bytes()).to_hex().to_string();
    id.truncate(TASK_ID_LEN);
    id
}

pub fn is_valid_task_id(value: &str) -> bool {
    value.len() == TASK_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[derive(Debug)]
struct TaskRecord {
    state: TaskState,
    progress: f64,
    speed: String,
    eta: String,
    download_url: String,
    error: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

/// Live task shared between the registry and the executor running it.
///
/// Every transition goes through `transition`, which refuses to leave a
/// terminal state. Whichever of cancel or the executor finishes first wins.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    content_id: String,
    url: String,
    token: FormatToken,
    artifact_key: String,
    cancel: CancellationToken,
    record: Mutex<TaskRecord>,
}

impl TaskHandle {
    fn new(
        id: String,
        reference: &ContentReference,
        token: FormatToken,
        artifact_key: String,
    ) -> Self {
        Self {
            id,
            content_id: reference.content_id.clone(),
            url: reference.canonical_url.clone(),
            token,
            artifact_key,
            cancel: CancellationToken::new(),
            record: Mutex::new(TaskRecord {
                state: TaskState::Pending,
                progress: 0.0,
                speed: String::new(),
                eta: String::new(),
                download_url: String::new(),
                error: String::new(),
                start_time: Utc::now(),
                end_time: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &FormatToken {
        &self.token
    }

    pub fn artifact_key(&self) -> &str {
        &self.artifact_key
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn state(&self) -> TaskState {
        self.record.lock().state
    }

    pub fn snapshot(&self) -> DownloadTask {
        let record = self.record.lock();
        DownloadTask {
            task_id: self.id.clone(),
            state: record.state,
            progress: record.progress,
            speed: record.speed.clone(),
            eta: record.eta.clone(),
            download_url: record.download_url.clone(),
            error: record.error.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
        }
    }

    /// `pending -> downloading`. False when the task already ended.
    pub fn mark_downloading(&self) -> bool {
        self.transition(|record| {
            record.state = TaskState::Downloading;
        })
    }

    pub fn record_progress(&self, update: &ProgressUpdate) {
        let mut record = self.record.lock();
        if record.state != TaskState::Downloading {
            return;
        }
        record.progress = update.percent;
        if let Some(speed) = &update.speed {
            record.speed = speed.clone();
        }
        if let Some(eta) = &update.eta {
            record.eta = eta.clone();
        }
    }

    pub fn complete(&self, download_url: String) -> bool {
        self.transition(|record| {
            record.state = TaskState::Completed;
            record.progress = 100.0;
            record.eta.clear();
            record.download_url = download_url;
            record.end_time = Some(Utc::now());
        })
    }

    pub fn fail(&self, error: &DownloadError) -> bool {
        self.transition(|record| {
            record.state = TaskState::Failed;
            record.error = error.to_string();
            record.end_time = Some(Utc::now());
        })
    }

    /// Signals the running subprocess and fails the task. No-op once terminal.
    pub fn cancel(&self) -> bool {
        if !self.fail(&DownloadError::Cancelled) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn transition(&self, apply: impl FnOnce(&mut TaskRecord)) -> bool {
        let mut record = self.record.lock();
        if record.state.is_terminal() {
            return false;
        }
        apply(&mut record);
        true
    }

    fn expired(&self, now: DateTime<Utc>, retention: TimeDelta) -> bool {
        let record = self.record.lock();
        match (record.state.is_terminal(), record.end_time) {
            (true, Some(end)) => now.signed_duration_since(end) > retention,
            _ => false,
        }
    }
}

/// Cloneable handle to the task map.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
    executor: Arc<DownloadExecutor>,
    offered: OfferedFormats,
    retention: TimeDelta,
}

impl TaskRegistry {
    pub fn new(
        executor: Arc<DownloadExecutor>,
        offered: OfferedFormats,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tasks: RwLock::new(HashMap::new()),
                executor,
                offered,
                retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
            }),
        }
    }

    /// Returns the id of the task producing this artifact, starting a new one
    /// in the background if none is known.
    pub fn get_or_create(
        &self,
        reference: &ContentReference,
        format_id: &str,
    ) -> Result<String, TaskError> {
        let token = FormatToken::decode(format_id)?;
        if !self.inner.offered.allows(&token) {
            return Err(FormatTokenError::InvalidField("extension").into());
        }
        let artifact_key = Storage::artifact_key(&reference.content_id, &token);
        let task_id = task_id_for(&artifact_key);

        if self.inner.tasks.read().contains_key(&task_id) {
            return Ok(task_id);
        }

        let handle = {
            let mut tasks = self.inner.tasks.write();
            match tasks.entry(task_id.clone()) {
                Entry::Occupied(_) => return Ok(task_id),
                Entry::Vacant(slot) => {
                    let handle = Arc::new(TaskHandle::new(
                        task_id.clone(),
                        reference,
                        token,
                        artifact_key,
                    ));
                    slot.insert(handle.clone());
                    handle
                }
            }
        };

        info!(
            task_id = %task_id,
            content_id = %reference.content_id,
            artifact = %handle.artifact_key(),
            "download task created"
        );
        tokio::spawn(self.inner.executor.clone().run(handle));
        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Result<DownloadTask, TaskError> {
        self.handle(task_id).map(|handle| handle.snapshot())
    }

    /// Cancels a pending or downloading task and returns its snapshot.
    /// Terminal tasks are returned unchanged.
    pub fn cancel(&self, task_id: &str) -> Result<DownloadTask, TaskError> {
        let handle = self.handle(task_id)?;
        if handle.cancel() {
            info!(task_id, "download task cancelled");
        }
        Ok(handle.snapshot())
    }

    /// Cancels every task that has not reached a terminal state.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<Arc<TaskHandle>> = self.inner.tasks.read().values().cloned().collect();
        let cancelled = handles.iter().filter(|handle| handle.cancel()).count();
        if cancelled > 0 {
            info!(cancelled, "cancelled running download tasks");
        }
        cancelled
    }

    /// Drops terminal tasks whose end time is more than the retention window
    /// before `now`. Artifacts are left alone.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = self.inner.retention;
        let mut tasks = self.inner.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.expired(now, retention));
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the periodic eviction loop. It runs until the returned handle is
    /// stopped.
    pub fn start_eviction(&self, interval: Duration) -> EvictionHandle {
        let registry = self.clone();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.evict_expired(Utc::now());
                        if removed > 0 {
                            debug!(
                                removed,
                                remaining = registry.len(),
                                "evicted finished download tasks"
                            );
                        }
                    }
                }
            }
        });
        EvictionHandle { cancel, join }
    }

    fn handle(&self, task_id: &str) -> Result<Arc<TaskHandle>, TaskError> {
        self.inner
            .tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }
}

pub struct EvictionHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl EvictionHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            tracing::warn!("eviction task ended abnormally: {err}");
        }
    }
}
