// ABOUTME: Per-sandbox log pumps from the container engine into the hub and the log store
// ABOUTME: Opens at most one follow stream per sandbox and batches persistence by size and time

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::demux::{demux_stream, LogEntry};
use crate::error::{Result, SandboxError};
use crate::hub::Hub;
use crate::log_store::LogStore;
use crate::protocol::Envelope;
use crate::providers::{LogStreamOptions, Provider, ProviderError};
use crate::storage::{SandboxStatus, SandboxStorage};

/// Maximum buffered entries before forcing a flush
const LOG_BUFFER_SIZE: usize = 100;

/// Buffer flush interval
const LOG_BUFFER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

struct ActiveStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One sandbox's stream, serialized on its own lock
type StreamSlot = Arc<Mutex<Option<ActiveStream>>>;

pub struct LogStreamer {
    hub: Arc<Hub>,
    store: Arc<LogStore>,
    storage: Arc<SandboxStorage>,
    provider: Arc<dyn Provider>,
    /// Held only to look up or swap slots, never across storage or engine calls
    streams: Mutex<HashMap<String, StreamSlot>>,
    flush_size: usize,
    flush_interval: Duration,
}

impl LogStreamer {
    pub fn new(
        hub: Arc<Hub>,
        store: Arc<LogStore>,
        storage: Arc<SandboxStorage>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            hub,
            store,
            storage,
            provider,
            streams: Mutex::new(HashMap::new()),
            flush_size: LOG_BUFFER_SIZE,
            flush_interval: LOG_BUFFER_FLUSH_INTERVAL,
        }
    }

    pub fn with_flush_policy(mut self, size: usize, interval: Duration) -> Self {
        self.flush_size = size.max(1);
        self.flush_interval = interval;
        self
    }

    /// Open a follow stream for a running sandbox unless one is already active.
    ///
    /// Returns true if a new stream was opened.
    pub async fn ensure_stream(&self, sandbox_id: &str) -> Result<bool> {
        let slot = self
            .streams
            .lock()
            .await
            .entry(sandbox_id.to_string())
            .or_default()
            .clone();
        let mut current = slot.lock().await;

        if let Some(active) = current.as_ref() {
            if !active.handle.is_finished() {
                return Ok(false);
            }
        }

        let active = self.open(sandbox_id).await?;

        // A concurrent stop may have released the slot while the engine answered
        let still_registered = self
            .streams
            .lock()
            .await
            .get(sandbox_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, &slot));

        if !still_registered {
            debug!(
                "Log stream for sandbox {} was stopped while opening, discarding it",
                sandbox_id
            );
            active.cancel.cancel();
            if let Err(e) = active.handle.await {
                error!("Log stream task for sandbox {} panicked: {}", sandbox_id, e);
            }
            return Ok(false);
        }

        *current = Some(active);
        info!("Opened log stream for sandbox {}", sandbox_id);
        Ok(true)
    }

    async fn open(&self, sandbox_id: &str) -> Result<ActiveStream> {
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;
        let container_id = match (&sandbox.container_id, sandbox.status) {
            (Some(container_id), SandboxStatus::Running) => container_id.clone(),
            _ => {
                return Err(SandboxError::InvalidState(format!(
                    "Sandbox {} is {}, logs stream only from running sandboxes",
                    sandbox_id, sandbox.status
                )))
            }
        };

        // Resume after what is already stored so a reopened stream does not duplicate it
        let resume_after = self.store.latest_timestamp(sandbox_id).await?;
        let raw = self
            .provider
            .stream_logs(
                &container_id,
                LogStreamOptions {
                    follow: true,
                    since: resume_after,
                    timestamps: true,
                },
            )
            .await?;

        let cancel = CancellationToken::new();
        let pump = LogPump {
            sandbox_id: sandbox_id.to_string(),
            hub: self.hub.clone(),
            store: self.store.clone(),
            resume_after,
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
        };
        let entries = demux_stream(raw, true);
        let handle = tokio::spawn(pump.run(entries, cancel.clone()));

        Ok(ActiveStream { cancel, handle })
    }

    /// Close a sandbox's stream after flushing what it buffered
    pub async fn stop_stream(&self, sandbox_id: &str) -> bool {
        let slot = self.streams.lock().await.remove(sandbox_id);
        let Some(slot) = slot else {
            return false;
        };

        // Waits out an open in progress on this sandbox only
        let active = slot.lock().await.take();
        match active {
            Some(active) => {
                active.cancel.cancel();
                if let Err(e) = active.handle.await {
                    error!("Log stream task for sandbox {} panicked: {}", sandbox_id, e);
                }
                info!("Closed log stream for sandbox {}", sandbox_id);
                true
            }
            None => false,
        }
    }

    /// Forget a sandbox that is going away: close its stream and drop its watchers
    pub async fn release_sandbox(&self, sandbox_id: &str) {
        self.stop_stream(sandbox_id).await;
        let dropped = self.hub.drop_sandbox(sandbox_id).await;
        if dropped > 0 {
            info!(
                "Released {} subscribers of deleted sandbox {}",
                dropped, sandbox_id
            );
        }
    }

    /// Close every stream, flushing each
    pub async fn stop_all(&self) -> usize {
        let slots: Vec<(String, StreamSlot)> = self.streams.lock().await.drain().collect();

        let mut active = Vec::with_capacity(slots.len());
        for (sandbox_id, slot) in slots {
            if let Some(stream) = slot.lock().await.take() {
                stream.cancel.cancel();
                active.push((sandbox_id, stream));
            }
        }

        let count = active.len();
        for (sandbox_id, stream) in active {
            if let Err(e) = stream.handle.await {
                error!("Log stream task for sandbox {} panicked: {}", sandbox_id, e);
            }
        }

        if count > 0 {
            info!("Closed {} log streams", count);
        }
        count
    }

    /// Sandboxes with a live stream
    pub async fn active_streams(&self) -> Vec<String> {
        let slots: Vec<(String, StreamSlot)> = self
            .streams
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut live = Vec::new();
        for (sandbox_id, slot) in slots {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|s| !s.handle.is_finished())
            {
                live.push(sandbox_id);
            }
        }
        live.sort();
        live
    }
}

/// State moved into a stream's task
struct LogPump {
    sandbox_id: String,
    hub: Arc<Hub>,
    store: Arc<LogStore>,
    resume_after: Option<DateTime<Utc>>,
    flush_size: usize,
    flush_interval: Duration,
}

impl LogPump {
    async fn run(
        self,
        mut entries: BoxStream<'static, std::result::Result<LogEntry, ProviderError>>,
        cancel: CancellationToken,
    ) {
        let mut buffer: Vec<LogEntry> = Vec::with_capacity(self.flush_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.flush(&mut buffer).await,
                next = entries.next() => match next {
                    Some(Ok(entry)) => {
                        if self.resume_after.is_some_and(|t| entry.timestamp <= t) {
                            continue;
                        }
                        self.hub
                            .broadcast_to_sandbox(&self.sandbox_id, Envelope::log(&self.sandbox_id, &entry))
                            .await;
                        buffer.push(entry);
                        if buffer.len() >= self.flush_size {
                            self.flush(&mut buffer).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Log stream for sandbox {} failed: {}", self.sandbox_id, e);
                        break;
                    }
                    None => {
                        debug!("Log stream for sandbox {} ended", self.sandbox_id);
                        break;
                    }
                },
            }
        }

        self.flush(&mut buffer).await;
    }

    async fn flush(&self, buffer: &mut Vec<LogEntry>) {
        if buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(buffer);
        if let Err(e) = self.store.insert_batch(&self.sandbox_id, &batch).await {
            error!(
                "Failed to persist {} log entries for sandbox {}: {}",
                batch.len(),
                self.sandbox_id,
                e
            );
        }
    }
}
