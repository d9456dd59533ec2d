// ABOUTME: In-memory pub/sub registry of connected clients and their subscriptions
// ABOUTME: Fans log, terminal and status messages out to subscribers without blocking on slow clients

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::protocol::Envelope;

/// Default number of queued messages per client before messages are dropped
pub const DEFAULT_CLIENT_CAPACITY: usize = 256;

struct ClientState {
    user_id: String,
    sender: mpsc::Sender<Envelope>,
    sandboxes: HashSet<String>,
    sessions: HashSet<String>,
    last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, ClientState>,
    sandbox_subscribers: HashMap<String, HashSet<String>>,
    session_subscribers: HashMap<String, HashSet<String>>,
}

impl Registry {
    /// Remove a client from every index. Returns sandboxes left with no subscribers.
    fn remove_client(&mut self, client_id: &str) -> Option<Vec<String>> {
        let client = self.clients.remove(client_id)?;

        let mut orphaned = Vec::new();
        for sandbox_id in &client.sandboxes {
            if remove_from_index(&mut self.sandbox_subscribers, sandbox_id, client_id) {
                orphaned.push(sandbox_id.clone());
            }
        }
        for session_id in &client.sessions {
            remove_from_index(&mut self.session_subscribers, session_id, client_id);
        }

        Some(orphaned)
    }

    fn senders_for(
        &self,
        index: &HashMap<String, HashSet<String>>,
        key: &str,
    ) -> Vec<(String, mpsc::Sender<Envelope>)> {
        index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|client_id| {
                self.clients
                    .get(client_id)
                    .map(|c| (client_id.clone(), c.sender.clone()))
            })
            .collect()
    }
}

/// Remove `client_id` from `index[key]`, dropping the entry once empty. Returns true if it emptied.
fn remove_from_index(
    index: &mut HashMap<String, HashSet<String>>,
    key: &str,
    client_id: &str,
) -> bool {
    let Some(set) = index.get_mut(key) else {
        return false;
    };
    set.remove(client_id);
    if set.is_empty() {
        index.remove(key);
        true
    } else {
        false
    }
}

/// Read-only view of a connected client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub client_id: String,
    pub user_id: String,
    pub sandboxes: HashSet<String>,
    pub sessions: HashSet<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub pinged: usize,
    pub removed: Vec<String>,
    /// Sandboxes whose last subscriber was among the removed clients
    pub orphaned_sandboxes: Vec<String>,
}

pub struct Hub {
    registry: RwLock<Registry>,
    client_capacity: usize,
}

impl Hub {
    pub fn new(client_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            client_capacity: client_capacity.max(1),
        }
    }

    /// Register a connection and return its id with the receiving half of its channel
    pub async fn register(&self, user_id: &str) -> (String, mpsc::Receiver<Envelope>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(self.client_capacity);

        self.registry.write().await.clients.insert(
            client_id.clone(),
            ClientState {
                user_id: user_id.to_string(),
                sender,
                sandboxes: HashSet::new(),
                sessions: HashSet::new(),
                last_activity: Utc::now(),
            },
        );

        debug!("Registered client {} for user {}", client_id, user_id);
        (client_id, receiver)
    }

    /// Remove a client and all of its subscriptions.
    ///
    /// Returns the sandboxes that no longer have any subscriber.
    pub async fn unregister(&self, client_id: &str) -> Vec<String> {
        let orphaned = self
            .registry
            .write()
            .await
            .remove_client(client_id)
            .unwrap_or_default();

        debug!("Unregistered client {}", client_id);
        orphaned
    }

    /// Subscribe a client to a sandbox. Returns false if it already was.
    pub async fn subscribe_sandbox(&self, client_id: &str, sandbox_id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let client = registry
            .clients
            .get_mut(client_id)
            .ok_or_else(|| client_not_found(client_id))?;

        if !client.sandboxes.insert(sandbox_id.to_string()) {
            return Ok(false);
        }
        client.last_activity = Utc::now();

        registry
            .sandbox_subscribers
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(client_id.to_string());

        Ok(true)
    }

    /// Unsubscribe a client from a sandbox. Unknown subscriptions are a no-op.
    ///
    /// Returns true when this call removed the sandbox's last subscriber.
    pub async fn unsubscribe_sandbox(&self, client_id: &str, sandbox_id: &str) -> bool {
        let mut registry = self.registry.write().await;

        let removed = registry
            .clients
            .get_mut(client_id)
            .map(|c| c.sandboxes.remove(sandbox_id))
            .unwrap_or(false);

        if !removed {
            return false;
        }

        remove_from_index(&mut registry.sandbox_subscribers, sandbox_id, client_id);
        !registry.sandbox_subscribers.contains_key(sandbox_id)
    }

    /// Remove every subscription to a sandbox. Returns how many clients were subscribed.
    pub async fn drop_sandbox(&self, sandbox_id: &str) -> usize {
        let mut registry = self.registry.write().await;

        let Some(subscribers) = registry.sandbox_subscribers.remove(sandbox_id) else {
            return 0;
        };
        for client_id in &subscribers {
            if let Some(client) = registry.clients.get_mut(client_id) {
                client.sandboxes.remove(sandbox_id);
            }
        }

        debug!(
            "Dropped {} subscriptions to sandbox {}",
            subscribers.len(),
            sandbox_id
        );
        subscribers.len()
    }

    pub async fn subscribe_session(&self, client_id: &str, session_id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let client = registry
            .clients
            .get_mut(client_id)
            .ok_or_else(|| client_not_found(client_id))?;

        if !client.sessions.insert(session_id.to_string()) {
            return Ok(false);
        }
        client.last_activity = Utc::now();

        registry
            .session_subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());

        Ok(true)
    }

    pub async fn unsubscribe_session(&self, client_id: &str, session_id: &str) {
        let mut registry = self.registry.write().await;

        let removed = registry
            .clients
            .get_mut(client_id)
            .map(|c| c.sessions.remove(session_id))
            .unwrap_or(false);

        if removed {
            remove_from_index(&mut registry.session_subscribers, session_id, client_id);
        }
    }

    /// Deliver to every subscriber of a sandbox. Returns the number of clients reached.
    pub async fn broadcast_to_sandbox(&self, sandbox_id: &str, message: Envelope) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            registry.senders_for(&registry.sandbox_subscribers, sandbox_id)
        };
        deliver(targets, message)
    }

    /// Deliver to every subscriber of a session. Returns the number of clients reached.
    pub async fn broadcast_to_session(&self, session_id: &str, message: Envelope) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            registry.senders_for(&registry.session_subscribers, session_id)
        };
        deliver(targets, message)
    }

    /// Send to a single client. Returns false if it is gone or its queue is full.
    pub async fn send_to_client(&self, client_id: &str, message: Envelope) -> bool {
        let sender = self
            .registry
            .read()
            .await
            .clients
            .get(client_id)
            .map(|c| c.sender.clone());

        match sender {
            Some(sender) => deliver(vec![(client_id.to_string(), sender)], message) == 1,
            None => false,
        }
    }

    /// Record activity from a client
    pub async fn touch(&self, client_id: &str) {
        if let Some(client) = self.registry.write().await.clients.get_mut(client_id) {
            client.last_activity = Utc::now();
        }
    }

    /// Ping every open connection and drop the ones found closed
    pub async fn health_check(&self) -> HealthReport {
        let clients: Vec<(String, mpsc::Sender<Envelope>)> = self
            .registry
            .read()
            .await
            .clients
            .iter()
            .map(|(id, c)| (id.clone(), c.sender.clone()))
            .collect();

        let mut report = HealthReport::default();
        for (client_id, sender) in clients {
            if sender.is_closed() {
                report.removed.push(client_id);
                continue;
            }
            match sender.try_send(Envelope::ping()) {
                Ok(()) => report.pinged += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Skipping ping for busy client {}", client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => report.removed.push(client_id),
            }
        }

        if !report.removed.is_empty() {
            let mut registry = self.registry.write().await;
            for client_id in &report.removed {
                if let Some(orphaned) = registry.remove_client(client_id) {
                    report.orphaned_sandboxes.extend(orphaned);
                }
            }
            info!(
                "Health check removed {} closed connections",
                report.removed.len()
            );
        }

        report
    }

    /// Drop every client. Their receivers observe the channel closing.
    pub async fn close_all(&self) -> usize {
        let mut registry = self.registry.write().await;
        let count = registry.clients.len();
        *registry = Registry::default();

        if count > 0 {
            info!("Closed {} client connections", count);
        }
        count
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    pub async fn sandbox_subscriber_count(&self, sandbox_id: &str) -> usize {
        self.registry
            .read()
            .await
            .sandbox_subscribers
            .get(sandbox_id)
            .map_or(0, HashSet::len)
    }

    pub async fn session_subscriber_count(&self, session_id: &str) -> usize {
        self.registry
            .read()
            .await
            .session_subscribers
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    pub async fn client(&self, client_id: &str) -> Option<ClientSnapshot> {
        self.registry
            .read()
            .await
            .clients
            .get(client_id)
            .map(|c| ClientSnapshot {
                client_id: client_id.to_string(),
                user_id: c.user_id.clone(),
                sandboxes: c.sandboxes.clone(),
                sessions: c.sessions.clone(),
                last_activity: c.last_activity,
            })
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_CAPACITY)
    }
}

fn client_not_found(client_id: &str) -> SandboxError {
    SandboxError::NotFound {
        kind: "Client",
        id: client_id.to_string(),
    }
}

/// Non-blocking fan-out; closed or full clients are skipped
fn deliver(targets: Vec<(String, mpsc::Sender<Envelope>)>, message: Envelope) -> usize {
    let mut delivered = 0;
    for (client_id, sender) in targets {
        match sender.try_send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client {} is not keeping up, dropping message", client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Skipping closed client {}", client_id);
            }
        }
    }
    delivered
}
