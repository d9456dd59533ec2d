// ABOUTME: Dispatches inbound client envelopes to subscriptions, log streams and terminal sessions
// ABOUTME: Failures are answered with an error envelope to the sending client only

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::hub::Hub;
use crate::protocol::{Envelope, MessageType, SandboxTarget, TerminalInput, TerminalResize};
use crate::sessions::SessionManager;
use crate::storage::{SandboxStatus, SandboxStorage};
use crate::streaming::LogStreamer;

pub struct Gateway {
    hub: Arc<Hub>,
    storage: Arc<SandboxStorage>,
    sessions: Arc<SessionManager>,
    streamer: Arc<LogStreamer>,
}

impl Gateway {
    pub fn new(
        hub: Arc<Hub>,
        storage: Arc<SandboxStorage>,
        sessions: Arc<SessionManager>,
        streamer: Arc<LogStreamer>,
    ) -> Self {
        Self {
            hub,
            storage,
            sessions,
            streamer,
        }
    }

    /// Register a new connection for a user
    pub async fn connect(&self, user_id: &str) -> (String, mpsc::Receiver<Envelope>) {
        self.hub.register(user_id).await
    }

    /// Drop a connection and close log streams nobody watches anymore
    pub async fn disconnect(&self, client_id: &str) {
        for sandbox_id in self.hub.unregister(client_id).await {
            self.streamer.stop_stream(&sandbox_id).await;
        }
    }

    /// Handle one raw text frame from a client
    pub async fn handle_text(&self, client_id: &str, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.handle_message(client_id, envelope).await,
            Err(e) => {
                debug!("Malformed message from client {}: {}", client_id, e);
                self.hub
                    .send_to_client(client_id, Envelope::error(format!("Malformed message: {}", e)))
                    .await;
            }
        }
    }

    pub async fn handle_message(&self, client_id: &str, envelope: Envelope) {
        self.hub.touch(client_id).await;

        let message_type = envelope.message_type;
        if let Err(e) = self.dispatch(client_id, envelope).await {
            warn!(
                "Failed to handle {:?} from client {}: {}",
                message_type, client_id, e
            );
            self.hub
                .send_to_client(client_id, Envelope::error(e.to_string()))
                .await;
        }
    }

    async fn dispatch(&self, client_id: &str, envelope: Envelope) -> Result<()> {
        match envelope.message_type {
            MessageType::SandboxSubscribe => {
                let target: SandboxTarget = decode(&envelope)?;
                self.subscribe(client_id, &target.sandbox_id).await?;
            }
            MessageType::LogSubscribe => {
                let target: SandboxTarget = decode(&envelope)?;
                let status = self.subscribe(client_id, &target.sandbox_id).await?;
                if status == SandboxStatus::Running {
                    self.streamer.ensure_stream(&target.sandbox_id).await?;
                }
            }
            MessageType::SandboxUnsubscribe | MessageType::LogUnsubscribe => {
                let target: SandboxTarget = decode(&envelope)?;
                if self
                    .hub
                    .unsubscribe_sandbox(client_id, &target.sandbox_id)
                    .await
                {
                    self.streamer.stop_stream(&target.sandbox_id).await;
                }
            }
            MessageType::TerminalInput => {
                let input: TerminalInput = decode(&envelope)?;
                self.attach(client_id, &input.session_id).await?;
                self.sessions
                    .send_input(&input.session_id, &input.data)
                    .await?;
                self.echo_screen(&input.session_id).await?;
            }
            MessageType::TerminalResize => {
                let resize: TerminalResize = decode(&envelope)?;
                self.attach(client_id, &resize.session_id).await?;
                self.sessions
                    .resize(&resize.session_id, resize.cols, resize.rows)
                    .await?;
                self.echo_screen(&resize.session_id).await?;
            }
            MessageType::Ping => {
                self.hub.send_to_client(client_id, Envelope::pong()).await;
            }
            MessageType::Pong => {}
            other => {
                return Err(SandboxError::InvalidRequest(format!(
                    "Clients may not send {:?} messages",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Subscribe to a sandbox and send its current status. Returns that status.
    async fn subscribe(&self, client_id: &str, sandbox_id: &str) -> Result<SandboxStatus> {
        let sandbox = self.storage.get_sandbox(sandbox_id).await?;

        if self.hub.subscribe_sandbox(client_id, sandbox_id).await? {
            self.hub
                .send_to_client(
                    client_id,
                    Envelope::sandbox_status(
                        sandbox_id,
                        sandbox.status,
                        sandbox.error_message.as_deref(),
                    ),
                )
                .await;
        }
        Ok(sandbox.status)
    }

    async fn attach(&self, client_id: &str, session_id: &str) -> Result<()> {
        self.hub.subscribe_session(client_id, session_id).await?;
        self.sessions.record_activity(session_id).await?;
        Ok(())
    }

    async fn echo_screen(&self, session_id: &str) -> Result<()> {
        let screen = self.sessions.capture_output(session_id).await?;
        self.hub
            .broadcast_to_session(session_id, Envelope::terminal_output(session_id, &screen))
            .await;
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    envelope.payload_as().map_err(|e| {
        SandboxError::InvalidRequest(format!(
            "Invalid {:?} payload: {}",
            envelope.message_type, e
        ))
    })
}
