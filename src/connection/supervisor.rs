//! Owns the connection state machine and the live connection handle.
//!
//! Every state change goes through [`ConnectionSupervisor`] and is announced on the
//! status sink. Connection events are consumed by a reaction task spawned per
//! connection attempt; events from an attempt that has since been stopped or
//! replaced are ignored.

use super::state::ConnectionState;
use super::traits::{ConnectionEvent, ConnectionFactory, ConnectionHandle, HealthCode, LostReason};
use crate::health;
use crate::pipeline::{InboundMessage, OutboundReply, ReplyTransport};
use crate::status_events::{StatusEvent, StatusPayload, StatusSink};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

const HEALTH_COMPONENT: &str = "connection";

/// Buffer for inbound messages waiting on the pipeline.
pub const INBOUND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to create connection: {0}")]
    Factory(String),
    #[error("failed to close connection: {0}")]
    Close(String),
}

/// Point-in-time view of the supervisor, for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub state: ConnectionState,
    pub challenge: Option<String>,
    pub last_error: Option<String>,
    pub session_id: String,
    pub has_handle: bool,
}

struct Inner {
    state: ConnectionState,
    challenge: Option<String>,
    last_error: Option<String>,
    handle: Option<Arc<dyn ConnectionHandle>>,
    /// Bumped on every start, stop and recovery. Reaction tasks exit once stale.
    generation: u64,
}

pub struct ConnectionSupervisor {
    session_id: String,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn StatusSink>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inner: Mutex<Inner>,
}

impl ConnectionSupervisor {
    /// Build a supervisor in `OFFLINE`. Inbound chat messages from every
    /// connection it opens arrive on the returned receiver, in arrival order.
    pub fn new(
        session_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        sink: Arc<dyn StatusSink>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let supervisor = Arc::new(Self {
            session_id: session_id.into(),
            factory,
            sink,
            inbound_tx,
            inner: Mutex::new(Inner {
                state: ConnectionState::Offline,
                challenge: None,
                last_error: None,
                handle: None,
                generation: 0,
            }),
        });
        (supervisor, inbound_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current state and pending auth challenge.
    pub fn current_state(&self) -> (ConnectionState, Option<String>) {
        let inner = self.inner.lock();
        (inner.state, inner.challenge.clone())
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let inner = self.inner.lock();
        SupervisorSnapshot {
            state: inner.state,
            challenge: inner.challenge.clone(),
            last_error: inner.last_error.clone(),
            session_id: self.session_id.clone(),
            has_handle: inner.handle.is_some(),
        }
    }

    /// Open a connection.
    ///
    /// A no-op returning the current state while an attempt is in flight or
    /// established. Factory failures move to `ERROR` and are returned, never
    /// retried here.
    pub async fn start(self: &Arc<Self>) -> Result<ConnectionState, SupervisorError> {
        let (generation, previous) = {
            let mut inner = self.inner.lock();
            if inner.state.is_active() {
                tracing::debug!(state = %inner.state, "Connection already active, start ignored");
                return Ok(inner.state);
            }
            inner.generation += 1;
            inner.state = ConnectionState::Initializing;
            inner.challenge = None;
            inner.last_error = None;
            (inner.generation, inner.handle.take())
        };
        self.announce();

        if let Some(old) = previous {
            close_quietly(old).await;
        }

        tracing::info!(
            session = %self.session_id,
            factory = self.factory.name(),
            "Starting connection"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(self).react(generation, events_rx));

        match self.factory.create(&self.session_id, events_tx).await {
            Ok(handle) => {
                let (discard, state) = {
                    let mut inner = self.inner.lock();
                    if inner.generation != generation
                        || inner.state == ConnectionState::Disconnected
                    {
                        (Some(handle), inner.state)
                    } else {
                        inner.handle = Some(handle);
                        (None, inner.state)
                    }
                };
                if let Some(handle) = discard {
                    tracing::debug!("Connection superseded before it was stored; closing it");
                    close_quietly(handle).await;
                } else {
                    health::mark_component_ok(HEALTH_COMPONENT);
                }
                Ok(state)
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!("Connection factory failed: {reason}");
                health::mark_component_error(HEALTH_COMPONENT, &reason);
                let current = self.inner.lock().generation == generation;
                if current {
                    self.transition(ConnectionState::Error, |inner| {
                        inner.challenge = None;
                        inner.last_error = Some(reason.clone());
                    });
                }
                Err(SupervisorError::Factory(reason))
            }
        }
    }

    /// Close the connection and go `OFFLINE`.
    ///
    /// Always ends in `OFFLINE`. A failed close is logged and returned after the
    /// state change.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let handle = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.handle.take()
        };
        self.transition(ConnectionState::Offline, |inner| {
            inner.challenge = None;
            inner.last_error = None;
        });

        let Some(handle) = handle else {
            return Ok(());
        };
        tracing::info!(session = %self.session_id, "Closing connection");
        match handle.close().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::warn!("Error while closing connection: {reason}");
                Err(SupervisorError::Close(reason))
            }
        }
    }

    /// Recover a `DISCONNECTED` or `ERROR` session: close-if-present, release
    /// the handle, then start again.
    ///
    /// In any other state nothing happens and the current state is returned, so
    /// a recovery racing an explicit start never replaces that attempt.
    pub async fn restart(self: &Arc<Self>) -> Result<ConnectionState, SupervisorError> {
        let handle = {
            let mut inner = self.inner.lock();
            if !inner.state.is_recoverable() {
                tracing::debug!(state = %inner.state, "Restart skipped, session not recoverable");
                return Ok(inner.state);
            }
            inner.generation += 1;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            close_quietly(handle).await;
        }
        health::bump_component_restart(HEALTH_COMPONENT);
        self.start().await
    }

    /// Health of the live connection, or `None` when no handle is held.
    pub async fn connection_health(&self) -> Option<anyhow::Result<HealthCode>> {
        let handle = self.inner.lock().handle.clone()?;
        Some(handle.health().await)
    }

    async fn react(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if self.inner.lock().generation != generation {
                tracing::debug!("Dropping event from a stale connection");
                break;
            }
            match event {
                ConnectionEvent::AuthChallenge(payload) => self.on_auth_challenge(payload),
                ConnectionEvent::Ready => self.on_ready(),
                ConnectionEvent::Lost(reason) => self.on_lost(&reason),
                ConnectionEvent::Conflict => self.on_conflict().await,
                ConnectionEvent::Message(message) => {
                    if self.inbound_tx.send(message).await.is_err() {
                        tracing::warn!("Inbound consumer is gone; dropping message");
                    }
                }
            }
        }
    }

    fn on_auth_challenge(&self, payload: String) {
        let state = self.inner.lock().state;
        if !state.is_pairing() {
            tracing::debug!(%state, "Ignoring auth challenge outside pairing");
            return;
        }
        tracing::info!("Auth challenge received; waiting for pairing");
        self.transition(ConnectionState::AwaitingAuth, |inner| {
            inner.challenge = Some(payload.clone());
        });
        self.sink.notify(StatusEvent::Qr { qr: payload });
    }

    fn on_ready(&self) {
        let state = self.inner.lock().state;
        if !state.is_pairing() {
            tracing::debug!(%state, "Ignoring ready event");
            return;
        }
        tracing::info!(session = %self.session_id, "Connection ready");
        health::mark_component_ok(HEALTH_COMPONENT);
        self.transition(ConnectionState::Connected, |inner| {
            inner.challenge = None;
            inner.last_error = None;
        });
    }

    fn on_lost(&self, reason: &LostReason) {
        let released = {
            let mut inner = self.inner.lock();
            if !inner.state.is_active() {
                return;
            }
            inner.handle.take()
        };
        tracing::warn!(session = %self.session_id, "Connection lost: {reason}");
        health::mark_component_error(HEALTH_COMPONENT, format!("connection lost: {reason}"));
        self.transition(ConnectionState::Disconnected, |inner| {
            inner.challenge = None;
            inner.last_error = Some(reason.to_string());
        });
        drop(released);
    }

    async fn on_conflict(&self) {
        let Some(handle) = self.inner.lock().handle.clone() else {
            return;
        };
        tracing::warn!("Session opened elsewhere; taking it over");
        if let Err(e) = handle.take_over().await {
            tracing::warn!("Take-over failed: {e:#}");
        }
    }

    /// Apply a state change and announce it. Disallowed transitions are logged
    /// and skipped.
    fn transition<F>(&self, next: ConnectionState, update: F)
    where
        F: FnOnce(&mut Inner),
    {
        {
            let mut inner = self.inner.lock();
            if inner.state != next && !inner.state.can_transition_to(next) {
                tracing::warn!(from = %inner.state, to = %next, "Rejected state transition");
                return;
            }
            inner.state = next;
            update(&mut inner);
        }
        self.announce();
    }

    fn announce(&self) {
        let payload = {
            let inner = self.inner.lock();
            StatusPayload {
                status: inner.state,
                qr: inner.challenge.clone(),
                error: inner.last_error.clone(),
                session_id: self.session_id.clone(),
            }
        };
        tracing::info!(status = %payload.status, "Connection status");
        self.sink.notify(StatusEvent::Status(payload));
    }
}

async fn close_quietly(handle: Arc<dyn ConnectionHandle>) {
    if let Err(e) = handle.close().await {
        tracing::warn!("Error while closing connection: {e:#}");
    }
}

#[async_trait]
impl ReplyTransport for ConnectionSupervisor {
    async fn send_reply(&self, reply: &OutboundReply) -> anyhow::Result<()> {
        let handle = self
            .inner
            .lock()
            .handle
            .clone()
            .context("no active connection")?;
        handle
            .send(&reply.chat_id, &reply.text, reply.quoted_message_id.as_deref())
            .await
    }
}
