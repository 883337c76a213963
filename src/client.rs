//! The public client handle.
//!
//! [`Client`] is a cheap clone: every handle shares the same connection
//! actor, event registry and stats. Operations post commands to the actor
//! and resolve through oneshot replies, so calls are safe from any task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::Result;
use crate::config::ConnectionConfig;
use crate::connection::{Command, ConnectionActor, ConnectionState};
use crate::error::Error;
use crate::events::{Event, EventDispatcher, EventKind, ListenerId};
use crate::frame::{Envelope, Priority};
use crate::stats::{ConnectionStats, StatsAggregator};
use crate::transport::{Transport, WebSocketTransport};

/// Per-send delivery options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub priority: Priority,
    /// When set, delivery resolves only once the peer acks within the
    /// window. When `None`, delivery resolves as soon as the frame is
    /// handed to the transport.
    pub ack_timeout: Option<Duration>,
}

impl SendOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn ack_within(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }
}

/// Resolves when a sent message reaches its terminal outcome: transport
/// handoff (fire-and-forget), peer ack, or a definitive failure.
#[derive(Debug)]
#[must_use = "a delivery does nothing until awaited"]
pub struct Delivery {
    inner: oneshot::Receiver<Result<()>>,
}

impl Future for Delivery {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|reply| reply.unwrap_or_else(|_| Err(Error::cancelled())))
    }
}

/// Resilient duplex messaging client.
///
/// See the crate-level documentation for the lifecycle model. All methods
/// are callable from any task; `Clone` shares the underlying connection.
#[derive(Clone)]
pub struct Client {
    config: ConnectionConfig,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events: Arc<EventDispatcher>,
    stats: Arc<StatsAggregator>,
    seq: Arc<AtomicU64>,
}

impl Client {
    /// Create a client over the production WebSocket transport. No network
    /// activity happens until [`connect`](Self::connect).
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, WebSocketTransport)
    }

    /// Create a client over a custom [`Transport`], e.g. an in-process fake.
    #[must_use]
    pub fn with_transport(config: ConnectionConfig, transport: impl Transport) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let events = Arc::new(EventDispatcher::new());
        let stats = Arc::new(StatsAggregator::new());

        let actor = ConnectionActor::new(
            config.clone(),
            Arc::new(transport),
            command_rx,
            state_tx,
            Arc::clone(&events),
            Arc::clone(&stats),
        );
        drop(tokio::spawn(actor.run()));

        Self {
            config,
            commands: command_tx,
            state_rx,
            events,
            stats,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the connection and resolve once it is established.
    ///
    /// A no-op returning `Ok` when already open. While a reconnection is in
    /// progress, resolves together with the in-flight attempt.
    ///
    /// # Errors
    ///
    /// Fails when the connection attempt fails (the client returns to
    /// `Idle`) or when automatic reconnection gives up.
    pub async fn connect(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .map_err(|_| Error::cancelled())?;
        response.await.unwrap_or_else(|_| Err(Error::cancelled()))
    }

    /// Close the connection. Idempotent; outstanding deliveries reject with
    /// a cancellation error and no reconnection is scheduled.
    pub fn disconnect(&self) {
        drop(self.commands.send(Command::Disconnect));
    }

    /// Send an application message.
    ///
    /// Enqueueing is synchronous: once this returns `Ok`, the message holds
    /// its place in the outbound order even if the returned [`Delivery`] is
    /// awaited later (or never). Messages sent while disconnected are queued
    /// and flushed on the next successful connect.
    ///
    /// # Errors
    ///
    /// Fails only when the client has been shut down entirely.
    pub fn send(
        &self,
        msg_type: impl Into<String>,
        payload: Value,
        options: SendOptions,
    ) -> Result<Delivery> {
        let envelope = Envelope::new(
            self.seq.fetch_add(1, Ordering::Relaxed),
            msg_type.into(),
            payload,
            options.priority,
            self.config.send_retries,
        );
        let (reply, inner) = oneshot::channel();
        self.commands
            .send(Command::Send {
                envelope,
                ack_timeout: options.ack_timeout,
                reply,
            })
            .map_err(|_| Error::cancelled())?;
        Ok(Delivery { inner })
    }

    /// Send expecting a peer ack within the configured default window.
    ///
    /// # Errors
    ///
    /// Fails only when the client has been shut down entirely.
    pub fn send_acked(&self, msg_type: impl Into<String>, payload: Value) -> Result<Delivery> {
        self.send(
            msg_type,
            payload,
            SendOptions::new().ack_within(self.config.ack_timeout),
        )
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// Watch channel carrying every state transition, for callers that need
    /// to await a particular state rather than poll.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a listener for one event kind. The listener runs on the
    /// connection task; keep it brief and non-blocking.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        self.events.on(kind, listener)
    }

    /// Deregister a listener. Returns whether one was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        self.events.off(id)
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.config.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
