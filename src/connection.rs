#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

//! The connection actor: the one component with global visibility into the
//! lifecycle.
//!
//! All mutable state (the state machine, outbound queue, pending-ack table
//! and the heartbeat/sweep/reconnect timers) lives on this single task.
//! Public operations post [`Command`]s into it and suspend on oneshot
//! replies; timers and transport events are arms of the same `select!`
//! loop, so every mutation is serialized.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant as TokioInstant, MissedTickBehavior, interval_at};

use crate::Result;
use crate::config::ConnectionConfig;
use crate::error::{Error, Kind};
use crate::events::{Event, EventDispatcher};
use crate::frame::{Envelope, Frame, TYPE_ACK, TYPE_PING, TYPE_PONG, unix_millis};
use crate::pending::PendingAckTable;
use crate::queue::{EnqueueOutcome, OutboundQueue, QueuedSend};
use crate::stats::StatsAggregator;
use crate::transport::{Transport, TransportEvent, TransportHandle};

/// Connection lifecycle state. Exactly one holds at any instant; transitions
/// are the exclusive province of the connection actor.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never connected (or returned here after a failed connect)
    Idle,
    /// A connection attempt is in flight
    Connecting,
    /// Connected and exchanging frames
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Lost the connection; a reconnection attempt is scheduled
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Explicitly disconnected or reconnection exhausted. `connect()` reopens.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    Send {
        envelope: Envelope,
        ack_timeout: Option<Duration>,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum SessionExit {
    /// Caller-initiated shutdown; do not reconnect
    Shutdown,
    /// Transport failure or heartbeat verdict
    Lost { code: Option<u16>, reason: String },
}

enum OpenOutcome {
    Opened(TransportHandle),
    Failed(Error),
    /// Disconnected (or all handles dropped) mid-attempt
    Cancelled,
}

pub(crate) struct ConnectionActor {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    events: Arc<EventDispatcher>,
    stats: Arc<StatsAggregator>,
    queue: OutboundQueue,
    pending: PendingAckTable,
    /// Do-not-reconnect flag, set by explicit disconnect
    shutdown: bool,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        events: Arc<EventDispatcher>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        let queue = OutboundQueue::new(config.queue_capacity);
        Self {
            config,
            transport,
            commands,
            state_tx,
            events,
            stats,
            queue,
            pending: PendingAckTable::new(),
            shutdown: false,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Connect { reply } => self.run_lifecycle(reply).await,
                Command::Disconnect => {
                    self.cancel_outstanding();
                    self.set_state(ConnectionState::Closed);
                }
                Command::Send {
                    envelope,
                    ack_timeout,
                    reply,
                } => self.enqueue_offline(QueuedSend::new(envelope, reply, ack_timeout)),
            }
        }
        // Every client handle dropped
        self.cancel_outstanding();
    }

    /// One connected lifecycle: explicit connect, then sessions interleaved
    /// with reconnection attempts until shutdown, terminal failure, or a
    /// failed explicit connect.
    async fn run_lifecycle(&mut self, reply: oneshot::Sender<Result<()>>) {
        self.shutdown = false;
        let mut waiters = vec![reply];
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            self.events.dispatch(&Event::Connecting);
            let started = Instant::now();

            match self.attempt_open(&mut waiters).await {
                OpenOutcome::Opened(handle) => {
                    attempt = 0;
                    backoff.reset();
                    let latency = started.elapsed();
                    self.set_state(ConnectionState::Open {
                        since: Instant::now(),
                    });
                    for waiter in waiters.drain(..) {
                        drop(waiter.send(Ok(())));
                    }
                    tracing::info!(endpoint = %self.config.endpoint, ?latency, "connection open");
                    self.events.dispatch(&Event::Connected { latency });

                    match self.session(handle).await {
                        SessionExit::Shutdown => {
                            self.finish_closed();
                            return;
                        }
                        SessionExit::Lost { code, reason } => {
                            tracing::warn!(?code, %reason, "connection lost");
                            self.events.dispatch(&Event::Disconnected { code, reason });
                            if self.shutdown {
                                self.finish_closed();
                                return;
                            }
                        }
                    }
                }
                OpenOutcome::Cancelled => {
                    self.finish_closed();
                    return;
                }
                OpenOutcome::Failed(e) if attempt == 0 => {
                    // Explicit connect failed: reject the caller, stay Idle.
                    // The reconnection scheduler only serves unexpected closes.
                    tracing::warn!(error = %e, "connect failed");
                    self.events.dispatch(&Event::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    let reason = e.to_string();
                    let mut rejected = waiters.drain(..);
                    if let Some(first) = rejected.next() {
                        drop(first.send(Err(e)));
                    }
                    for waiter in rejected {
                        drop(waiter.send(Err(Error::connection(reason.clone()))));
                    }
                    self.set_state(ConnectionState::Idle);
                    return;
                }
                OpenOutcome::Failed(e) => {
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                    self.events.dispatch(&Event::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }

            attempt = attempt.saturating_add(1);
            if let Some(max) = self.config.reconnect.max_attempts
                && attempt > max
            {
                let err = Error::max_reconnects(max);
                tracing::error!(%err, "giving up automatic reconnection");
                self.events.dispatch(&Event::Error {
                    kind: Kind::MaxReconnects,
                    message: err.to_string(),
                });
                for waiter in waiters.drain(..) {
                    drop(waiter.send(Err(Error::max_reconnects(max))));
                }
                self.finish_closed();
                return;
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_interval);
            self.stats.record_reconnect();
            self.set_state(ConnectionState::Reconnecting { attempt });
            self.events.dispatch(&Event::Reconnecting { attempt, delay });
            if !self.backoff_wait(delay, &mut waiters).await {
                self.finish_closed();
                return;
            }
        }
    }

    /// Drive one open attempt to its outcome while still serving commands
    /// and ack sweeps, so a slow handshake neither stalls expiry nor makes
    /// the attempt uncancellable.
    async fn attempt_open(
        &mut self,
        waiters: &mut Vec<oneshot::Sender<Result<()>>>,
    ) -> OpenOutcome {
        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let open = async move { transport.open(&config).await };
        tokio::pin!(open);
        let deadline = tokio::time::sleep(self.config.connect_timeout);
        tokio::pin!(deadline);
        let sweep_period = self.config.sweep_interval();
        let mut sweep = interval_at(TokioInstant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut open => return match result {
                    Ok(handle) => OpenOutcome::Opened(handle),
                    Err(e) => OpenOutcome::Failed(e),
                },
                () = &mut deadline => {
                    return OpenOutcome::Failed(Error::connection(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    )));
                }
                _ = sweep.tick() => {
                    let _expired = self.pending.sweep(Instant::now());
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect { reply }) => waiters.push(reply),
                    Some(Command::Send { envelope, ack_timeout, reply }) => {
                        self.enqueue_offline(QueuedSend::new(envelope, reply, ack_timeout));
                    }
                    Some(Command::Disconnect) | None => {
                        self.shutdown = true;
                        for waiter in waiters.drain(..) {
                            drop(waiter.send(Err(Error::cancelled())));
                        }
                        return OpenOutcome::Cancelled;
                    }
                },
            }
        }
    }

    /// Pump one open connection until it is lost or shut down.
    async fn session(&mut self, handle: TransportHandle) -> SessionExit {
        let TransportHandle {
            outgoing,
            mut incoming,
        } = handle;

        let mut heartbeat = interval_at(
            TokioInstant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_period = self.config.sweep_interval();
        let mut sweep = interval_at(TokioInstant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_pong = Instant::now();
        let mut ping_sent_at: Option<Instant> = None;

        tracing::debug!(
            queued = self.queue.len(),
            pending = self.pending.len(),
            "session started"
        );
        self.drain(&outgoing);

        loop {
            tokio::select! {
                event = incoming.recv() => match event {
                    Some(TransportEvent::Frame { frame, bytes }) => {
                        self.handle_frame(&outgoing, frame, bytes, &mut last_pong, &mut ping_sent_at);
                    }
                    Some(TransportEvent::Malformed { reason }) => {
                        self.stats.record_error();
                        tracing::warn!(%reason, "dropping malformed inbound frame");
                    }
                    Some(TransportEvent::Error(e)) => {
                        self.stats.record_error();
                        return SessionExit::Lost { code: None, reason: e.to_string() };
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        return SessionExit::Lost { code, reason };
                    }
                    None => {
                        return SessionExit::Lost {
                            code: None,
                            reason: "transport task ended".to_owned(),
                        };
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send { envelope, ack_timeout, reply }) => {
                        let item = QueuedSend::new(envelope, reply, ack_timeout);
                        if let Err(item) = self.try_send_open(&outgoing, item) {
                            // A fresh arrival joins the back of its tier with
                            // its retry budget intact; the front slot belongs
                            // to drain resends.
                            self.enqueue_offline(item);
                        }
                    }
                    Some(Command::Connect { reply }) => {
                        // Already connected: no-op indication
                        drop(reply.send(Ok(())));
                    }
                    Some(Command::Disconnect) | None => {
                        self.shutdown = true;
                        return SessionExit::Shutdown;
                    }
                },
                _ = heartbeat.tick() => {
                    let silence = last_pong.elapsed();
                    if silence >= self.config.heartbeat_interval * self.config.missed_beat_tolerance {
                        tracing::warn!(?silence, "no pong within tolerance, presuming connection dead");
                        return SessionExit::Lost {
                            code: None,
                            reason: "heartbeat timeout".to_owned(),
                        };
                    }
                    ping_sent_at = Some(Instant::now());
                    let ping = Frame::control(TYPE_PING, json!({ "ts": unix_millis() }));
                    if outgoing.send(ping).is_err() {
                        return SessionExit::Lost {
                            code: None,
                            reason: "transport task ended".to_owned(),
                        };
                    }
                },
                _ = sweep.tick() => {
                    let _expired = self.pending.sweep(Instant::now());
                },
            }
        }
    }

    /// Demultiplex one inbound frame: control acks and pongs are intercepted,
    /// everything else is an application message.
    fn handle_frame(
        &mut self,
        outgoing: &mpsc::UnboundedSender<Frame>,
        frame: Frame,
        bytes: u64,
        last_pong: &mut Instant,
        ping_sent_at: &mut Option<Instant>,
    ) {
        match frame.frame_type.as_str() {
            TYPE_ACK => match frame.acked_id() {
                Some(id) => {
                    if !self.pending.resolve(&id) {
                        tracing::debug!(%id, "ack for unknown envelope, ignoring");
                    }
                }
                None => {
                    self.stats.record_error();
                    tracing::warn!(id = %frame.id, "ack frame without a resolvable id");
                }
            },
            TYPE_PONG => {
                *last_pong = Instant::now();
                if let Some(sent) = ping_sent_at.take() {
                    let latency = sent.elapsed();
                    self.stats.record_latency(latency);
                    self.events.dispatch(&Event::Heartbeat { latency });
                }
            }
            TYPE_PING => {
                // Remote liveness probe: echo the payload back
                drop(outgoing.send(Frame::control(TYPE_PONG, frame.data)));
            }
            _ => {
                self.stats.record_received(bytes);
                self.events.dispatch(&Event::Message { frame });
            }
        }
    }

    /// Flush the queue, highest-priority-oldest first, until it is empty or a
    /// send fails. A failed drain envelope spends a retry and returns to the
    /// front of its tier so it precedes everything younger.
    fn drain(&mut self, outgoing: &mpsc::UnboundedSender<Frame>) {
        while let Some(item) = self.queue.pop() {
            if let Err(item) = self.try_send_open(outgoing, item) {
                self.handle_send_failure(item);
                break;
            }
        }
    }

    /// Hand one envelope to the transport. On transport failure the item is
    /// returned so the caller decides where it re-enters the queue.
    fn try_send_open(
        &mut self,
        outgoing: &mpsc::UnboundedSender<Frame>,
        item: QueuedSend,
    ) -> std::result::Result<(), QueuedSend> {
        let frame = item.envelope.to_frame();
        let bytes = serde_json::to_vec(&frame).map_or(0, |v| v.len() as u64);
        if outgoing.send(frame).is_err() {
            return Err(item);
        }
        self.stats.record_sent(bytes);

        let QueuedSend {
            envelope,
            completion,
            ack_timeout,
        } = item;
        match (ack_timeout, completion) {
            // An abandoned waiter leaves nothing to resolve, so no entry
            (Some(window), Some(reply)) if !reply.is_closed() => {
                self.pending
                    .register(envelope.id, Instant::now() + window, reply);
            }
            (_, Some(reply)) => drop(reply.send(Ok(()))),
            _ => {}
        }
        Ok(())
    }

    fn handle_send_failure(&mut self, mut item: QueuedSend) {
        if item.envelope.retries_remaining > 0 {
            item.envelope.retries_remaining -= 1;
            match self.queue.requeue_front(item) {
                EnqueueOutcome::Queued => {}
                EnqueueOutcome::Evicted(victim) | EnqueueOutcome::Refused(victim) => {
                    self.report_overflow(victim);
                }
            }
        } else {
            self.stats.record_delivery_failure();
            let err = Error::max_retries(item.envelope.id);
            self.events.dispatch(&Event::Error {
                kind: Kind::MaxRetries,
                message: err.to_string(),
            });
            if let Some(reply) = item.completion.take() {
                drop(reply.send(Err(err)));
            }
        }
    }

    fn enqueue_offline(&mut self, item: QueuedSend) {
        match self.queue.enqueue(item) {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::Evicted(victim) | EnqueueOutcome::Refused(victim) => {
                self.report_overflow(victim);
            }
        }
    }

    fn report_overflow(&mut self, victim: QueuedSend) {
        self.stats.record_eviction();
        let err = Error::queue_overflow(victim.envelope.id);
        self.events.dispatch(&Event::Error {
            kind: Kind::QueueOverflow,
            message: err.to_string(),
        });
        if let Some(reply) = victim.completion {
            drop(reply.send(Err(err)));
        }
    }

    /// Wait out a reconnection delay while still serving commands. Returns
    /// `false` when the wait was cancelled by disconnect or client drop.
    async fn backoff_wait(
        &mut self,
        delay: Duration,
        waiters: &mut Vec<oneshot::Sender<Result<()>>>,
    ) -> bool {
        let sweep_period = self.config.sweep_interval();
        let mut sweep = interval_at(TokioInstant::now() + sweep_period, sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                _ = sweep.tick() => {
                    let _expired = self.pending.sweep(Instant::now());
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect { reply }) => waiters.push(reply),
                    Some(Command::Send { envelope, ack_timeout, reply }) => {
                        self.enqueue_offline(QueuedSend::new(envelope, reply, ack_timeout));
                    }
                    Some(Command::Disconnect) | None => {
                        self.shutdown = true;
                        for waiter in waiters.drain(..) {
                            drop(waiter.send(Err(Error::cancelled())));
                        }
                        return false;
                    }
                },
            }
        }
    }

    fn cancel_outstanding(&mut self) {
        for item in self.queue.drain_all() {
            if let Some(reply) = item.completion {
                drop(reply.send(Err(Error::cancelled())));
            }
        }
        self.pending.cancel_all();
    }

    fn finish_closed(&mut self) {
        self.cancel_outstanding();
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        drop(self.state_tx.send_replace(state));
    }
}
