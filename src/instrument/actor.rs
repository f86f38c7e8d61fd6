//! The task that owns the link to the analyzer.
//!
//! One task owns the transport, the [`Dispatcher`] and the [`SweepMachine`]. All
//! protocol state is mutated here and nowhere else. The event loop waits on four
//! sources at once and handles each event to completion before the next:
//!
//! - caller requests (mpsc)
//! - bytes from the bridge
//! - the response deadline of the outstanding command
//! - the poll-hold timer of the sweep machine
//!
//! Both timers are plain deadlines evaluated by `tokio::select!`; nothing polls or
//! spins while waiting.

use std::collections::{HashMap, VecDeque};
use std::future::pending;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::messages::InstrumentRequest;
use super::InstrumentEvent;
use crate::bridge::{ConnectionState, PrologixBridge};
use crate::error::{AppResult, VnaError};
use crate::protocol::decoder::Response;
use crate::protocol::dispatcher::{CommandId, DispatchEvent, Dispatcher};
use crate::sweep::machine::{SweepAction, SweepMachine, SweepNotification};
use crate::sweep::state::SweepState;

/// Read buffer size; larger replies simply take several reads.
const READ_CHUNK: usize = 4096;

/// Completes at `deadline`, or never.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Owner of all protocol state for one analyzer.
pub(crate) struct InstrumentActor<T> {
    writer: WriteHalf<T>,
    bridge: PrologixBridge,
    dispatcher: Dispatcher,
    machine: SweepMachine,
    /// Direct commands waiting for their response, by dispatcher id.
    waiters: HashMap<CommandId, oneshot::Sender<AppResult<Response>>>,
    poll_deadline: Option<Instant>,
    events: broadcast::Sender<InstrumentEvent>,
    state_tx: watch::Sender<SweepState>,
    connection_tx: watch::Sender<ConnectionState>,
}

impl<T> InstrumentActor<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        writer: WriteHalf<T>,
        bridge: PrologixBridge,
        dispatcher: Dispatcher,
        machine: SweepMachine,
        events: broadcast::Sender<InstrumentEvent>,
        state_tx: watch::Sender<SweepState>,
        connection_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            writer,
            bridge,
            dispatcher,
            machine,
            waiters: HashMap::new(),
            poll_deadline: None,
            events,
            state_tx,
            connection_tx,
        }
    }

    fn connected(&self) -> bool {
        *self.connection_tx.borrow() == ConnectionState::Connected
    }

    /// Run the event loop until shutdown or until every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut reader: tokio::io::ReadHalf<T>,
        mut requests: mpsc::Receiver<InstrumentRequest>,
    ) {
        info!(address = self.bridge.gpib_address(), "Instrument task started");

        match self.bridge.initialize(&mut self.writer).await {
            Ok(()) => self.set_connection(ConnectionState::Connected),
            Err(e) => {
                let events = self.disconnect(e);
                self.process(events).await;
            }
        }

        let mut buf = vec![0u8; READ_CHUNK];
        let mut shutdown_reply = None;

        loop {
            let response_deadline = self.dispatcher.deadline();
            let poll_deadline = self.poll_deadline;
            let reading = self.connected();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(InstrumentRequest::Shutdown { response }) => {
                        info!("Shutdown requested");
                        shutdown_reply = Some(response);
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },

                read = reader.read(&mut buf), if reading => {
                    let events = match read {
                        Ok(0) => {
                            self.disconnect(VnaError::Io("bridge closed the connection".into()))
                        }
                        Ok(n) => self.dispatcher.on_bytes(&buf[..n], Instant::now()),
                        Err(e) => self.disconnect(e.into()),
                    };
                    self.process(events).await;
                }

                _ = sleep_until_opt(response_deadline) => {
                    let events = self.dispatcher.on_timer(Instant::now());
                    self.process(events).await;
                }

                _ = sleep_until_opt(poll_deadline) => {
                    self.poll_deadline = None;
                    let actions = self.machine.on_poll_timer();
                    let events = self.apply(actions, Instant::now());
                    self.process(events).await;
                }
            }
        }

        self.close().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Instrument task stopped");
    }

    async fn handle_request(&mut self, request: InstrumentRequest) {
        let now = Instant::now();
        match request {
            InstrumentRequest::Execute { command, response } => {
                if !self.connected() {
                    let _ = response.send(Err(VnaError::NotConnected));
                    return;
                }
                let (id, events) = self.dispatcher.enqueue(command, now);
                self.waiters.insert(id, response);
                self.process(events).await;
            }
            InstrumentRequest::Configure {
                parameters,
                response,
            } => {
                let _ = response.send(self.machine.configure(parameters));
            }
            InstrumentRequest::Initialize { setup, response } => {
                if !self.connected() {
                    let _ = response.send(Err(VnaError::NotConnected));
                    return;
                }
                match self.machine.initialize(&setup) {
                    Ok(actions) => {
                        let _ = response.send(Ok(()));
                        let events = self.apply(actions, now);
                        self.process(events).await;
                    }
                    Err(e) => {
                        let _ = response.send(Err(e));
                    }
                }
            }
            InstrumentRequest::StartSweep { mode, response } => {
                if !self.connected() {
                    let _ = response.send(Err(VnaError::NotConnected));
                    return;
                }
                match self.machine.start(mode) {
                    Ok(actions) => {
                        let _ = response.send(Ok(()));
                        let events = self.apply(actions, now);
                        self.process(events).await;
                    }
                    Err(e) => {
                        let _ = response.send(Err(e));
                    }
                }
            }
            InstrumentRequest::CancelSweep { response } => {
                let actions = self.machine.cancel();
                let events = self.apply(actions, now);
                let _ = response.send(());
                self.process(events).await;
            }
            InstrumentRequest::FinishContinuous { response } => {
                self.machine.finish_continuous();
                let _ = response.send(());
            }
            InstrumentRequest::Shutdown { response } => {
                // Handled by the event loop
                let _ = response.send(());
            }
        }
    }

    /// Carry out sweep actions; returns dispatcher events caused by enqueued commands.
    fn apply(&mut self, actions: Vec<SweepAction>, now: Instant) -> Vec<DispatchEvent> {
        let mut events = Vec::new();
        for action in actions {
            match action {
                SweepAction::Send(command) => {
                    let (id, transmit) = self.dispatcher.enqueue(command, now);
                    self.machine.bind(id);
                    events.extend(transmit);
                }
                SweepAction::SchedulePoll(delay) => self.poll_deadline = Some(now + delay),
                SweepAction::CancelPoll => self.poll_deadline = None,
                SweepAction::Notify(notification) => self.notify(notification),
            }
        }
        events
    }

    /// Work through dispatcher events until nothing is left to do.
    async fn process(&mut self, events: Vec<DispatchEvent>) {
        let mut work: VecDeque<DispatchEvent> = events.into();
        while let Some(event) = work.pop_front() {
            match event {
                DispatchEvent::Transmit { id, command } => {
                    if !self.connected() {
                        continue;
                    }
                    if let Err(e) = self.bridge.send(&mut self.writer, &command.text).await {
                        error!(id, error = %e, "Write to bridge failed");
                        work.extend(self.disconnect(e));
                    }
                }
                DispatchEvent::Completed {
                    id,
                    kind,
                    channel: _,
                    response,
                } => {
                    if let Err(VnaError::Decode { kind, reason }) = &response {
                        self.publish(InstrumentEvent::DecodeError {
                            kind: *kind,
                            reason: reason.clone(),
                        });
                    }
                    if let Some(waiter) = self.waiters.remove(&id) {
                        let _ = waiter.send(response);
                    } else {
                        let actions = self.machine.on_response(id, kind, response);
                        work.extend(self.apply(actions, Instant::now()));
                    }
                }
                DispatchEvent::Failed {
                    id,
                    kind,
                    channel,
                    error,
                } => {
                    match &error {
                        VnaError::Timeout { .. } => {
                            self.publish(InstrumentEvent::Timeout { kind, channel });
                        }
                        VnaError::Framing { reason, .. } => {
                            self.publish(InstrumentEvent::FramingError {
                                kind,
                                reason: reason.clone(),
                            });
                        }
                        _ => {}
                    }
                    if let Some(waiter) = self.waiters.remove(&id) {
                        let _ = waiter.send(Err(error));
                    } else {
                        let actions = self.machine.on_failure(id, error);
                        work.extend(self.apply(actions, Instant::now()));
                    }
                }
            }
        }
    }

    fn notify(&mut self, notification: SweepNotification) {
        let event = match notification {
            SweepNotification::StateChanged(state) => {
                self.state_tx.send_replace(state);
                InstrumentEvent::StateChanged(state)
            }
            SweepNotification::Completed(result) => {
                InstrumentEvent::SweepComplete(std::sync::Arc::new(result))
            }
            SweepNotification::Cancelled => InstrumentEvent::SweepCancelled,
            SweepNotification::Initialized => InstrumentEvent::Initialized,
            SweepNotification::Aborted { state, error } => {
                InstrumentEvent::SweepAborted { state, error }
            }
        };
        self.publish(event);
    }

    fn publish(&self, event: InstrumentEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_connection(&mut self, state: ConnectionState) {
        let previous = self.connection_tx.send_replace(state);
        if previous != state {
            info!(%state, "Bridge connection state changed");
            self.publish(InstrumentEvent::ConnectionStateChanged(state));
        }
    }

    /// Mark the link down, abandon the running sequence and fail every queued command.
    fn disconnect(&mut self, cause: VnaError) -> Vec<DispatchEvent> {
        warn!(error = %cause, "Bridge link lost");
        self.set_connection(ConnectionState::Unconnected);
        self.poll_deadline = None;
        let actions = self.machine.reset(VnaError::NotConnected);
        self.apply(actions, Instant::now());
        self.dispatcher.clear(VnaError::NotConnected)
    }

    async fn close(&mut self) {
        self.poll_deadline = None;
        let actions = self.machine.reset(VnaError::ActorGone);
        self.apply(actions, Instant::now());
        let events = self.dispatcher.clear(VnaError::ActorGone);
        self.process(events).await;
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(VnaError::ActorGone));
        }
        if self.connected() {
            use tokio::io::AsyncWriteExt;
            let _ = self.writer.shutdown().await;
        }
        self.set_connection(ConnectionState::Unconnected);
    }
}
