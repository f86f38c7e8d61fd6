//! Caller-side handle to the instrument task and the builder that spawns it.
//!
//! Every method sends one request over the mpsc channel and awaits its oneshot reply.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::actor::InstrumentActor;
use super::messages::InstrumentRequest;
use super::InstrumentEvent;
use crate::bridge::{self, ConnectionState, PrologixBridge};
use crate::config::VnaConfig;
use crate::error::{AppResult, VnaError};
use crate::protocol::command::{
    CalibrationStep, Channel, Command, CommandKind, InstrumentParameters, MeasurementSetup,
};
use crate::protocol::decoder::Response;
use crate::protocol::dispatcher::{Dispatcher, DEFAULT_RESPONSE_TIMEOUT};
use crate::sweep::machine::{SweepMachine, SweepResult, DEFAULT_POLL_INTERVAL};
use crate::sweep::state::{SweepMode, SweepState};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Builder for spawning an [`Hp8751a`] task over any byte transport
///
/// # Example
///
/// ```no_run
/// use rust_vna::instrument::Hp8751aBuilder;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = tokio::net::TcpStream::connect("192.168.178.153:1234").await?;
/// let vna = Hp8751aBuilder::new()
///     .with_gpib_address(17)
///     .with_response_timeout(Duration::from_secs(5))
///     .spawn(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Hp8751aBuilder {
    gpib_address: u8,
    response_timeout: Duration,
    poll_interval: Duration,
    request_capacity: usize,
    event_capacity: usize,
    parameters: InstrumentParameters,
}

impl Default for Hp8751aBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Hp8751aBuilder {
    /// Builder with the default link settings (GPIB 17, 5 s response window, 500 ms poll).
    pub fn new() -> Self {
        Self {
            gpib_address: 17,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_capacity: 32,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            parameters: InstrumentParameters::default(),
        }
    }

    /// Builder populated from the loaded configuration.
    pub fn from_config(config: &VnaConfig) -> Self {
        Self::new()
            .with_gpib_address(config.bridge.gpib_address)
            .with_response_timeout(config.protocol.response_timeout)
            .with_poll_interval(config.protocol.poll_interval)
            .with_request_capacity(config.protocol.request_capacity)
            .with_parameters(config.sweep.clone())
    }

    /// Set the GPIB address of the analyzer
    pub fn with_gpib_address(mut self, address: u8) -> Self {
        self.gpib_address = address;
        self
    }

    /// Set the response window of every command
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the delay between completion polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the request channel capacity
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the parameters of the first sweep
    pub fn with_parameters(mut self, parameters: InstrumentParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Spawn the instrument task on the current tokio runtime.
    pub fn spawn<T>(self, transport: T) -> AppResult<Hp8751a>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let bridge = PrologixBridge::new(self.gpib_address)?;
        let mut machine = SweepMachine::new(self.poll_interval);
        machine.configure(self.parameters)?;

        let (reader, writer) = tokio::io::split(transport);
        let (request_tx, request_rx) = mpsc::channel(self.request_capacity.max(1));
        let (events, events_rx) = broadcast::channel(self.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SweepState::Idle);
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Connecting);

        let actor = InstrumentActor::new(
            writer,
            bridge,
            Dispatcher::new(self.response_timeout),
            machine,
            events,
            state_tx,
            connection_tx,
        );
        tokio::spawn(actor.run(reader, request_rx));

        Ok(Hp8751a {
            requests: request_tx,
            events: events_rx,
            state: state_rx,
            connection: connection_rx,
        })
    }
}

/// Caller handle of an HP 8751A behind a Prologix bridge.
///
/// Cloning is cheap; all clones talk to the same instrument task.
#[derive(Debug)]
pub struct Hp8751a {
    requests: mpsc::Sender<InstrumentRequest>,
    /// Never read; only resubscribed so the channel closes with the task.
    events: broadcast::Receiver<InstrumentEvent>,
    state: watch::Receiver<SweepState>,
    connection: watch::Receiver<ConnectionState>,
}

impl Clone for Hp8751a {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            events: self.events.resubscribe(),
            state: self.state.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl Hp8751a {
    /// Connect to the bridge described by `config` and spawn the instrument task.
    pub async fn connect(config: &VnaConfig) -> AppResult<Self> {
        config.validate()?;
        let stream = bridge::connect(&config.bridge).await?;
        Hp8751aBuilder::from_config(config).spawn(stream)
    }

    async fn request<R>(
        &self,
        (request, reply): (InstrumentRequest, oneshot::Receiver<R>),
    ) -> AppResult<R> {
        self.requests
            .send(request)
            .await
            .map_err(|_| VnaError::ActorGone)?;
        reply.await.map_err(|_| VnaError::ActorGone)
    }

    /// Enqueue `command` outside the sweep sequence and wait for its decoded response.
    pub async fn execute(&self, command: Command) -> AppResult<Response> {
        self.request(InstrumentRequest::execute(command)).await?
    }

    async fn execute_acknowledged(&self, command: Command) -> AppResult<()> {
        let kind = command.kind;
        match self.execute(command).await? {
            Response::Acknowledged => Ok(()),
            other => Err(unexpected(kind, &other)),
        }
    }

    /// Identification string of the instrument.
    pub async fn identify(&self) -> AppResult<String> {
        match self.execute(Command::identify()).await? {
            Response::Identity(id) => Ok(id),
            other => Err(unexpected(CommandKind::Identify, &other)),
        }
    }

    /// Select expanded or wrapped phase display on `channel`.
    pub async fn set_phase_format(&self, channel: Channel, unwrap_phase: bool) -> AppResult<()> {
        self.execute_acknowledged(Command::set_phase_format(channel, unwrap_phase))
            .await
    }

    /// Run one step of a one-port calibration.
    pub async fn calibrate(&self, step: CalibrationStep) -> AppResult<()> {
        debug!(?step, "Calibration step");
        self.execute_acknowledged(Command::calibrate(step)).await
    }

    /// Store the parameters the next sweep applies.
    pub async fn configure(&self, parameters: InstrumentParameters) -> AppResult<()> {
        self.request(InstrumentRequest::configure(parameters))
            .await?
    }

    /// Apply a measurement function and wait until the instrument acknowledged it.
    pub async fn initialize(&self, setup: MeasurementSetup) -> AppResult<()> {
        let mut events = self.subscribe();
        self.request(InstrumentRequest::initialize(setup)).await??;
        loop {
            match next_event(&mut events).await? {
                InstrumentEvent::Initialized => return Ok(()),
                InstrumentEvent::SweepAborted { error, .. } => return Err(error),
                InstrumentEvent::SweepCancelled => return Err(VnaError::Cancelled),
                _ => {}
            }
        }
    }

    /// Start a sweep; results arrive as [`InstrumentEvent::SweepComplete`].
    pub async fn start_sweep(&self, mode: SweepMode) -> AppResult<()> {
        self.request(InstrumentRequest::start_sweep(mode)).await?
    }

    /// Run a single sweep and wait for it. `None` if it was cancelled.
    pub async fn measure(&self) -> AppResult<Option<Arc<SweepResult>>> {
        let mut events = self.subscribe();
        self.start_sweep(SweepMode::Single).await?;
        loop {
            match next_event(&mut events).await? {
                InstrumentEvent::SweepComplete(result) => return Ok(Some(result)),
                InstrumentEvent::SweepCancelled => return Ok(None),
                InstrumentEvent::SweepAborted { error, .. } => return Err(error),
                _ => {}
            }
        }
    }

    /// Cancel the running sweep or initialization; a no-op when idle.
    pub async fn cancel_sweep(&self) -> AppResult<()> {
        self.request(InstrumentRequest::cancel_sweep()).await
    }

    /// Let a continuous sweep complete its current pass and stop.
    pub async fn finish_continuous(&self) -> AppResult<()> {
        self.request(InstrumentRequest::finish_continuous()).await
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InstrumentEvent> {
        self.events.resubscribe()
    }

    /// Current sequencer state.
    pub fn state(&self) -> SweepState {
        *self.state.borrow()
    }

    /// Watch the sequencer state.
    pub fn state_watch(&self) -> watch::Receiver<SweepState> {
        self.state.clone()
    }

    /// Current bridge connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Watch the bridge connection state.
    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Stop the instrument task and release the transport.
    pub async fn shutdown(&self) {
        if self.request(InstrumentRequest::shutdown()).await.is_err() {
            debug!("Instrument task already stopped");
        }
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<InstrumentEvent>,
) -> AppResult<InstrumentEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event receiver lagged");
            }
            Err(RecvError::Closed) => return Err(VnaError::ActorGone),
        }
    }
}

fn unexpected(kind: CommandKind, response: &Response) -> VnaError {
    VnaError::Decode {
        kind,
        reason: format!("unexpected response {response:?}"),
    }
}
