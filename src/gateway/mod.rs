//! # Serial Gateway Protocol Engine
//!
//! Bridges remote end-devices reachable over a single half-duplex serial link.
//! The engine frames and checksums commands, runs a single-in-flight
//! request/response exchange with bounded retry, and tracks the lifecycle of
//! every device (unknown -> pending -> active).
//!
//! ## Components
//!
//! - [`checksum`]: CRC-32 over the frame body and verification of `,CRC:<hex8>`
//! - [`frame`]: command encoding, inbound decoding and classification
//! - [`framer`]: byte stream to line splitting
//! - [`registry`]: pending and active device sets with stale eviction
//! - [`dispatcher`]: the outbound state machine
//! - [`transport`]: serial port and in-memory links
//!
//! ## Threading
//!
//! [`Gateway`] owns the transport and is driven from one loop, either by calling
//! [`Gateway::tick_at`] directly or through [`Gateway::run`]. Producers use a
//! cloneable [`GatewayHandle`]; the registry and the command queue sit behind
//! separate mutexes that are only held for the critical section. Listeners run
//! on the loop after those locks are released.
//!
//! ```rust,no_run
//! use zbgateway::config::GatewayConfig;
//! use zbgateway::gateway::{Gateway, MemoryTransport};
//!
//! # async fn demo() -> Result<(), zbgateway::gateway::GatewayError> {
//! let mut gateway = Gateway::new(MemoryTransport::new(), &GatewayConfig::default());
//! gateway.on_device_data(|id, payload| println!("{}: {}", id, payload));
//! let handle = gateway.handle();
//! let reply = handle.enqueue_command("D1", "CHECK")?;
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! tokio::spawn(async move { gateway.run(shutdown).await });
//! if let Ok(outcome) = reply.await {
//!     println!("{:?} after {} attempt(s)", outcome.status, outcome.attempts);
//! }
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod framer;
pub mod registry;
pub mod transport;

pub use dispatcher::{CommandOutcome, CommandStatus, DispatchPolicy, DispatchState};
pub use error::GatewayError;
pub use frame::{Command, Frame, FrameError, InboundKind, Role, Target};
pub use registry::{Device, DeviceRegistry, RegistryChange};
#[cfg(feature = "serial")]
pub use transport::SerialTransport;
pub use transport::{MemoryTransport, Transport};

use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::config::GatewayConfig;
use crate::logutil::escape_log;
use crate::metrics::{LinkMetrics, Snapshot};
use crate::validation::{validate_device_id, validate_secret_key, validate_verb};
use dispatcher::{CommandQueue, Dispatcher, QueuedCommand};
use framer::LineFramer;

const READ_CHUNK: usize = 256;

type DataListener = Box<dyn FnMut(&str, &str) + Send>;
type ChangeListener = Box<dyn FnMut() + Send>;
type OutcomeListener = Box<dyn FnMut(&CommandOutcome) + Send>;

#[derive(Default)]
struct Listeners {
    device_data: Vec<DataListener>,
    registry_changed: Vec<ChangeListener>,
    pending_changed: Vec<ChangeListener>,
    command_finished: Vec<OutcomeListener>,
}

/// Registry plus changes made by producers that the loop has not yet announced.
#[derive(Default)]
struct RegistryState {
    devices: DeviceRegistry,
    unreported: RegistryChange,
}

struct Shared {
    registry: Mutex<RegistryState>,
    queue: Mutex<CommandQueue>,
    metrics: LinkMetrics,
    default_key: String,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, RegistryState> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, CommandQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What one tick did, mainly for tests and diagnostics.
#[derive(Debug, Default)]
pub struct TickReport {
    pub frames: usize,
    pub rejected: usize,
    pub evicted: Vec<String>,
    pub outcomes: Vec<CommandOutcome>,
}

pub struct Gateway<T: Transport> {
    transport: T,
    framer: LineFramer,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    listeners: Listeners,
    stale_pending: Duration,
    sweep_interval: Duration,
    tick_interval: Duration,
    last_sweep: Option<Instant>,
}

impl<T: Transport> Gateway<T> {
    /// Build a gateway around `transport`. Devices listed in
    /// `config.known_devices` start out active.
    pub fn new(transport: T, config: &GatewayConfig) -> Self {
        let policy = DispatchPolicy {
            reply_timeout: config.reply_timeout(),
            max_attempts: config.max_attempts.max(1),
        };
        let mut state = RegistryState::default();
        let now = Instant::now();
        for id in &config.known_devices {
            let change = state.devices.register_active(id, now);
            state.unreported = state.unreported.merge(change);
        }
        Self {
            transport,
            framer: LineFramer::new(),
            dispatcher: Dispatcher::new(policy, config.default_secret_key.clone()),
            shared: Arc::new(Shared {
                registry: Mutex::new(state),
                queue: Mutex::new(CommandQueue::new()),
                metrics: LinkMetrics::new(),
                default_key: config.default_secret_key.clone(),
            }),
            listeners: Listeners::default(),
            stale_pending: config.stale_pending(),
            sweep_interval: config.sweep_interval(),
            tick_interval: config.tick_interval(),
            last_sweep: None,
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Called with `(device_id, payload)` for every `DATA:` frame and every
    /// uninterpreted verb.
    pub fn on_device_data<F>(&mut self, listener: F)
    where
        F: FnMut(&str, &str) + Send + 'static,
    {
        self.listeners.device_data.push(Box::new(listener));
    }

    pub fn on_registry_changed<F>(&mut self, listener: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.listeners.registry_changed.push(Box::new(listener));
    }

    pub fn on_pending_changed<F>(&mut self, listener: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.listeners.pending_changed.push(Box::new(listener));
    }

    pub fn on_command_finished<F>(&mut self, listener: F)
    where
        F: FnMut(&CommandOutcome) + Send + 'static,
    {
        self.listeners.command_finished.push(Box::new(listener));
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// One pass of the loop: sweep stale pending devices when due, drain and
    /// route inbound lines, then advance the dispatcher.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let mut change = std::mem::take(&mut self.shared.registry().unreported);

        let sweep_due = self
            .last_sweep
            .map_or(true, |last| now.saturating_duration_since(last) >= self.sweep_interval);
        if sweep_due {
            self.last_sweep = Some(now);
            let evicted = self.shared.registry().devices.sweep_stale(now, self.stale_pending);
            if !evicted.is_empty() {
                change = change.merge(RegistryChange {
                    registry: true,
                    pending: true,
                });
            }
            report.evicted = evicted;
        }
        // Evictions are announced before anything this tick re-discovers.
        self.announce(change);

        self.drain_transport();
        while let Some(line) = self.framer.next_line() {
            match frame::decode(&line) {
                Ok(frame) => {
                    report.frames += 1;
                    self.shared.metrics.inc_frames_received();
                    trace!("RX {}", escape_log(&line));
                    // A pending entry past its window is gone even if the periodic
                    // sweep has not run yet; announce that before routing.
                    let expired = self.shared.registry().devices.expire_stale(
                        &frame.id,
                        now,
                        self.stale_pending,
                    );
                    if expired {
                        report.evicted.push(frame.id.clone());
                        self.announce(RegistryChange {
                            registry: true,
                            pending: true,
                        });
                    }
                    self.route(&frame, now);
                    if let Some(outcome) = self.dispatcher.observe(&frame, now, &self.shared.metrics)
                    {
                        report.outcomes.push(outcome);
                    }
                }
                Err(FrameError::Integrity) => {
                    report.rejected += 1;
                    self.shared.metrics.inc_integrity_errors();
                    debug!("Dropped frame with bad checksum: {}", escape_log(&line));
                }
                Err(FrameError::Malformed(reason)) => {
                    report.rejected += 1;
                    self.shared.metrics.inc_malformed();
                    debug!("Dropped malformed frame ({}): {}", reason, escape_log(&line));
                }
            }
        }

        if let Some(outcome) = self
            .dispatcher
            .poll(now, &mut self.transport, &self.shared.metrics)
        {
            report.outcomes.push(outcome);
        }
        if self.dispatcher.is_idle() {
            let next = self.shared.queue().pop_front();
            if let Some(queued) = next {
                self.dispatcher
                    .start(queued, now, &mut self.transport, &self.shared.metrics);
            }
        }

        for outcome in &report.outcomes {
            for listener in self.listeners.command_finished.iter_mut() {
                listener(outcome);
            }
        }
        report
    }

    /// Drive [`tick`](Self::tick) every `tick_interval` until `shutdown` turns
    /// true or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Gateway loop started (tick {} ms)",
            self.tick_interval.as_millis()
        );
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped; stopping gateway loop");
                        break;
                    }
                }
            }
        }
        info!("Gateway loop stopped");
    }

    /// Read until the transport reports nothing buffered.
    fn drain_transport(&mut self) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.transport.bytes_available() {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Serial availability check failed: {}", e);
                    break;
                }
            }
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.framer.push(&buf[..n]),
                Err(e) => {
                    warn!("Serial read failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Apply one decoded frame to the registry, then notify.
    fn route(&mut self, frame: &Frame, now: Instant) {
        let id = frame.id.as_str();
        let mut forward: Option<String> = None;
        let change = {
            let mut state = self.shared.registry();
            let reg = &mut state.devices;
            match frame::classify(frame) {
                InboundKind::Discovery => reg.record_discovery(id, now),
                InboundKind::Status(token) => {
                    let was_pending = reg.is_pending(id);
                    let change = reg.apply_status(id, &token, now);
                    if was_pending {
                        change.merge(reg.promote(id, now))
                    } else {
                        change
                    }
                }
                InboundKind::Data(payload) => {
                    let change = reg.promote(id, now);
                    reg.record_data(id, &payload);
                    forward = Some(payload);
                    change
                }
                InboundKind::ResetData => {
                    let change = reg.promote_known(id, now);
                    change.merge(reg.reset_data(id))
                }
                InboundKind::SecretKey(key) => {
                    let change = reg.promote_known(id, now);
                    reg.set_secret_key(id, &key);
                    change
                }
                InboundKind::DataRequest | InboundKind::Check => reg.promote_known(id, now),
                InboundKind::Passthrough(verb) => {
                    let change = reg.promote_known(id, now);
                    forward = Some(verb);
                    change
                }
            }
        };

        self.announce(change);
        if let Some(payload) = forward {
            for listener in self.listeners.device_data.iter_mut() {
                listener(id, &payload);
            }
        }
    }

    fn announce(&mut self, change: RegistryChange) {
        if change.registry {
            for listener in self.listeners.registry_changed.iter_mut() {
                listener();
            }
        }
        if change.pending {
            for listener in self.listeners.pending_changed.iter_mut() {
                listener();
            }
        }
    }
}

/// Producer-side access to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    /// Queue `verb` for device `id`. The key is the device's stored key if it
    /// negotiated one, otherwise the configured default.
    pub fn enqueue_command(
        &self,
        id: &str,
        verb: &str,
    ) -> Result<oneshot::Receiver<CommandOutcome>, GatewayError> {
        self.enqueue(id, None, verb)
    }

    pub fn enqueue_command_with_key(
        &self,
        id: &str,
        secret_key: &str,
        verb: &str,
    ) -> Result<oneshot::Receiver<CommandOutcome>, GatewayError> {
        validate_secret_key(secret_key)?;
        self.enqueue(id, Some(secret_key), verb)
    }

    pub fn check_device(&self, id: &str) -> Result<oneshot::Receiver<CommandOutcome>, GatewayError> {
        self.enqueue_command(id, frame::VERB_CHECK)
    }

    /// Queue the unaddressed discovery request.
    pub fn broadcast_discovery(&self) -> oneshot::Receiver<CommandOutcome> {
        let (queued, rx) = QueuedCommand::new(Command::broadcast_discovery());
        self.shared.queue().push_back(queued);
        debug!("Queued discovery broadcast");
        rx
    }

    /// Mark `id` active; listeners hear about it on the next tick.
    pub fn register_known_device(&self, id: &str) -> Result<(), GatewayError> {
        validate_device_id(id)?;
        let mut state = self.shared.registry();
        let change = state.devices.register_active(id, Instant::now());
        state.unreported = state.unreported.merge(change);
        Ok(())
    }

    pub fn active_devices(&self) -> Vec<String> {
        self.shared.registry().devices.active_ids()
    }

    pub fn pending_devices(&self) -> Vec<String> {
        self.shared.registry().devices.pending_ids()
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.shared.registry().devices.get(id).cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn metrics(&self) -> Snapshot {
        self.shared.metrics.snapshot()
    }

    fn enqueue(
        &self,
        id: &str,
        explicit_key: Option<&str>,
        verb: &str,
    ) -> Result<oneshot::Receiver<CommandOutcome>, GatewayError> {
        validate_device_id(id)?;
        validate_verb(verb)?;
        let key = match explicit_key {
            Some(key) => key.to_string(),
            None => self
                .shared
                .registry()
                .devices
                .secret_key_for(id)
                .unwrap_or_else(|| self.shared.default_key.clone()),
        };
        let (queued, rx) = QueuedCommand::new(Command::new(id, verb).with_key(key));
        let depth = {
            let mut queue = self.shared.queue();
            queue.push_back(queued);
            queue.len()
        };
        debug!("Queued '{}' for {} (depth {})", escape_log(verb), id, depth);
        Ok(rx)
    }
}
