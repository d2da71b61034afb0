//! Single-in-flight command dispatcher.
//!
//! ```text
//! Queued -> Sending -> AwaitingReply -> Acked
//!                           |
//!                           +-> timed out -> resend (up to max_attempts)
//!                                         -> Failed
//! ```
//!
//! The dispatcher is a step machine rather than a blocking loop: the gateway
//! calls [`Dispatcher::observe`] for every decoded inbound frame and
//! [`Dispatcher::poll`] once per tick. Exactly one command is on the air at a
//! time; the FIFO queue itself lives in the gateway's shared state so producers
//! never touch the dispatcher.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::frame::{Command, Frame, Role, DEFAULT_SECRET_KEY};
use super::transport::Transport;
use crate::logutil::escape_log;
use crate::metrics::LinkMetrics;

/// Terminal state of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CommandStatus {
    Acked,
    Failed,
}

/// Reported once per command when it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: Command,
    pub status: CommandStatus,
    /// Number of times the frame was put on the wire.
    pub attempts: u32,
    /// Decoded frames seen while this command was in flight (used for broadcasts).
    pub responses: u32,
    /// Time from first transmission to the terminal state.
    pub elapsed: Duration,
}

impl CommandOutcome {
    pub fn is_acked(&self) -> bool {
        self.status == CommandStatus::Acked
    }
}

/// A command waiting in the FIFO, with the channel its producer listens on.
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: Command,
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

impl QueuedCommand {
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CommandOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }
}

pub type CommandQueue = VecDeque<QueuedCommand>;

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub reply_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(1000),
            max_attempts: 3,
        }
    }
}

/// Does `frame` answer `command`?
///
/// Broadcasts are never answered. Otherwise the frame must come from the
/// addressed device and either echo the verb, or be a `DATA:` frame when the
/// command is one of the data-yielding verbs.
pub fn satisfies(frame: &Frame, command: &Command) -> bool {
    let Some(target) = command.target_id() else {
        return false;
    };
    if frame.id != target {
        return false;
    }
    match &frame.role {
        Role::Command(verb) => *verb == command.verb,
        Role::Data(_) => command.yields_data(),
    }
}

#[derive(Debug)]
struct InFlight {
    queued: QueuedCommand,
    line: String,
    attempts: u32,
    responses: u32,
    first_sent: Instant,
    deadline: Instant,
}

/// Coarse view of the state machine for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    AwaitingReply { attempts: u32 },
}

pub struct Dispatcher {
    policy: DispatchPolicy,
    default_key: String,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    pub fn new(policy: DispatchPolicy, default_key: impl Into<String>) -> Self {
        Self {
            policy,
            default_key: default_key.into(),
            in_flight: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn state(&self) -> DispatchState {
        match &self.in_flight {
            None => DispatchState::Idle,
            Some(f) => DispatchState::AwaitingReply {
                attempts: f.attempts,
            },
        }
    }

    /// Encode and transmit the next command. Must only be called while idle.
    pub fn start<T: Transport + ?Sized>(
        &mut self,
        queued: QueuedCommand,
        now: Instant,
        transport: &mut T,
        metrics: &LinkMetrics,
    ) {
        debug_assert!(self.in_flight.is_none(), "dispatcher already busy");
        let line = queued.command.encode(&self.default_key);
        info!(
            "Dispatching '{}' to {}",
            escape_log(&queued.command.verb),
            queued.command.target
        );
        let mut flight = InFlight {
            queued,
            line,
            attempts: 0,
            responses: 0,
            first_sent: now,
            deadline: now,
        };
        Self::transmit(&mut flight, &self.policy, now, transport, metrics);
        self.in_flight = Some(flight);
    }

    /// Feed a decoded inbound frame. Returns the outcome when it completes the
    /// command in flight.
    pub fn observe(
        &mut self,
        frame: &Frame,
        now: Instant,
        metrics: &LinkMetrics,
    ) -> Option<CommandOutcome> {
        let flight = self.in_flight.as_mut()?;
        flight.responses += 1;
        if !satisfies(frame, &flight.queued.command) {
            return None;
        }
        let elapsed = now.saturating_duration_since(flight.first_sent);
        metrics.observe_ack_latency(elapsed);
        metrics.inc_acked();
        debug!(
            "Reply from {} satisfied '{}' after {} attempt(s), {} ms",
            frame.id,
            escape_log(&flight.queued.command.verb),
            flight.attempts,
            elapsed.as_millis()
        );
        self.finish(CommandStatus::Acked, now)
    }

    /// Handle the reply deadline: resend, or give up once the attempt ceiling
    /// is reached.
    pub fn poll<T: Transport + ?Sized>(
        &mut self,
        now: Instant,
        transport: &mut T,
        metrics: &LinkMetrics,
    ) -> Option<CommandOutcome> {
        let flight = self.in_flight.as_mut()?;
        if now < flight.deadline {
            return None;
        }
        if flight.attempts < self.policy.max_attempts {
            metrics.inc_retries();
            debug!(
                "No reply for '{}' to {} within {} ms; retry {}/{}",
                escape_log(&flight.queued.command.verb),
                flight.queued.command.target,
                self.policy.reply_timeout.as_millis(),
                flight.attempts + 1,
                self.policy.max_attempts
            );
            Self::transmit(flight, &self.policy, now, transport, metrics);
            return None;
        }

        // Broadcasts have no single respondent: they always run every attempt and
        // count as delivered if anything answered.
        let status = if flight.queued.command.is_broadcast() && flight.responses > 0 {
            CommandStatus::Acked
        } else {
            CommandStatus::Failed
        };
        match status {
            CommandStatus::Acked => {
                metrics.inc_acked();
                info!(
                    "Broadcast '{}' finished with {} response(s)",
                    escape_log(&flight.queued.command.verb),
                    flight.responses
                );
            }
            CommandStatus::Failed => {
                metrics.inc_failed();
                warn!(
                    "Command '{}' to {} failed after {} attempt(s)",
                    escape_log(&flight.queued.command.verb),
                    flight.queued.command.target,
                    flight.attempts
                );
            }
        }
        self.finish(status, now)
    }

    fn transmit<T: Transport + ?Sized>(
        flight: &mut InFlight,
        policy: &DispatchPolicy,
        now: Instant,
        transport: &mut T,
        metrics: &LinkMetrics,
    ) {
        flight.attempts += 1;
        flight.deadline = now + policy.reply_timeout;
        match transport.write_all(flight.line.as_bytes()) {
            Ok(()) => {
                metrics.inc_frames_sent();
                debug!("TX {}", escape_log(&flight.line));
            }
            Err(e) => {
                // The attempt is spent; the deadline still paces the retry.
                metrics.inc_write_errors();
                warn!(
                    "Serial write failed for '{}' (attempt {}): {}",
                    escape_log(&flight.queued.command.verb),
                    flight.attempts,
                    e
                );
            }
        }
    }

    fn finish(&mut self, status: CommandStatus, now: Instant) -> Option<CommandOutcome> {
        let mut flight = self.in_flight.take()?;
        let outcome = CommandOutcome {
            command: flight.queued.command.clone(),
            status,
            attempts: flight.attempts,
            responses: flight.responses,
            elapsed: now.saturating_duration_since(flight.first_sent),
        };
        if let Some(reply) = flight.queued.reply.take() {
            // Producer may have dropped its receiver; that is fine.
            let _ = reply.send(outcome.clone());
        }
        Some(outcome)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchPolicy::default(), DEFAULT_SECRET_KEY)
    }
}
