//! Command executor
//!
//! Runs one command at a time over a transport and turns whatever comes
//! back (a response, silence, a link fault) into a single result.
//!
//! ## Attempt Lifecycle
//! ```text
//!   Idle ──begin/send──► Sent ──frame──► Received ──classify──► Completed
//!                          │                                       │
//!                       deadline                          protocol error
//!                          ▼                                       ▼
//!                      TimedOut ─────── idempotent only ──────► Retrying ──► Sent
//! ```
//!
//! ## Concurrency Model:
//! - One command in flight per transport: the transport mutex is held for
//!   a whole attempt (send + receive)
//! - Backoff sleeps happen outside the lock
//! - The session tracker is shared and may be queried at any time

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::classifier::{codes, Outcome, StatusTable};
use crate::config::{Config, MAX_TIMEOUT};
use crate::error::SatError;
use crate::exchange::{Exchange, ExchangeEvent, ExchangeLog, TracingLog};
use crate::journal::{RecoveryResult, SessionJournal};
use crate::protocol::{
    decode_response, encode_request, peek_session, CommandKind, CommandPayload, CommandRequest,
    CommandResponse, StatusCode,
};
use crate::session::{SessionNumber, SessionState, SessionTracker};
use crate::transport::{LinkFault, Received, Transport};

// =============================================================================
// Errors
// =============================================================================

/// Why a command did not produce a successful response
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No response in time; the device may or may not have run the command
    #[error("{kind} (session {session}) timed out after {attempts} attempt(s)")]
    Timeout {
        kind: CommandKind,
        session: SessionNumber,
        attempts: u32,
    },

    #[error("{kind} (session {session}) cancelled")]
    Cancelled {
        kind: CommandKind,
        session: SessionNumber,
    },

    /// The device refused the command
    #[error("{} rejected with {}: {}", .response.command, .response.status, .response.message)]
    Rejected { response: CommandResponse },

    /// No usable answer: busy, unknown error, unmapped code or a line that
    /// does not decode
    #[error("{kind} failed after {attempts} attempt(s): {reason}")]
    ProtocolFailure {
        kind: CommandKind,
        attempts: u32,
        reason: String,
        status: Option<StatusCode>,
    },

    #[error("{kind} (session {session}): {fault}")]
    Link {
        kind: CommandKind,
        session: SessionNumber,
        fault: LinkFault,
    },

    #[error(transparent)]
    Local(#[from] SatError),
}

impl ExecutionError {
    /// The device's answer, for rejections
    pub fn response(&self) -> Option<&CommandResponse> {
        match self {
            ExecutionError::Rejected { response } => Some(response),
            _ => None,
        }
    }

    /// Status code reported by the device, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ExecutionError::Rejected { response } => Some(response.status),
            ExecutionError::ProtocolFailure { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result alias for command execution
pub type ExecResult<T> = std::result::Result<T, ExecutionError>;

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation of a running command
///
/// Checked before the request is sent and between receive slices. A
/// command cancelled before it reached the device is never sent; after
/// that, cancelling expires the session in flight without stopping the
/// device.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Executor
// =============================================================================

/// How one attempt ended without a classified response
enum AttemptFailure {
    TimedOut,
    Cancelled,
    Link(LinkFault),
    Undecodable(SatError),
    Local(SatError),
}

/// Where a received frame belongs
enum Routing {
    /// Answer to the attempt in flight
    Current,
    /// Some other session
    Elsewhere(SessionNumber),
    /// No session could be read from it
    Unreadable,
}

/// Executes commands against one device
pub struct CommandExecutor<T: Transport> {
    transport: Mutex<T>,
    tracker: Arc<SessionTracker>,
    table: StatusTable,
    config: Config,
    log: Box<dyn ExchangeLog>,
}

impl<T: Transport> CommandExecutor<T> {
    /// Executor logging through `tracing` only
    pub fn new(transport: T, config: Config) -> crate::Result<Self> {
        Self::with_log(transport, config, TracingLog)
    }

    /// Executor with a custom exchange log
    pub fn with_log(
        transport: T,
        config: Config,
        log: impl ExchangeLog + 'static,
    ) -> crate::Result<Self> {
        config.validate()?;
        let tracker = Arc::new(SessionTracker::new(config.session_history_limit));
        Ok(Self {
            transport: Mutex::new(transport),
            tracker,
            table: StatusTable::default(),
            config,
            log: Box::new(log),
        })
    }

    /// Executor for the configured journal, if any
    ///
    /// With a journal the tracker is restored from it: the counter resumes
    /// after the last issued session and in-doubt sessions come back as
    /// expired. The journal is compacted on the way in, keeping about
    /// `session_history_limit` recent records.
    pub fn open(transport: T, config: Config) -> crate::Result<Self> {
        match config.journal_path.clone() {
            Some(path) => {
                let (journal, recovered) = SessionJournal::open_compacted(
                    &path,
                    config.journal_sync,
                    config.session_history_limit,
                )?;
                let executor = Self::with_log(transport, config, (TracingLog, journal))?;
                Ok(executor.with_recovery(&recovered))
            }
            None => Self::new(transport, config),
        }
    }

    /// Seed the tracker from a recovered journal
    pub fn with_recovery(self, recovered: &RecoveryResult) -> Self {
        self.tracker
            .restore(recovered.last_issued, recovered.in_doubt.iter().copied());
        if !recovered.in_doubt.is_empty() {
            tracing::warn!(
                "{} session(s) in doubt after restart: {:?}",
                recovered.in_doubt.len(),
                recovered.in_doubt
            );
        }
        self
    }

    /// Replace the status table
    pub fn with_status_table(mut self, table: StatusTable) -> Self {
        self.table = table;
        self
    }

    /// Share the tracker for status queries
    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What is known about a session number
    pub fn query_status(&self, session: SessionNumber) -> SessionState {
        self.tracker.query_status(session)
    }

    /// Build a request for the next session number
    pub fn new_request(&self, payload: CommandPayload) -> crate::Result<CommandRequest> {
        let session = self.tracker.next_session()?;
        let activation_code = payload
            .kind()
            .requires_activation_code()
            .then(|| self.config.activation_code.clone())
            .flatten();
        Ok(CommandRequest::new(session, activation_code, payload))
    }

    /// Execute a command to completion
    pub fn execute(&self, request: CommandRequest) -> ExecResult<CommandResponse> {
        self.execute_with_cancel(request, &CancelToken::new())
    }

    /// Execute a command, giving up when `cancel` fires
    pub fn execute_with_cancel(
        &self,
        request: CommandRequest,
        cancel: &CancelToken,
    ) -> ExecResult<CommandResponse> {
        let kind = request.kind();
        let policy = self.config.retries.policy(kind);
        let mut request = request;
        let mut attempt = 1;

        loop {
            let session = request.session;
            let failure = match self.attempt(&request, cancel) {
                Ok((response, outcome)) => match outcome {
                    Outcome::Success => return Ok(response),
                    Outcome::FunctionalRejection(_) => {
                        return Err(ExecutionError::Rejected { response })
                    }
                    Outcome::ProtocolError => ExecutionError::ProtocolFailure {
                        kind,
                        attempts: attempt,
                        reason: format!("device answered {}: {}", response.status, response.message),
                        status: Some(response.status),
                    },
                },
                Err(AttemptFailure::Cancelled) => {
                    return Err(ExecutionError::Cancelled { kind, session })
                }
                Err(AttemptFailure::Local(e)) => return Err(ExecutionError::Local(e)),
                Err(AttemptFailure::TimedOut) => {
                    let error = ExecutionError::Timeout {
                        kind,
                        session,
                        attempts: attempt,
                    };
                    // Never resend a command the device may have executed
                    if !kind.is_idempotent() {
                        return Err(error);
                    }
                    error
                }
                Err(AttemptFailure::Link(fault)) => {
                    let error = ExecutionError::Link {
                        kind,
                        session,
                        fault,
                    };
                    if !kind.is_idempotent() || !fault.is_transient() {
                        return Err(error);
                    }
                    error
                }
                Err(AttemptFailure::Undecodable(e)) => ExecutionError::ProtocolFailure {
                    kind,
                    attempts: attempt,
                    reason: e.to_string(),
                    status: None,
                },
            };

            if attempt >= policy.max_attempts {
                return Err(failure);
            }

            attempt += 1;
            tracing::debug!(
                "{} attempt {}/{} after: {}",
                kind,
                attempt,
                policy.max_attempts,
                failure
            );
            if !self.pause(policy.delay_before(attempt), cancel) {
                return Err(ExecutionError::Cancelled { kind, session });
            }
            request = request.with_session(self.tracker.next_session()?);
        }
    }

    /// Learn the outcome of every expired session through
    /// ConsultarNumeroSessao, returning how many were resolved
    pub fn reconcile(&self) -> crate::Result<usize> {
        let mut resolved = 0;
        for (target, kind) in self.tracker.expired_sessions() {
            let request = self.new_request(CommandPayload::QuerySessionNumber { target })?;
            match self.execute(request) {
                Ok(_) | Err(ExecutionError::Rejected { .. }) => {}
                Err(ExecutionError::Local(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Could not re-query session {} ({}): {}", target, kind, e);
                    continue;
                }
            }
            if !matches!(self.tracker.query_status(target), SessionState::Expired { .. }) {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    // -------------------------------------------------------------------------
    // One attempt
    // -------------------------------------------------------------------------

    fn attempt(
        &self,
        request: &CommandRequest,
        cancel: &CancelToken,
    ) -> Result<(CommandResponse, Outcome), AttemptFailure> {
        let session = request.session;
        let kind = request.kind();
        if cancel.is_cancelled() {
            return Err(AttemptFailure::Cancelled);
        }
        let frame = encode_request(request).map_err(AttemptFailure::Local)?;

        self.tracker
            .begin(session, kind)
            .map_err(AttemptFailure::Local)?;
        if let Err(e) = self.log.record(&Exchange::new(
            session,
            kind,
            ExchangeEvent::Sent {
                frame: frame.clone(),
            },
        )) {
            self.withdraw(session, kind);
            return Err(AttemptFailure::Local(e));
        }

        // Another caller may have held the link for a while
        let mut transport = self.transport.lock();
        if cancel.is_cancelled() {
            drop(transport);
            self.withdraw(session, kind);
            return Err(AttemptFailure::Cancelled);
        }
        if let Err(e) = transport.send(&frame) {
            drop(transport);
            self.withdraw(session, kind);
            return Err(match e {
                SatError::Link(fault) => AttemptFailure::Link(fault),
                other => AttemptFailure::Local(other),
            });
        }

        let deadline = deadline_after(self.config.timeouts.get(kind));
        let poll = self.config.poll_interval();
        loop {
            if cancel.is_cancelled() {
                self.expire(session, kind);
                return Err(AttemptFailure::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                self.expire(session, kind);
                return Err(AttemptFailure::TimedOut);
            }

            let bytes = match transport.receive(poll.min(deadline - now)) {
                Ok(Received::Frame(bytes)) => bytes,
                Ok(Received::TimedOut) => continue,
                Err(e) => {
                    self.expire(session, kind);
                    return Err(match e {
                        SatError::Link(fault) => AttemptFailure::Link(fault),
                        other => AttemptFailure::Local(other),
                    });
                }
            };

            match self.route(request, &bytes) {
                Routing::Current => {}
                Routing::Elsewhere(other) => {
                    self.late_frame(other, session, kind, bytes);
                    continue;
                }
                Routing::Unreadable => {
                    self.expire(session, kind);
                    return Err(AttemptFailure::Undecodable(SatError::MalformedResponse(
                        format!("{}: unreadable frame {:?}", kind, String::from_utf8_lossy(&bytes)),
                    )));
                }
            }

            let response = match decode_response(&bytes, kind) {
                Ok(response) => response,
                Err(e) => {
                    self.expire(session, kind);
                    return Err(AttemptFailure::Undecodable(e));
                }
            };
            drop(transport);

            let outcome = self.table.classify(response.status);
            if let Err(e) = self.tracker.complete(session, response.status, outcome) {
                tracing::warn!("Session {} vanished before completion: {}", session, e);
            }
            self.record(Exchange::new(
                session,
                kind,
                ExchangeEvent::Received {
                    frame: bytes,
                    status: response.status,
                    outcome,
                },
            ));
            self.after_requery(request, &response);
            return Ok((response, outcome));
        }
    }

    /// Decide which session a frame answers
    fn route(&self, request: &CommandRequest, bytes: &[u8]) -> Routing {
        let Some(echoed) = peek_session(bytes) else {
            return Routing::Unreadable;
        };
        if echoed == request.session {
            return Routing::Current;
        }
        // A stored response comes back under the number it was issued with
        match request.payload {
            CommandPayload::QuerySessionNumber { target } if target == echoed => Routing::Current,
            _ => Routing::Elsewhere(echoed),
        }
    }

    /// A frame for a session other than the one in flight
    fn late_frame(
        &self,
        echoed: SessionNumber,
        current: SessionNumber,
        current_kind: CommandKind,
        bytes: bytes::Bytes,
    ) {
        if let SessionState::Expired { kind } = self.tracker.query_status(echoed) {
            match decode_response(&bytes, kind) {
                Ok(response) => {
                    let outcome = self.table.classify(response.status);
                    if self.tracker.resolve_expired(echoed, response.status, outcome) {
                        self.record(Exchange::new(
                            echoed,
                            kind,
                            ExchangeEvent::Resolved {
                                status: response.status,
                                outcome,
                            },
                        ));
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!("Late frame for session {} does not decode: {}", echoed, e);
                }
            }
        }
        self.record(Exchange::new(
            current,
            current_kind,
            ExchangeEvent::Stray { frame: bytes },
        ));
    }

    /// A re-query may settle the target session
    fn after_requery(&self, request: &CommandRequest, response: &CommandResponse) {
        let CommandPayload::QuerySessionNumber { target } = request.payload else {
            return;
        };
        let SessionState::Expired { kind } = self.tracker.query_status(target) else {
            return;
        };

        let (status, outcome) = if response.command == kind {
            (response.status, self.table.classify(response.status))
        } else if response.status.value() == codes::SESSION_NOT_FOUND {
            // The device never ran it
            (response.status, Outcome::FunctionalRejection(response.status))
        } else {
            return;
        };

        if self.tracker.resolve_expired(target, status, outcome) {
            self.record(Exchange::new(
                target,
                kind,
                ExchangeEvent::Resolved { status, outcome },
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn expire(&self, session: SessionNumber, kind: CommandKind) {
        if let Err(e) = self.tracker.expire(session) {
            tracing::warn!("Cannot expire session {}: {}", session, e);
        }
        self.record(Exchange::new(session, kind, ExchangeEvent::Expired));
    }

    /// Forget a session whose request was never sent
    fn withdraw(&self, session: SessionNumber, kind: CommandKind) {
        if let Err(e) = self.tracker.withdraw(session) {
            tracing::warn!("Cannot withdraw session {}: {}", session, e);
        }
        self.record(Exchange::new(session, kind, ExchangeEvent::Withdrawn));
    }

    /// Log an event that follows the send; failures cannot undo it
    fn record(&self, exchange: Exchange) {
        if let Err(e) = self.log.record(&exchange) {
            tracing::warn!("Failed to log session {}: {}", exchange.session, e);
        }
    }

    /// Sleep in poll slices; `false` if cancelled meanwhile
    fn pause(&self, delay: Duration, cancel: &CancelToken) -> bool {
        let deadline = deadline_after(delay);
        let poll = self.config.poll_interval();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }
}

/// `now + wait`, capped at [`MAX_TIMEOUT`] and never overflowing
fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait.min(MAX_TIMEOUT)).unwrap_or(now)
}
