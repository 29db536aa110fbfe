//! Session tracker
//!
//! HashMap-based session registry with RwLock for concurrency.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use super::{unix_millis, SessionNumber};
use crate::classifier::Outcome;
use crate::error::{Result, SatError};
use crate::protocol::{CommandKind, StatusCode};

/// What the tracker knows about a session number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never issued, or evicted from the history
    NotFound,

    /// A command is in flight
    Pending { kind: CommandKind },

    /// Timed out or cancelled locally; the device outcome is unknown
    Expired { kind: CommandKind },

    /// Terminal, with the last recorded outcome
    Completed {
        kind: CommandKind,
        status: StatusCode,
        outcome: Outcome,
    },
}

impl SessionState {
    /// Pending and expired sessions block the number from reuse
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SessionState::Pending { .. } | SessionState::Expired { .. })
    }
}

/// A tracked session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub number: SessionNumber,
    pub kind: CommandKind,

    /// Unix millis when the session was registered
    pub created_at: u64,

    pub state: SessionState,
}

struct Inner {
    /// Highest number handed out (or registered) so far
    last_issued: Option<SessionNumber>,

    sessions: HashMap<SessionNumber, Session>,

    /// Terminal sessions, oldest first, for eviction
    terminal_order: VecDeque<SessionNumber>,
}

/// Shared registry of sessions for the whole process
///
/// ## Concurrency:
/// - Status queries take the read lock and run concurrently
/// - The executing command takes the write lock for each transition
pub struct SessionTracker {
    inner: RwLock<Inner>,

    /// Terminal sessions kept for re-queries
    history_limit: usize,
}

impl SessionTracker {
    /// Default number of terminal sessions remembered
    ///
    /// A session number must differ from the last 100 used.
    pub const DEFAULT_HISTORY_LIMIT: usize = 100;

    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                last_issued: None,
                sessions: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            history_limit,
        }
    }

    /// Tracker whose first issued number follows `last_issued`
    pub fn starting_after(last_issued: SessionNumber, history_limit: usize) -> Self {
        let tracker = Self::new(history_limit);
        tracker.inner.write().last_issued = Some(last_issued);
        tracker
    }

    /// Allocate the next session number
    ///
    /// Numbers increase until 999999, then wrap to 1. Any number the tracker
    /// still knows about (in flight or in the recent history) is skipped.
    pub fn next_session(&self) -> Result<SessionNumber> {
        let mut inner = self.inner.write();
        let mut candidate = match inner.last_issued {
            Some(last) => last.next(),
            None => SessionNumber(SessionNumber::MIN),
        };

        for _ in SessionNumber::MIN..=SessionNumber::MAX {
            if !inner.sessions.contains_key(&candidate) {
                inner.last_issued = Some(candidate);
                return Ok(candidate);
            }
            candidate = candidate.next();
        }

        Err(SatError::SessionSpaceExhausted)
    }

    /// Register a pending command for a session
    pub fn begin(&self, number: SessionNumber, kind: CommandKind) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some(existing) = inner.sessions.get(&number) {
            if existing.state.is_in_flight() {
                return Err(SatError::SessionAlreadyPending(number));
            }
            inner.terminal_order.retain(|n| *n != number);
        }

        inner.sessions.insert(
            number,
            Session {
                number,
                kind,
                created_at: unix_millis(),
                state: SessionState::Pending { kind },
            },
        );

        if inner.last_issued.map_or(true, |last| number > last) {
            inner.last_issued = Some(number);
        }

        tracing::trace!("Session {} pending for {}", number, kind);
        Ok(())
    }

    /// Mark a session terminal, returning the command it carried
    pub fn complete(
        &self,
        number: SessionNumber,
        status: StatusCode,
        outcome: Outcome,
    ) -> Result<CommandKind> {
        let mut inner = self.inner.write();
        self.finish(&mut inner, number, status, outcome)
    }

    /// Mark a pending session as locally timed out
    ///
    /// The number stays blocked until the real outcome is learned.
    pub fn expire(&self, number: SessionNumber) -> Result<CommandKind> {
        let mut inner = self.inner.write();

        let session = inner
            .sessions
            .get_mut(&number)
            .ok_or(SatError::UnknownSession(number))?;
        if let SessionState::Pending { kind } = session.state {
            session.state = SessionState::Expired { kind };
            tracing::debug!("Session {} expired while waiting for {}", number, kind);
        }
        Ok(session.kind)
    }

    /// Forget a pending session whose request never reached the device
    ///
    /// The counter is not rolled back.
    pub fn withdraw(&self, number: SessionNumber) -> Result<CommandKind> {
        let mut inner = self.inner.write();
        match inner.sessions.get(&number).map(|session| session.state) {
            Some(SessionState::Pending { kind }) => {
                inner.sessions.remove(&number);
                tracing::debug!("Session {} withdrawn before reaching the device", number);
                Ok(kind)
            }
            _ => Err(SatError::UnknownSession(number)),
        }
    }

    /// Record the real outcome of an expired session
    ///
    /// Returns `false` (and changes nothing) unless the session is expired.
    pub fn resolve_expired(
        &self,
        number: SessionNumber,
        status: StatusCode,
        outcome: Outcome,
    ) -> bool {
        let mut inner = self.inner.write();
        let expired = matches!(
            inner.sessions.get(&number).map(|session| session.state),
            Some(SessionState::Expired { .. })
        );
        if expired && self.finish(&mut inner, number, status, outcome).is_ok() {
            tracing::info!("Expired session {} resolved as {}", number, status);
            return true;
        }
        false
    }

    /// State of a session number
    ///
    /// Numbers never seen are `NotFound`; this is an answer, not an error.
    pub fn query_status(&self, number: SessionNumber) -> SessionState {
        self.inner
            .read()
            .sessions
            .get(&number)
            .map_or(SessionState::NotFound, |session| session.state)
    }

    /// Full record of a session
    pub fn get(&self, number: SessionNumber) -> Option<Session> {
        self.inner.read().sessions.get(&number).copied()
    }

    /// Seed the tracker from a recovered journal
    pub fn restore(
        &self,
        last_issued: Option<SessionNumber>,
        in_doubt: impl IntoIterator<Item = (SessionNumber, CommandKind)>,
    ) {
        let mut inner = self.inner.write();
        if let Some(last) = last_issued {
            if inner.last_issued.map_or(true, |current| last > current) {
                inner.last_issued = Some(last);
            }
        }

        let now = unix_millis();
        for (number, kind) in in_doubt {
            inner.terminal_order.retain(|n| *n != number);
            inner.sessions.insert(
                number,
                Session {
                    number,
                    kind,
                    created_at: now,
                    state: SessionState::Expired { kind },
                },
            );
        }
    }

    /// Sessions whose outcome is still unknown, oldest number first
    pub fn expired_sessions(&self) -> Vec<(SessionNumber, CommandKind)> {
        let inner = self.inner.read();
        let mut expired: Vec<_> = inner
            .sessions
            .values()
            .filter_map(|session| match session.state {
                SessionState::Expired { kind } => Some((session.number, kind)),
                _ => None,
            })
            .collect();
        expired.sort_unstable();
        expired
    }

    /// Number of sessions with a command in flight
    pub fn pending_count(&self) -> usize {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|session| matches!(session.state, SessionState::Pending { .. }))
            .count()
    }

    pub fn last_issued(&self) -> Option<SessionNumber> {
        self.inner.read().last_issued
    }

    /// Terminal transition (called with the write lock held)
    fn finish(
        &self,
        inner: &mut Inner,
        number: SessionNumber,
        status: StatusCode,
        outcome: Outcome,
    ) -> Result<CommandKind> {
        let session = inner
            .sessions
            .get_mut(&number)
            .ok_or(SatError::UnknownSession(number))?;
        let kind = session.kind;
        let was_terminal = matches!(session.state, SessionState::Completed { .. });
        session.state = SessionState::Completed {
            kind,
            status,
            outcome,
        };

        if was_terminal {
            inner.terminal_order.retain(|n| *n != number);
        }
        inner.terminal_order.push_back(number);
        self.evict(inner);

        tracing::trace!("Session {} completed with {} ({:?})", number, status, outcome);
        Ok(kind)
    }

    /// Drop the oldest terminal sessions beyond the history limit
    fn evict(&self, inner: &mut Inner) {
        while inner.terminal_order.len() > self.history_limit {
            if let Some(oldest) = inner.terminal_order.pop_front() {
                inner.sessions.remove(&oldest);
            }
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HISTORY_LIMIT)
    }
}
