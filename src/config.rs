//! Configuration for the SAT protocol core
//!
//! Centralized configuration with sensible defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SatError};
use crate::protocol::CommandKind;
use crate::session::SessionTracker;

/// Longest wait accepted for a response or a backoff
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Main configuration for a command executor
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Device Configuration
    // -------------------------------------------------------------------------
    /// Activation code sent with every command except ConsultarSAT
    pub activation_code: Option<String>,

    // -------------------------------------------------------------------------
    // Timing Configuration
    // -------------------------------------------------------------------------
    /// How long to wait for each command kind
    pub timeouts: TimeoutTable,

    /// Slice of a wait between cancellation checks (milliseconds)
    pub poll_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Retry Configuration
    // -------------------------------------------------------------------------
    pub retries: RetryTable,

    // -------------------------------------------------------------------------
    // Session Configuration
    // -------------------------------------------------------------------------
    /// Terminal sessions remembered for re-queries
    pub session_history_limit: usize,

    // -------------------------------------------------------------------------
    // Journal Configuration
    // -------------------------------------------------------------------------
    /// Session journal file; `None` keeps sessions in memory only
    pub journal_path: Option<PathBuf>,

    /// How often to fsync the journal
    pub journal_sync: JournalSync,
}

/// Journal sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalSync {
    /// fsync after every record (safest, slowest)
    EveryWrite,

    /// fsync after N records
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            activation_code: None,
            timeouts: TimeoutTable::default(),
            poll_interval_ms: 100,
            retries: RetryTable::default(),
            session_history_limit: SessionTracker::DEFAULT_HISTORY_LIMIT,
            journal_path: None,
            journal_sync: JournalSync::EveryWrite,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the values a builder cannot check one at a time
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SatError::Config("poll interval must be positive".to_string()));
        }
        if let Some(code) = &self.activation_code {
            if code.is_empty() || code.contains('|') {
                return Err(SatError::Config(
                    "activation code must be non-empty and must not contain '|'".to_string(),
                ));
            }
        }
        for kind in CommandKind::ALL {
            let timeout = self.timeouts.get(kind);
            if timeout.is_zero() || timeout > MAX_TIMEOUT {
                return Err(SatError::Config(format!(
                    "{}: timeout {:?} outside (0, {:?}]",
                    kind, timeout, MAX_TIMEOUT
                )));
            }
            let policy = self.retries.policy(kind);
            if policy.max_attempts == 0 {
                return Err(SatError::Config(format!("{}: at least one attempt is needed", kind)));
            }
            if policy.backoff > MAX_TIMEOUT {
                return Err(SatError::Config(format!(
                    "{}: backoff {:?} exceeds {:?}",
                    kind, policy.backoff, MAX_TIMEOUT
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Response timeout per command kind
///
/// Defaults follow the times a device may take for each function: one
/// second to answer ConsultarSAT, half an hour to update its software.
#[derive(Debug, Clone, Default)]
pub struct TimeoutTable {
    overrides: HashMap<CommandKind, Duration>,
}

impl TimeoutTable {
    pub fn get(&self, kind: CommandKind) -> Duration {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Self::default_for(kind))
    }

    pub fn set(&mut self, kind: CommandKind, timeout: Duration) {
        self.overrides.insert(kind, timeout);
    }

    pub fn default_for(kind: CommandKind) -> Duration {
        let secs = match kind {
            CommandKind::QuerySat => 1,
            CommandKind::QueryOperationalStatus => 2,
            CommandKind::CancelLastSale => 4,
            CommandKind::SendSaleData => 6,
            CommandKind::ConfigureNetwork
            | CommandKind::ExtractLogs
            | CommandKind::ChangeActivationCode
            | CommandKind::QuerySessionNumber
            | CommandKind::AssociateSignature
            | CommandKind::EndToEndTest
            | CommandKind::QueryLastFiscalSession => 20,
            CommandKind::Activate
            | CommandKind::CommunicateCertificate
            | CommandKind::Block
            | CommandKind::Unblock => 300,
            CommandKind::UpdateSoftware => 1800,
        };
        Duration::from_secs(secs)
    }
}

// =============================================================================
// Retries
// =============================================================================

/// Attempts and backoff for one command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Wait before the second attempt
    pub backoff: Duration,

    /// Factor applied to the wait after every attempt
    pub multiplier: u32,
}

impl RetryPolicy {
    /// A single attempt
    pub const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        backoff: Duration::ZERO,
        multiplier: 1,
    };

    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            multiplier: 2,
        }
    }

    /// Wait before attempt number `attempt` (1-based; the first has none)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt - 2);
        self.backoff.saturating_mul(factor).min(MAX_TIMEOUT)
    }
}

/// Retry policy per command kind
///
/// By default idempotent queries get three attempts with a 250 ms doubling
/// backoff and everything else a single attempt.
#[derive(Debug, Clone)]
pub struct RetryTable {
    idempotent: RetryPolicy,
    overrides: HashMap<CommandKind, RetryPolicy>,
}

impl Default for RetryTable {
    fn default() -> Self {
        Self {
            idempotent: RetryPolicy::new(3, Duration::from_millis(250)),
            overrides: HashMap::new(),
        }
    }
}

impl RetryTable {
    pub fn policy(&self, kind: CommandKind) -> RetryPolicy {
        if let Some(policy) = self.overrides.get(&kind) {
            return *policy;
        }
        if kind.is_idempotent() {
            self.idempotent
        } else {
            RetryPolicy::NONE
        }
    }

    pub fn set(&mut self, kind: CommandKind, policy: RetryPolicy) {
        self.overrides.insert(kind, policy);
    }

    /// Policy for every idempotent kind without an override
    pub fn set_idempotent(&mut self, policy: RetryPolicy) {
        self.idempotent = policy;
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the activation code
    pub fn activation_code(mut self, code: impl Into<String>) -> Self {
        self.config.activation_code = Some(code.into());
        self
    }

    /// Set the timeout of one command kind
    pub fn timeout(mut self, kind: CommandKind, timeout: Duration) -> Self {
        self.config.timeouts.set(kind, timeout);
        self
    }

    /// Set the same timeout for every command kind
    pub fn timeout_all(mut self, timeout: Duration) -> Self {
        for kind in CommandKind::ALL {
            self.config.timeouts.set(kind, timeout);
        }
        self
    }

    /// Set the cancellation poll interval (in milliseconds)
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the retry policy of one command kind
    pub fn retry(mut self, kind: CommandKind, policy: RetryPolicy) -> Self {
        self.config.retries.set(kind, policy);
        self
    }

    /// Set the retry policy of idempotent kinds
    pub fn idempotent_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retries.set_idempotent(policy);
        self
    }

    /// Set how many terminal sessions are remembered
    pub fn session_history_limit(mut self, limit: usize) -> Self {
        self.config.session_history_limit = limit;
        self
    }

    /// Set the session journal file
    pub fn journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.journal_path = Some(path.into());
        self
    }

    /// Set the journal sync strategy
    pub fn journal_sync(mut self, sync: JournalSync) -> Self {
        self.config.journal_sync = sync;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
