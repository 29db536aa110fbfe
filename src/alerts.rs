//! Operational Alerts
//!
//! Checks run against a single ConsultarStatusOperacional reply, meant to be
//! run when the point of sale starts so the operator can act before the
//! device stops issuing CF-e.
//!
//! ```text
//!                        ┌──────────────────────────┐
//!  OperationalStatus ──► │ AlertRegistry            │ ──► Vec<Alert>
//!  + host clock          │  PendingDocumentsCheck   │     (active only)
//!                        │  CertificateExpiryCheck  │
//!                        │  ClockDivergenceCheck    │
//!                        │  ...registered checks    │
//!                        └──────────────────────────┘
//! ```
//!
//! Device times carry no zone, so they are compared with the host's local
//! time.

use chrono::{Duration, Local, NaiveDateTime};

use crate::protocol::OperationalStatus;

/// What an active alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// CF-e waiting to be transmitted to SEFAZ. `None` when the pending list
    /// bounds are not access keys.
    PendingDocuments { count: Option<u32> },

    /// Days until the installed certificate expires; negative once expired
    CertificateExpiry { days_left: i64 },

    /// Host time minus device time; negative when the host is behind
    ClockDivergence { seconds: i64 },

    /// Raised by a check registered by the application
    Custom,
}

/// An active alert with a message for the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Name of the check that raised it
    pub check: String,
    pub kind: AlertKind,
    pub message: String,
}

/// One condition worth telling the operator about
pub trait AlertCheck: Send + Sync {
    /// Unique within a registry
    fn name(&self) -> &str;

    /// The alert, when the condition holds at `now`
    fn check(&self, status: &OperationalStatus, now: NaiveDateTime) -> Option<Alert>;
}

// =============================================================================
// Built-in checks
// =============================================================================

/// CF-e issued but not yet transmitted to SEFAZ
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingDocumentsCheck;

impl AlertCheck for PendingDocumentsCheck {
    fn name(&self) -> &str {
        "pending-documents"
    }

    fn check(&self, status: &OperationalStatus, now: NaiveDateTime) -> Option<Alert> {
        if !status.has_pending_documents() {
            return None;
        }

        let count = status.pending_documents();
        let phrase = match count {
            Some(1) => "1 CF-e is waiting to be transmitted to SEFAZ.".to_string(),
            Some(n) => format!("{} CF-e are waiting to be transmitted to SEFAZ.", n),
            None => "CF-e are waiting to be transmitted to SEFAZ.".to_string(),
        };
        let contact = status.last_sefaz_contact;
        let when = if contact.date() == now.date() {
            format!("at {}", contact.format("%H:%M"))
        } else {
            format!("on {}", contact.format("%d/%m/%Y %H:%M"))
        };

        Some(Alert {
            check: self.name().to_string(),
            kind: AlertKind::PendingDocuments { count },
            message: format!("{} Last contact with SEFAZ was {}.", phrase, when),
        })
    }
}

/// Installed certificate close to (or past) its expiry date
#[derive(Debug, Clone, Copy)]
pub struct CertificateExpiryCheck {
    /// Raise the alert this many days before expiry
    pub warn_days: i64,
}

impl CertificateExpiryCheck {
    pub const DEFAULT_WARN_DAYS: i64 = 60;
}

impl Default for CertificateExpiryCheck {
    fn default() -> Self {
        Self {
            warn_days: Self::DEFAULT_WARN_DAYS,
        }
    }
}

impl AlertCheck for CertificateExpiryCheck {
    fn name(&self) -> &str {
        "certificate-expiry"
    }

    fn check(&self, status: &OperationalStatus, now: NaiveDateTime) -> Option<Alert> {
        let days_left = (status.certificate_expires - now.date()).num_days();
        if days_left > self.warn_days {
            return None;
        }

        let message = match days_left {
            d if d < 0 => "The installed certificate has expired!".to_string(),
            0 => "The installed certificate expires today!".to_string(),
            1 => "The installed certificate expires in 1 day.".to_string(),
            d => format!("The installed certificate expires in {} days.", d),
        };
        Some(Alert {
            check: self.name().to_string(),
            kind: AlertKind::CertificateExpiry { days_left },
            message,
        })
    }
}

/// Host and device clocks too far apart
#[derive(Debug, Clone, Copy)]
pub struct ClockDivergenceCheck {
    pub tolerance: Duration,
}

impl ClockDivergenceCheck {
    pub const DEFAULT_TOLERANCE_SECS: i64 = 3600;
}

impl Default for ClockDivergenceCheck {
    fn default() -> Self {
        Self {
            tolerance: Duration::seconds(Self::DEFAULT_TOLERANCE_SECS),
        }
    }
}

impl AlertCheck for ClockDivergenceCheck {
    fn name(&self) -> &str {
        "clock-divergence"
    }

    fn check(&self, status: &OperationalStatus, now: NaiveDateTime) -> Option<Alert> {
        let divergence = now - status.current_time;
        if divergence.num_seconds().abs() <= self.tolerance.num_seconds() {
            return None;
        }

        let format = "%d/%m/%Y %H:%M";
        Some(Alert {
            check: self.name().to_string(),
            kind: AlertKind::ClockDivergence {
                seconds: divergence.num_seconds(),
            },
            message: format!(
                "Host time {} and device time {} differ by {}, over the {} tolerance.",
                now.format(format),
                status.current_time.format(format),
                humanize(divergence.num_seconds().abs()),
                humanize(self.tolerance.num_seconds()),
            ),
        })
    }
}

/// `1h 2min 5s`, dropping zero parts
fn humanize(seconds: i64) -> String {
    let (h, m, s) = (seconds / 3600, seconds % 3600 / 60, seconds % 60);
    let parts: Vec<String> = [(h, "h"), (m, "min"), (s, "s")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered set of checks, run together against one status reply
pub struct AlertRegistry {
    checks: Vec<Box<dyn AlertCheck>>,
}

impl AlertRegistry {
    /// A registry with no checks
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    /// Add a check, unless one with the same name is already registered
    ///
    /// Returns whether the check was added.
    pub fn register(&mut self, check: impl AlertCheck + 'static) -> bool {
        if self.checks.iter().any(|known| known.name() == check.name()) {
            tracing::debug!("Alert check {} already registered", check.name());
            return false;
        }
        self.checks.push(Box::new(check));
        true
    }

    /// Names of the registered checks, in run order
    pub fn names(&self) -> Vec<&str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    /// Run every check, returning the active alerts in registration order
    pub fn check(&self, status: &OperationalStatus, now: NaiveDateTime) -> Vec<Alert> {
        let alerts: Vec<Alert> = self
            .checks
            .iter()
            .filter_map(|check| check.check(status, now))
            .collect();

        for alert in &alerts {
            tracing::warn!("Alert {}: {}", alert.check, alert.message);
        }
        tracing::debug!(
            "{} alert check(s) run, {} active",
            self.checks.len(),
            alerts.len()
        );
        alerts
    }

    /// [`AlertRegistry::check`] against the host's local time
    pub fn check_now(&self, status: &OperationalStatus) -> Vec<Alert> {
        self.check(status, Local::now().naive_local())
    }
}

impl Default for AlertRegistry {
    /// Pending documents, certificate expiry and clock divergence
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(PendingDocumentsCheck);
        registry.register(CertificateExpiryCheck::default());
        registry.register(ClockDivergenceCheck::default());
        registry
    }
}
