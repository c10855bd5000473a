//! Shared failure taxonomy.
//!
//! Every component-local error type carries enough information to be
//! classified into one of these kinds, so the Actor can apply a single
//! retry/saga/DLQ policy regardless of which component raised the error.

use serde::{Deserialize, Serialize};

/// The taxonomy shared by retry, saga, and DLQ decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Temporary fault: timeout, service_unavailable, circuit_open. Retry per policy.
    Transient,
    /// Invalid input or business rejection. No retry; route to saga/DLQ.
    Permanent,
    /// Durable store failed. Fail the step; Actor retries after backoff.
    StorageUnavailable,
    /// Cooperative cancellation. No retry; mark abandoned.
    Cancelled,
    /// Contract violation or invariant break. Crash the Actor; Supervisor restarts.
    Internal,
}

impl FailureKind {
    /// Whether the Retry Policy should be consulted at all for this kind.
    pub fn is_retriable_candidate(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// A structured, serializable error carried on workflow and DLQ records.
///
/// This is the value stored in `Workflow Record.error`, `DlqEntry.error`,
/// and the `reason` passed to `Workflow::handle_step_failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    /// A short machine-readable tag, e.g. "timeout", "card_declined".
    pub code: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Classify a code: network timeouts and
    /// explicit `service_unavailable`/`timeout` are retriable; `circuit_open`
    /// is retriable-but-delayed; `invalid_data`/`card_declined`/validation
    /// errors are permanent. Unknown codes default to transient so a novel
    /// failure mode degrades to "retry a bounded number of times" rather
    /// than silently becoming unretryable.
    pub fn classify_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "timeout" | "service_unavailable" | "circuit_open" => {
                Self::new(FailureKind::Transient, message).with_code(code)
            }
            "invalid_data" | "card_declined" | "validation" => {
                Self::new(FailureKind::Permanent, message).with_code(code)
            }
            other => Self::new(FailureKind::Transient, message).with_code(other),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code}): {}", self.kind_label(), self.message),
            None => write!(f, "{}: {}", self.kind_label(), self.message),
        }
    }
}

impl Failure {
    fn kind_label(&self) -> &'static str {
        match self.kind {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::StorageUnavailable => "storage_unavailable",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::error::Error for Failure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_transient_codes() {
        for code in ["timeout", "service_unavailable", "circuit_open"] {
            let f = Failure::classify_code(code, "boom");
            assert_eq!(f.kind, FailureKind::Transient);
        }
    }

    #[test]
    fn classify_known_permanent_codes() {
        for code in ["invalid_data", "card_declined", "validation"] {
            let f = Failure::classify_code(code, "boom");
            assert_eq!(f.kind, FailureKind::Permanent);
        }
    }

    #[test]
    fn display_includes_code() {
        let f = Failure::permanent("bad card").with_code("card_declined");
        assert_eq!(f.to_string(), "permanent (card_declined): bad card");
    }
}
