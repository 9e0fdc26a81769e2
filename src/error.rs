use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, AccordError>;

/// Reason a request failed authentication. Distinguishes malformed input
/// from cryptographic rejection so callers can debug without seeing key
/// material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReason {
    /// Agent id present without a signature, or vice versa.
    IncompleteCredentials,
    /// No agent record for the presented id.
    UnknownAgent,
    /// Undecodable key, wrong signature length, unparseable timestamp.
    MalformedInput(String),
    /// Timestamp outside the replay window, signature not even checked.
    StaleTimestamp,
    /// Well-formed input, signature does not verify.
    VerificationFailed,
    /// Agent record exists but is suspended.
    AgentSuspended,
    /// Agent record exists but is revoked.
    AgentRevoked,
}

impl AuthReason {
    /// Suspended/revoked agents get 403, everything else 401.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, AuthReason::AgentSuspended | AuthReason::AgentRevoked)
    }
}

impl std::fmt::Display for AuthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthReason::IncompleteCredentials => write!(f, "incomplete credentials"),
            AuthReason::UnknownAgent => write!(f, "unknown agent"),
            AuthReason::MalformedInput(detail) => write!(f, "malformed input: {}", detail),
            AuthReason::StaleTimestamp => write!(f, "stale timestamp"),
            AuthReason::VerificationFailed => write!(f, "verification failed"),
            AuthReason::AgentSuspended => write!(f, "agent suspended"),
            AuthReason::AgentRevoked => write!(f, "agent revoked"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AccordError {
    #[error("Authentication failed: {0}")]
    Auth(AuthReason),

    #[error("Connection error: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Mandate chain error: {0}")]
    MandateChain(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Offer not found: {0}")]
    OfferNotFound(Uuid),
}

impl From<serde_json::Error> for AccordError {
    fn from(err: serde_json::Error) -> Self {
        AccordError::Validation(err.to_string())
    }
}

impl From<uuid::Error> for AccordError {
    fn from(err: uuid::Error) -> Self {
        AccordError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for AccordError {
    fn from(err: std::io::Error) -> Self {
        AccordError::Storage(err.to_string())
    }
}
