//! Agent-side error taxonomy (§7). Mirrors `wirety_core::error`'s
//! `kind()`-accessor pattern and `wirety-server`'s `ServerError`: one leaf
//! enum, one stable machine-readable kind per variant.

use thiserror::Error;
use wirety_core::ErrorKind;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("wireguard kernel interface error: {0}")]
    Kernel(#[from] std::io::Error),

    #[error("firewall apply failed: {0}")]
    Firewall(String),

    #[error("dns resolver error: {0}")]
    Dns(String),

    #[error("distribution channel error: {0}")]
    Transport(String),

    #[error("malformed policy bundle: {0}")]
    Protocol(String),

    #[error("enrollment failed: {0}")]
    Enrollment(String),

    #[error("fatal agent failure: {0}")]
    Fatal(String),
}

impl AgentError {
    /// Maps onto §7's taxonomy. `Kernel`/`Firewall`/`Dns` failures are
    /// reported per-subsystem in `status_ack` and never abort the
    /// reconciliation loop (§4.5 step 6); only `Fatal` terminates the agent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Kernel(_) | AgentError::Firewall(_) | AgentError::Dns(_) => {
                ErrorKind::Transient
            },
            AgentError::Transport(_) => ErrorKind::Transient,
            AgentError::Protocol(_) => ErrorKind::Validation,
            AgentError::Enrollment(_) => ErrorKind::Authz,
            AgentError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether this failure should terminate the agent process, per §7's
    /// propagation policy ("Unrecoverable agent-side failures ... terminate
    /// the agent").
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Fatal(_))
    }
}
