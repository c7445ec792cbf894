use std::fmt;

use thiserror::Error;

/// Stable, machine-readable error kind. HTTP and other external boundaries
/// map this onto their own status codes; the core never does that mapping
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Exhaustion,
    Authz,
    Transient,
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Exhaustion => "exhaustion",
            ErrorKind::Authz => "authz",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Details attached to a circular-routing rejection (I2), as required by §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularRoutingDetail {
    pub peer_id: String,
    pub group_id: String,
    pub route_ids: Vec<String>,
}

/// Errors raised while validating or mutating the declarative model (C1/C5).
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("duplicate {what}: {name}")]
    Duplicate { what: &'static str, name: String },

    #[error("circular routing: peer {} is a member of group {} which is routed through it via {:?}", .0.peer_id, .0.group_id, .0.route_ids)]
    CircularRouting(CircularRoutingDetail),

    #[error("DNS mapping {ip} is not contained in route destination {cidr}")]
    DnsMappingOutsideRoute { ip: String, cidr: String },

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::NotFound(_) => ErrorKind::NotFound,
            ModelError::Duplicate { .. } | ModelError::CircularRouting(_) => ErrorKind::Conflict,
            ModelError::DnsMappingOutsideRoute { .. } | ModelError::Invalid(_) => {
                ErrorKind::Validation
            },
        }
    }
}

/// Errors raised by the IPAM engine (C3).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpamError {
    #[error("prefix pool exhausted under {0}")]
    PrefixExhausted(String),

    #[error("requested CIDR {0} overlaps an existing allocation")]
    CidrOverlap(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("IP pool exhausted in {0}")]
    IpExhausted(String),

    #[error("prefix {0} not found")]
    PrefixNotFound(String),

    #[error("prefix {0} still has allocated descendants or addresses")]
    PrefixNotEmpty(String),
}

impl IpamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpamError::PrefixExhausted(_) | IpamError::IpExhausted(_) => ErrorKind::Exhaustion,
            IpamError::CidrOverlap(_) | IpamError::PrefixNotEmpty(_) => ErrorKind::Conflict,
            IpamError::InvalidCidr(_) => ErrorKind::Validation,
            IpamError::PrefixNotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Errors raised by the policy compiler (C4). The compiler is pure and
/// total apart from refusing to compile a model that violates §3's
/// invariants.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid model: {0}")]
    InvalidModel(#[from] ModelError),
}

impl CompileError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
