//! Domain model, IPAM engine and policy compiler shared between
//! `wirety-server` and `wirety-agent-core`.
//!
//! This crate is deliberately inert: it owns no repository, no socket, no
//! kernel handle. Everything here is either a plain data type or a pure
//! function over one.

pub mod compiler;
pub mod error;
pub mod id;
pub mod ipam;
pub mod model;
pub mod wire;

pub use error::{CompileError, ErrorKind, IpamError, ModelError};
