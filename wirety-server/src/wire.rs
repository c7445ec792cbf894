//! Re-export of the shared wire protocol (§6). Moved to `wirety-core` so
//! `wirety-agent-core` can decode the same frames without depending on
//! this crate; kept as a module here so existing `crate::wire::...` paths
//! in `channel.rs` keep working unchanged.

pub use wirety_core::wire::*;
