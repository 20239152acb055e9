//! Core shared types for Kiln.
//!
//! This crate is intentionally small: the session identity and the
//! per-operation call context that every other layer threads through
//! explicitly.

mod context;
mod session;

pub use context::BuildContext;
pub use session::SessionId;
pub use tokio_util::sync::CancellationToken;
