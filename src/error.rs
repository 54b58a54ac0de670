//! Error handling utils.
//!
//! Collaborator failures (stack exhaustion, readiness wait failures) are
//! surfaced through [`Error`]. Core scheduler invariants
//! (a fiber is on at most one list, etc.) are asserted with `debug_assert!`
//! rather than encoded as `Error` variants: violating them is a bug in this
//! crate, not a recoverable condition an embedder can act on.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases surfaced by the public API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to allocate a fiber stack")]
    StackAllocation,

    #[error("readiness wait failed: {0}")]
    Readiness(#[source] io::Error),

    #[error("failed to create the notification descriptor: {0}")]
    NotificationSetup(#[source] io::Error),

    #[error("a carrier thread panicked")]
    CarrierPanicked,
}
