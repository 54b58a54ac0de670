//! Cross-carrier message wire format.
//!
//! The source routes every inbound message through a base-type-indexed
//! function-pointer table (`p7r_internal_handlers[]`). This implementation
//! uses a tagged enum and an exhaustive `match` instead (see design note
//! §9): there is no raw type word, no sparse table, and no way to dispatch
//! to an out-of-range handler. The one case the source's table left
//! genuinely unreachable — an unrecognized base type — becomes, here, a
//! variant `match` cannot produce through the public API; the only place it
//! is still handled defensively is the teardown drain (see
//! [`crate::scheduler::Scheduler::drop`]), which logs and drops anything it
//! does not recognize rather than panicking.

use crate::fiber::Entrance;

/// A message handed from one carrier's producer side to another carrier's
/// [`crate::cpbuffer::CpBuffer`] consumer side.
pub enum Message {
    /// A fiber-spawn request that resolved to a remote carrier. The tail is
    /// the boxed entry closure (the source's `{entrance, argument}` pair,
    /// expressed here as one FnOnce capture instead of an untyped pointer
    /// pair).
    UthreadRequest(Entrance),

    /// Cooperative shutdown signal (new relative to the source, which has
    /// no modeled shutdown path at all — see `SPEC_FULL.md` §5/§6).
    Shutdown,
}
