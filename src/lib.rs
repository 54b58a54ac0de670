//! `carrierd`: a user-space M:N cooperative threading runtime.
//!
//! Fibers — lightweight, stackful, cooperatively scheduled tasks — are
//! multiplexed onto a fixed pool of OS threads called carriers, one
//! scheduler per carrier. A fiber runs until it either returns or
//! voluntarily suspends (today, only [`sleep_ms`] does the latter); it
//! never preempts and is never preempted.
//!
//! ```no_run
//! use carrierd::{spawn, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::start(RuntimeConfig::default()).unwrap();
//! // `spawn` works from any thread, including this one, which owns no
//! // carrier; it posts to a target carrier's inbox rather than running
//! // locally. See `demos/` for a worked example.
//! spawn(|| println!("hello from a fiber")).unwrap();
//! runtime.shutdown().unwrap();
//! ```

mod bus;
mod carrier;
mod clock;
mod context;
mod cpbuffer;
mod delegate;
mod error;
mod fiber;
mod message;
mod runtime;
mod scheduler;
mod stack;
mod timer;

pub use delegate::{delegate, Delegation};
pub use error::{Error, Result};
pub use runtime::{blocking_point, sleep_ms, spawn, Runtime, RuntimeConfig, SpawnOutcome};
pub use stack::StackAllocatorConfig;
