//! Replay engine for GE frame dumps.
//!
//! Takes a dump loaded by `ge-dump` and re-drives the emulated GPU so the
//! captured frame reproduces without the original game running. The replay
//! logic runs on its own worker thread; everything that must happen on the
//! emulator's primary execution context (list enqueue, stall updates, syncs)
//! is marshalled through a one-at-a-time rendezvous ([`ops::OpSlot`]).
//!
//! The host emulator plugs in behind the trait seams in [`env`]; see
//! [`session::ReplaySession`] for the lifecycle entry points.

pub mod env;
pub mod exec;
pub mod ge;
pub mod mapping;
pub mod ops;
pub mod session;

#[cfg(test)]
pub(crate) mod testenv;

pub use env::{GeEngine, GuestMemory, ReplayConfig, ReplayEnv, ReplayHost, VecGuestRam};
pub use exec::{DumpExecutor, RunOutcome};
pub use ops::{OpKind, Operation};
pub use session::{ReplayError, ReplayResult, ReplaySession};
