//! Agent loop and runtime
//!
//! - [`core`] - one turn: generate, dispatch capabilities, reply, commit
//! - [`context`] - generation request assembly from session history
//! - [`lanes`] - per-session ordering and global concurrency limit
//! - [`runtime`] - component wiring, background tasks, graceful shutdown

pub mod context;
pub mod core;
pub mod lanes;
pub mod runtime;

pub use core::{AgentLoop, AgentSettings, TurnOutcome, TurnStatus};
pub use lanes::LaneSet;
pub use runtime::{Runtime, RuntimeBuilder};
