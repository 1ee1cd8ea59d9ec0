//! Pocketclaw - embedded personal assistant runtime library
//!
//! Pocketclaw receives messages from chat surfaces, keeps a bounded
//! per-conversation history, asks a chain of language-model backends for a
//! reply, lets the model invoke a small set of sandboxed capabilities, and
//! sends the answer back to the originating surface.
//!
//! # Architecture
//!
//! - `session`: per-conversation history, bounded and persisted
//! - `providers`: inference backends and the fallback router
//! - `tools`: capability registry, sandbox and dispatcher
//! - `transport`: surface adapters, reconnect supervision, outbound routing
//! - `agent`: the turn loop, per-session lanes and runtime wiring
//! - `scheduler`: deferred prompts injected back into the event flow
//! - `config`, `error`, `logging`, `metrics`, `cli`: ambient plumbing
//!
//! # Example
//!
//! ```no_run
//! use pocketclaw::{Config, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let runtime = Runtime::builder(config).start()?;
//!     runtime.run().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod tools;
pub mod transport;

// Re-export commonly used types
pub use agent::{AgentLoop, Runtime, TurnOutcome};
pub use config::Config;
pub use error::{PocketclawError, Result};
pub use providers::InferenceRouter;
pub use session::{Message, Session, SessionStore};
pub use transport::{CanonicalEvent, OutboundReply, TransportAdapter};

#[cfg(test)]
pub mod test_utils;
