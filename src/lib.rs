//! Coordination core for a DAG-driven multi-agent code-generation system.
//!
//! Three subsystems carry the load:
//!
//! - the [`fabric`]: a durable, concurrently shared SQLite store for task
//!   states, published interface artifacts (entanglements), file claims,
//!   agent-surfaced discoveries, and per-task working memory;
//! - the [`scheduler`]: derives eligibility from the dependency [`dag`],
//!   gates dispatch through a [`poll`] scan, tracks [`blocked`] tasks with
//!   [`pushback`] retry/escalation, and re-evaluates them as shared state
//!   changes;
//! - the pre-review [`filter`] chain and the [`publisher`]: deterministic
//!   validation of produced work, then artifact extraction into the fabric.
//!
//! The command-line surface, configuration loading, TUI, LLM invocation,
//! and git all live outside this crate and are reached through the traits
//! in [`poll`], [`publisher`], [`scheduler`], and [`telemetry`].

pub mod blocked;
pub mod cancel;
pub mod dag;
pub mod error;
pub mod fabric;
pub mod filter;
pub mod model;
pub mod poll;
pub mod publisher;
pub mod pushback;
pub mod scheduler;
pub mod snapshot;
pub mod telemetry;

pub use error::{Result, TychoError};
pub use fabric::Fabric;
pub use scheduler::Scheduler;
pub use snapshot::Snapshot;
