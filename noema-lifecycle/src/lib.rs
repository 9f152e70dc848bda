//! Generation Lifecycle Engine (§4.F): accepts a tool invocation, dispatches to the
//! appropriate runtime, tracks status through webhooks, and settles cost on terminal
//! transitions. The only code in the workspace that mutates a generation record.

pub mod cost;
pub mod engine;
pub mod error;
pub mod runtimes;

pub use engine::{ExecuteHints, ExecuteOutcome, LifecycleEngine};
pub use error::LifecycleError;
pub use runtimes::RuntimeTable;
