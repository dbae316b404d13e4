//! Reference worker kinds for taskforge.
//!
//! # Main entry points
//!
//! - [`register_builtins()`] — Register `echo`, `shell` and `triage` into a registry.
//! - [`EchoWorker`] — Returns its payload; useful for wiring and load tests.
//! - [`ShellWorker`] — Runs a command through `sh -c` with a timeout.
//! - [`TriageWorker`] — Keyword-driven diagnosis for swarm workflow runs.

/// Payload echo worker.
pub mod echo;
/// Shell command execution worker.
pub mod shell;
/// Keyword-based failure triage worker.
pub mod triage;

pub use echo::EchoWorker;
pub use shell::ShellWorker;
pub use triage::TriageWorker;

use taskforge_core::TaskforgeResult;
use taskforge_orchestrator::{worker_builder, WorkerRegistry};
use tracing::info;

/// Register every built-in worker kind.
pub fn register_builtins(registry: &WorkerRegistry) -> TaskforgeResult<()> {
    registry.register(EchoWorker::descriptor(), worker_builder(EchoWorker::new))?;
    registry.register(ShellWorker::descriptor(), worker_builder(ShellWorker::new))?;
    registry.register(TriageWorker::descriptor(), worker_builder(TriageWorker::new))?;
    info!(kinds = 3, "Built-in worker kinds registered");
    Ok(())
}
