use thiserror::Error;

/// Failure taxonomy of the orchestrator. Variants are wrapped into
/// `color_eyre::Report` at the call sites so binaries keep context chains
/// while callers (and tests) can still `downcast_ref` for the kind.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The cloud listing command errored or its output could not be parsed.
    #[error("inventory unavailable: {reason}")]
    InventoryUnavailable { reason: String },

    /// A fail_fast dispatch stopped early; hosts after the failing one were
    /// never attempted.
    #[error(
        "fail_fast aborted after {attempted} host(s); unreached: {}",
        unreached.join(", ")
    )]
    PartialExecutionFailure {
        attempted: usize,
        unreached: Vec<String>,
    },

    /// No host in the fleet could be reached at all.
    #[error("fleet unreachable: {}", hosts.join(", "))]
    FleetUnreachable { hosts: Vec<String> },

    /// Some artifacts could not be retrieved. Partial retrievals are still
    /// returned; this error is only raised when nothing was fetched.
    #[error("fetch incomplete for run {run_id}; missing: {}", missing.join(", "))]
    FetchIncomplete {
        run_id: String,
        missing: Vec<String>,
    },

    /// Remote processes and log directories are namespaced by run_id, so a
    /// collision would silently overwrite a previous run.
    #[error("run id already used in this campaign: {run_id}")]
    RunIdCollision { run_id: String },
}
