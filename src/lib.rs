#![deny(rust_2018_idioms)]

pub mod campaign;
pub mod config;
pub mod error;
pub mod fleet;
pub mod inventory;
pub mod machine;
pub mod progress;
pub mod report;
pub mod run;
pub mod util;

// Re-export the types that make up the public surface.
pub use campaign::{AbortHandle, Campaign, CampaignTemplate, SweepResult};
pub use config::{OrchestratorConfig, Testbed};
pub use error::OrchestratorError;
pub use fleet::{FailurePolicy, Fleet, FleetResult, HostOutcome, RemoteCommand};
pub use inventory::{Host, HostStatus, Inventory, Role};
pub use run::{RunArtifact, RunController, RunSpec, RunState};
