use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::fleet::{FailurePolicy, Fleet};
use crate::inventory::Host;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

/// Everything one benchmark run needs, fixed up front: a campaign-unique
/// run_id, the swept parameters, and the replica/client host sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: String,
    pub parameters: BTreeMap<String, String>,
    pub replica_hosts: Vec<Host>,
    pub client_hosts: Vec<Host>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Fetching,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run_id: String,
    pub fetched: Vec<PathBuf>,
    pub degraded: bool,
}

/// Claims run_ids so a campaign can never reuse one: remote processes and
/// log directories are namespaced by run_id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    used: HashSet<String>,
}

impl RunRegistry {
    pub fn claim(&mut self, run_id: &str) -> Result<(), OrchestratorError> {
        if self.used.insert(run_id.to_string()) {
            Ok(())
        } else {
            Err(OrchestratorError::RunIdCollision {
                run_id: run_id.to_string(),
            })
        }
    }

    /// Claims `base` or, when taken, the first free `base_rN`.
    pub fn claim_unique(&mut self, base: &str) -> String {
        if self.claim(base).is_ok() {
            return base.to_string();
        }
        let mut attempt = 2;
        loop {
            let candidate = format!("{}_r{}", base, attempt);
            if self.claim(&candidate).is_ok() {
                return candidate;
            }
            attempt += 1;
        }
    }
}

/// Drives a single run through start -> steady state -> stop -> fetch.
/// Sequential by design: host sets overlap across sweep points, so only
/// one run may mutate fleet process state at a time.
pub struct RunController {
    config: OrchestratorConfig,
    fleet: Fleet,
    state: RunState,
    origin: Instant,
    active: Option<ActiveRun>,
}

struct ActiveRun {
    run_id: String,
    host_names: HashSet<String>,
}

impl RunController {
    pub fn new(config: OrchestratorConfig) -> Self {
        let fleet = Fleet::from_config(&config);
        Self {
            config,
            fleet,
            state: RunState::Idle,
            origin: Instant::now(),
            active: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        tracing::info!(
            elapsed_ms = self.origin.elapsed().as_millis() as u64,
            "run state {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Starts replicas, waits for them to settle, then starts clients.
    pub async fn start(&mut self, spec: &RunSpec) -> Result<(), Report> {
        if let Some(active) = &self.active {
            let overlap = spec
                .replica_hosts
                .iter()
                .chain(spec.client_hosts.iter())
                .any(|host| active.host_names.contains(&host.name));
            if overlap {
                return Err(Report::msg(format!(
                    "run {} is still active on an overlapping host set; stop it before starting {}",
                    active.run_id, spec.run_id
                )));
            }
        }
        self.transition(RunState::Starting);

        let replica_start = self.config.commands.replica_start.render(&spec.run_id);
        let result = match self
            .fleet
            .run_on(&spec.replica_hosts, &replica_start, FailurePolicy::FailFast)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.transition(RunState::Failed);
                return Err(e.wrap_err("start replicas"));
            }
        };
        if !result.all_ok() {
            self.transition(RunState::Failed);
            return Err(OrchestratorError::PartialExecutionFailure {
                attempted: result.outcomes.len() - result.unreached().len(),
                unreached: result.unreached(),
            }
            .into());
        }

        // give replicas time to reach a ready state before load arrives
        tokio::time::sleep(self.config.settle_delay()).await;

        let client_start = self.config.commands.client_start.render(&spec.run_id);
        let result = match self
            .fleet
            .run_on(&spec.client_hosts, &client_start, FailurePolicy::FailFast)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.transition(RunState::Failed);
                return Err(e.wrap_err("start clients"));
            }
        };
        if !result.all_ok() {
            self.transition(RunState::Failed);
            return Err(OrchestratorError::PartialExecutionFailure {
                attempted: result.outcomes.len() - result.unreached().len(),
                unreached: result.unreached(),
            }
            .into());
        }

        self.active = Some(ActiveRun {
            run_id: spec.run_id.clone(),
            host_names: spec
                .replica_hosts
                .iter()
                .chain(spec.client_hosts.iter())
                .map(|host| host.name.clone())
                .collect(),
        });
        self.transition(RunState::Running);
        Ok(())
    }

    /// Stops clients first (so load never hits a terminating replica set),
    /// then replicas. Idempotent: stopping an already-stopped run is a
    /// success no-op.
    pub async fn stop(&mut self, spec: &RunSpec) -> Result<(), Report> {
        if self.active.is_none() && matches!(self.state, RunState::Idle | RunState::Done) {
            tracing::info!("run {} already stopped", spec.run_id);
            return Ok(());
        }
        self.transition(RunState::Stopping);

        let client_stop = self.config.commands.client_stop.render(&spec.run_id);
        if let Err(e) = self
            .fleet
            .run_on(&spec.client_hosts, &client_stop, FailurePolicy::WarnAndContinue)
            .await
        {
            self.transition(RunState::Failed);
            return Err(e.wrap_err("stop clients"));
        }

        let replica_stop = self.config.commands.replica_stop.render(&spec.run_id);
        if let Err(e) = self
            .fleet
            .run_on(&spec.replica_hosts, &replica_stop, FailurePolicy::WarnAndContinue)
            .await
        {
            self.transition(RunState::Failed);
            return Err(e.wrap_err("stop replicas"));
        }

        self.active = None;
        Ok(())
    }

    /// Retrieves each client host's logs into
    /// `<results_dir>/<run_id>/<host>/`. Partial-success: collects what it
    /// can and flags the artifact degraded when some hosts fail; errors
    /// only when nothing at all was retrieved.
    pub async fn fetch(&mut self, spec: &RunSpec) -> Result<RunArtifact, Report> {
        self.transition(RunState::Fetching);

        let run_dir = self.config.results_dir.join(&spec.run_id);
        let mut fetched = Vec::new();
        let mut missing = Vec::new();

        for host in &spec.client_hosts {
            // the log dir template may also be host-specific
            let remote_dir = self
                .config
                .commands
                .log_dir(&spec.run_id)
                .replace("{host}", &host.name);
            let local_dir = run_dir.join(&host.name);
            if let Err(e) = std::fs::create_dir_all(&local_dir) {
                tracing::warn!("create {}: {}", local_dir.display(), e);
                missing.push(host.name.clone());
                continue;
            }
            let machine = self.fleet.machine_for(host);
            match machine.copy_from(&remote_dir, &local_dir).await {
                Ok(()) => fetched.push(local_dir),
                Err(e) => {
                    tracing::warn!("fetch from {} failed: {:#}", host.name, e);
                    missing.push(host.name.clone());
                }
            }
        }

        if fetched.is_empty() && !spec.client_hosts.is_empty() {
            self.transition(RunState::Failed);
            return Err(OrchestratorError::FetchIncomplete {
                run_id: spec.run_id.clone(),
                missing,
            }
            .into());
        }

        if !missing.is_empty() {
            tracing::warn!(
                "run {} fetched {} host(s), missing {}",
                spec.run_id,
                fetched.len(),
                missing.join(", ")
            );
        }
        self.transition(RunState::Done);
        Ok(RunArtifact {
            run_id: spec.run_id.clone(),
            fetched,
            degraded: !missing.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSet, CommandTemplate, Testbed};
    use crate::inventory::{HostStatus, Role};

    fn host(name: &str, role: Role) -> Host {
        Host {
            name: name.to_string(),
            internal_addr: "10.0.0.1".to_string(),
            external_addr: "127.0.0.1".to_string(),
            status: HostStatus::Running,
            role: Some(role),
        }
    }

    fn spec(run_id: &str) -> RunSpec {
        RunSpec {
            run_id: run_id.to_string(),
            parameters: BTreeMap::new(),
            replica_hosts: vec![host("replica-a", Role::Replica)],
            client_hosts: vec![host("client-a", Role::Client), host("client-b", Role::Client)],
        }
    }

    fn local_config(results_dir: PathBuf, remote_log_dir: String) -> OrchestratorConfig {
        OrchestratorConfig {
            testbed: Testbed::Local,
            settle_delay_secs: 0,
            results_dir,
            commands: CommandSet {
                replica_start: CommandTemplate::new("true", vec![]),
                client_start: CommandTemplate::new("true", vec![]),
                replica_stop: CommandTemplate::new("true", vec![]),
                client_stop: CommandTemplate::new("true", vec![]),
                remote_log_dir,
            },
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn registry_rejects_collisions() {
        let mut registry = RunRegistry::default();
        registry.claim("run1").unwrap();
        let err = registry.claim("run1").unwrap_err();
        assert!(matches!(err, OrchestratorError::RunIdCollision { .. }));
    }

    #[test]
    fn registry_uniquifies_repeats() {
        let mut registry = RunRegistry::default();
        assert_eq!(registry.claim_unique("bench_async5"), "bench_async5");
        assert_eq!(registry.claim_unique("bench_async5"), "bench_async5_r2");
        assert_eq!(registry.claim_unique("bench_async5"), "bench_async5_r3");
    }

    #[tokio::test]
    async fn full_cycle_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("stderr"), "[10, 20]\nlat = 3.5ms\n").unwrap();

        let config = local_config(
            dir.path().join("results"),
            remote.display().to_string(),
        );
        let mut controller = RunController::new(config);
        let spec = spec("cycle");

        controller.start(&spec).await.unwrap();
        assert_eq!(controller.state(), RunState::Running);
        controller.stop(&spec).await.unwrap();
        let artifact = controller.fetch(&spec).await.unwrap();
        assert_eq!(controller.state(), RunState::Done);
        assert!(!artifact.degraded);
        assert_eq!(artifact.fetched.len(), 2);
        for path in &artifact.fetched {
            assert!(path.join("remote").join("stderr").exists());
        }
    }

    #[tokio::test]
    async fn start_fails_when_replicas_cannot_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(dir.path().join("results"), "unused".to_string());
        config.commands.replica_start = CommandTemplate::new("false", vec![]);

        let mut controller = RunController::new(config);
        let err = controller.start(&spec("bad")).await.unwrap_err();
        assert_eq!(controller.state(), RunState::Failed);
        let err = err.downcast_ref::<OrchestratorError>().unwrap();
        assert!(matches!(err, OrchestratorError::PartialExecutionFailure { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path().join("results"), "unused".to_string());
        let mut controller = RunController::new(config);
        // never started: stop is a success no-op
        controller.stop(&spec("noop")).await.unwrap();
        assert_eq!(controller.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn unreachable_stop_transitions_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config(dir.path().join("results"), "unused".to_string());
        // exit 255 is what ssh reports on connection-level failures
        config.commands.client_stop =
            CommandTemplate::new("bash", crate::args!["-c", "exit 255"]);

        let mut controller = RunController::new(config);
        controller.start(&spec("lost")).await.unwrap();
        let err = controller.stop(&spec("lost")).await.unwrap_err();
        assert_eq!(controller.state(), RunState::Failed);
        let err = err.downcast_ref::<OrchestratorError>().unwrap();
        assert!(matches!(err, OrchestratorError::FleetUnreachable { .. }));
    }

    #[tokio::test]
    async fn start_refuses_overlapping_active_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path().join("results"), "unused".to_string());
        let mut controller = RunController::new(config);
        controller.start(&spec("first")).await.unwrap();
        assert!(controller.start(&spec("second")).await.is_err());
        controller.stop(&spec("first")).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_collects_what_it_can_and_flags_degraded() {
        let dir = tempfile::tempdir().unwrap();
        // logs exist for client-a and client-b but not client-c
        for name in ["client-a", "client-b"] {
            let remote = dir.path().join(name).join("remote");
            std::fs::create_dir_all(&remote).unwrap();
            std::fs::write(remote.join("stderr"), "log").unwrap();
        }

        let template = dir.path().join("{host}").join("remote");
        let config = local_config(
            dir.path().join("results"),
            template.display().to_string(),
        );
        let mut controller = RunController::new(config);
        let mut spec = spec("partial");
        spec.client_hosts.push(host("client-c", Role::Client));

        let artifact = controller.fetch(&spec).await.unwrap();
        assert_eq!(controller.state(), RunState::Done);
        assert!(artifact.degraded);
        assert_eq!(artifact.fetched.len(), 2);
    }

    #[tokio::test]
    async fn fetch_with_nothing_retrieved_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(
            dir.path().join("results"),
            dir.path().join("absent").display().to_string(),
        );
        let mut controller = RunController::new(config);
        let err = controller.fetch(&spec("gone")).await.unwrap_err();
        assert_eq!(controller.state(), RunState::Failed);
        let err = err.downcast_ref::<OrchestratorError>().unwrap();
        assert!(matches!(err, OrchestratorError::FetchIncomplete { .. }));
    }
}
