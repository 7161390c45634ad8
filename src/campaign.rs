use crate::config::OrchestratorConfig;
use crate::fleet::Fleet;
use crate::inventory::Host;
use crate::run::{RunArtifact, RunController, RunRegistry, RunSpec};
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative abort flag, checked between sweep phases. Aborting stops
/// the in-flight run, fetches what is available and halts the sweep;
/// already-dispatched per-host commands complete normally.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a sweep varies and what stays fixed across its runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTemplate {
    pub name: String,
    /// The swept parameter, e.g. `max_async` or `block_size`.
    pub parameter_name: String,
    /// Parameters written to the client configuration at every point.
    pub base_parameters: BTreeMap<String, String>,
}

impl CampaignTemplate {
    pub fn new(name: impl ToString, parameter_name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            parameter_name: parameter_name.to_string(),
            base_parameters: BTreeMap::new(),
        }
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, Report> {
        let file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("open template {}", path.as_ref().display()))?;
        let template = serde_json::from_reader(std::io::BufReader::new(file))
            .wrap_err("parse template")?;
        Ok(template)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointStatus {
    Ok,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPoint {
    pub value: u64,
    pub run_id: String,
    pub status: PointStatus,
    pub artifact: Option<RunArtifact>,
}

/// One sweep's collected points, sorted by ascending parameter value
/// regardless of execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub campaign: String,
    pub points: Vec<SweepPoint>,
    /// True when the sweep was halted by the abort flag before all values
    /// were attempted.
    pub aborted: bool,
}

impl SweepResult {
    /// Exit code for the CLI: 0 full success, 1 partial, 2 total failure.
    /// An aborted sweep is at most partial, and an empty sweep (nothing
    /// requested, nothing failed) is a success.
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            return 1;
        }
        if self.points.is_empty() {
            return 0;
        }
        let ok = self
            .points
            .iter()
            .filter(|point| point.status != PointStatus::Failed)
            .count();
        if ok == self.points.len() {
            0
        } else if ok > 0 {
            1
        } else {
            2
        }
    }
}

/// Iterates the run lifecycle across a parameter sweep, one run at a time.
/// The sweeper's job is maximal data collection: a failed point is
/// recorded and the remaining points still execute.
pub struct Campaign {
    config: OrchestratorConfig,
    template: CampaignTemplate,
    registry: RunRegistry,
    abort: AbortHandle,
    progress: Option<crate::progress::TracingProgressBar>,
}

impl Campaign {
    pub fn new(config: OrchestratorConfig, template: CampaignTemplate) -> Self {
        Self {
            config,
            template,
            registry: RunRegistry::default(),
            abort: AbortHandle::default(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: crate::progress::TracingProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Runs one sweep point per value, in the order the values are given,
    /// waiting `inter_run_delay` after start so throughput reaches steady
    /// state before stopping.
    pub async fn run_sweep(
        &mut self,
        values: &[u64],
        replica_hosts: Vec<Host>,
        client_hosts: Vec<Host>,
        inter_run_delay: Duration,
    ) -> Result<SweepResult, Report> {
        let mut controller = RunController::new(self.config.clone());
        let mut points = Vec::with_capacity(values.len());
        let mut aborted = false;

        for &value in values {
            if self.abort.is_aborted() {
                tracing::warn!("sweep aborted; {} point(s) collected", points.len());
                aborted = true;
                break;
            }

            self.write_client_config(value)
                .wrap_err("write client config")?;

            let base_id = format!(
                "{}_{}{}",
                self.template.name, self.template.parameter_name, value
            );
            let run_id = self.registry.claim_unique(&base_id);
            let spec = self.run_spec(value, run_id, replica_hosts.clone(), client_hosts.clone());

            let point = self
                .run_point(&mut controller, &spec, value, inter_run_delay)
                .await;
            points.push(point);
            if let Some(progress) = &self.progress {
                progress.inc();
            }
        }
        if let Some(progress) = &self.progress {
            progress.finish();
        }

        // report sorted by parameter value, not by execution order
        points.sort_by_key(|point| point.value);
        let result = SweepResult {
            campaign: self.template.name.clone(),
            points,
            aborted,
        };
        self.write_report(&result)?;
        Ok(result)
    }

    async fn run_point(
        &self,
        controller: &mut RunController,
        spec: &RunSpec,
        value: u64,
        inter_run_delay: Duration,
    ) -> SweepPoint {
        tracing::info!(
            "> sweep point {} = {} (run {})",
            self.template.parameter_name,
            value,
            spec.run_id
        );

        // clients read the swept configuration at start, so it has to be
        // on every client host before the run begins
        if let Err(e) = self.push_client_config(&spec.client_hosts).await {
            tracing::warn!("run {} config push failed: {:#}", spec.run_id, e);
            return SweepPoint {
                value,
                run_id: spec.run_id.clone(),
                status: PointStatus::Failed,
                artifact: None,
            };
        }

        if let Err(e) = controller.start(spec).await {
            tracing::warn!("run {} failed to start: {:#}", spec.run_id, e);
            // best-effort cleanup so the next point starts from a clean fleet
            if let Err(e) = controller.stop(spec).await {
                tracing::warn!("cleanup stop of {} failed: {:#}", spec.run_id, e);
            }
            return SweepPoint {
                value,
                run_id: spec.run_id.clone(),
                status: PointStatus::Failed,
                artifact: None,
            };
        }

        tokio::time::sleep(inter_run_delay).await;

        if let Err(e) = controller.stop(spec).await {
            tracing::warn!("run {} failed to stop: {:#}", spec.run_id, e);
            return SweepPoint {
                value,
                run_id: spec.run_id.clone(),
                status: PointStatus::Failed,
                artifact: None,
            };
        }

        match controller.fetch(spec).await {
            Ok(artifact) => SweepPoint {
                value,
                run_id: spec.run_id.clone(),
                status: if artifact.degraded {
                    PointStatus::Degraded
                } else {
                    PointStatus::Ok
                },
                artifact: Some(artifact),
            },
            Err(e) => {
                tracing::warn!("run {} fetch failed: {:#}", spec.run_id, e);
                SweepPoint {
                    value,
                    run_id: spec.run_id.clone(),
                    status: PointStatus::Failed,
                    artifact: None,
                }
            }
        }
    }

    fn run_spec(
        &self,
        value: u64,
        run_id: String,
        replica_hosts: Vec<Host>,
        client_hosts: Vec<Host>,
    ) -> RunSpec {
        let mut parameters = self.template.base_parameters.clone();
        parameters.insert(self.template.parameter_name.clone(), value.to_string());
        RunSpec {
            run_id,
            parameters,
            replica_hosts,
            client_hosts,
        }
    }

    /// Writes the key-value document the external client binaries read at
    /// their next start.
    fn write_client_config(&self, value: u64) -> Result<(), Report> {
        let path = &self.config.client_config_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut content = String::new();
        for (key, val) in &self.template.base_parameters {
            content.push_str(&format!("{} = {}\n", key, val));
        }
        content.push_str(&format!("{} = {}\n", self.template.parameter_name, value));
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Copies the freshly written configuration document to every client
    /// host, when a remote location is configured.
    async fn push_client_config(&self, hosts: &[Host]) -> Result<(), Report> {
        let remote_path = match &self.config.remote_config_path {
            Some(path) => path,
            None => return Ok(()),
        };
        let fleet = Fleet::from_config(&self.config);
        for host in hosts {
            fleet
                .machine_for(host)
                .copy_to(&self.config.client_config_path, remote_path)
                .await
                .wrap_err_with(|| format!("push config to {}", host.name))?;
        }
        Ok(())
    }

    fn write_report(&self, result: &SweepResult) -> Result<(), Report> {
        std::fs::create_dir_all(&self.config.results_dir)?;
        let path = self
            .config
            .results_dir
            .join(format!("{}_report.json", self.template.name));
        let content = serde_json::to_string_pretty(result).wrap_err("serialize report")?;
        std::fs::write(&path, content)
            .wrap_err_with(|| format!("write report {}", path.display()))?;
        tracing::info!("sweep report written to {}", path.display());
        Ok(())
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

    fn campaign(dir: &std::path::Path) -> Campaign {
        let remote = dir.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("stderr"), "[10, 30, 20]\nlat = 4.2ms\n").unwrap();

        let config = OrchestratorConfig {
            testbed: Testbed::Local,
            settle_delay_secs: 0,
            results_dir: dir.join("results"),
            client_config_path: dir.join("deploy").join("bench.conf"),
            remote_config_path: None,
            commands: CommandSet {
                replica_start: CommandTemplate::new("true", vec![]),
                client_start: CommandTemplate::new("true", vec![]),
                replica_stop: CommandTemplate::new("true", vec![]),
                client_stop: CommandTemplate::new("true", vec![]),
                remote_log_dir: remote.display().to_string(),
            },
            ..OrchestratorConfig::default()
        };
        let mut template = CampaignTemplate::new("bench", "max_async");
        template
            .base_parameters
            .insert("block_size".to_string(), "400".to_string());
        Campaign::new(config, template)
    }

    fn hosts() -> (Vec<Host>, Vec<Host>) {
        (
            vec![host("replica-a", Role::Replica)],
            vec![host("client-a", Role::Client)],
        )
    }

    #[tokio::test]
    async fn repeated_values_get_distinct_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[5, 10, 5], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(result.points.len(), 3);
        let mut ids: Vec<_> = result.points.iter().map(|p| p.run_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3, "run ids must never collide");
    }

    #[tokio::test]
    async fn result_is_sorted_by_value_not_execution_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[30, 10, 20], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        let values: Vec<_> = result.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![10, 20, 30]);
        assert!(result.points.iter().all(|p| p.status == PointStatus::Ok));
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn failed_point_does_not_abort_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        // replicas never start
        campaign.config.commands.replica_start = CommandTemplate::new("false", vec![]);
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[10, 20], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(result.points.len(), 2);
        assert!(result.points.iter().all(|p| p.status == PointStatus::Failed));
        assert_eq!(result.exit_code(), 2);
    }

    #[tokio::test]
    async fn config_document_carries_base_and_swept_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let (replicas, clients) = hosts();
        campaign
            .run_sweep(&[7], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("deploy").join("bench.conf")).unwrap();
        assert_eq!(content, "block_size = 400\nmax_async = 7\n");
    }

    #[tokio::test]
    async fn abort_halts_before_the_next_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        campaign.abort_handle().abort();
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[10, 20], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(result.points.is_empty());
        // an aborted sweep is at most a partial success, never a total
        // failure
        assert!(result.aborted);
        assert_eq!(result.exit_code(), 1);
    }

    #[tokio::test]
    async fn empty_sweep_is_a_clean_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(result.points.is_empty());
        assert!(!result.aborted);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test]
    async fn config_document_is_pushed_to_client_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let pushed = dir.path().join("pushed.conf");
        campaign.config.remote_config_path = Some(pushed.display().to_string());
        let (replicas, clients) = hosts();
        let result = campaign
            .run_sweep(&[7], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        assert_eq!(result.exit_code(), 0);
        let content = std::fs::read_to_string(&pushed).unwrap();
        assert_eq!(content, "block_size = 400\nmax_async = 7\n");
    }

    #[tokio::test]
    async fn report_is_written_next_to_the_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = campaign(dir.path());
        let (replicas, clients) = hosts();
        campaign
            .run_sweep(&[10], replicas, clients, Duration::from_millis(0))
            .await
            .unwrap();

        let report = dir.path().join("results").join("bench_report.json");
        let content = std::fs::read_to_string(report).unwrap();
        let parsed: SweepResult = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.campaign, "bench");
        assert_eq!(parsed.points.len(), 1);
    }
}
