use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::inventory::Host;
use crate::machine::Machine;
use crate::util::shell_quote;
use color_eyre::Report;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A structured command descriptor. Commands cross the executor boundary
/// as program + arguments and are shell-quoted on render, never built by
/// ad hoc string concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    workdir: Option<String>,
}

impl RemoteCommand {
    pub fn new(program: impl ToString) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl ToString>) -> Self {
        self.args.extend(args.into_iter().map(|arg| arg.to_string()));
        self
    }

    pub fn current_dir(mut self, workdir: impl ToString) -> Self {
        self.workdir = Some(workdir.to_string());
        self
    }

    pub fn render(&self) -> String {
        let mut rendered = shell_quote(&self.program);
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&shell_quote(arg));
        }
        match &self.workdir {
            Some(workdir) => format!("cd {} && {}", shell_quote(workdir), rendered),
            None => rendered,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching at the first host failure; hosts after it are
    /// marked unreached.
    FailFast,
    /// Attempt every host; individual failures are recorded, not raised.
    WarnAndContinue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostOutcome {
    Success(String),
    Failed { code: i32, output: String },
    TimedOut,
    Unreached,
}

impl HostOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Connection-level failures (as opposed to a clean non-zero exit from
    /// the command itself): ssh exit 255, spawn errors, timeouts.
    fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::TimedOut | Self::Failed { code: 255, .. } | Self::Failed { code: -1, .. }
        )
    }
}

/// Per-host outcomes of one dispatch, in the order the hosts were given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetResult {
    pub outcomes: Vec<(Host, HostOutcome)>,
}

impl FleetResult {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_success())
    }

    pub fn successes(&self) -> impl Iterator<Item = (&Host, &str)> {
        self.outcomes.iter().filter_map(|(host, outcome)| match outcome {
            HostOutcome::Success(output) => Some((host, output.as_str())),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Host, &HostOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(host, outcome)| (host, outcome))
    }

    pub fn unreached(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, HostOutcome::Unreached))
            .map(|(host, _)| host.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FleetOptions {
    pub per_host_timeout: Duration,
    pub max_in_flight: usize,
}

/// Runs commands across a set of remote hosts. The executor is the only
/// component with true parallelism; fan-out is bounded by `max_in_flight`
/// and each host by `per_host_timeout`.
#[derive(Debug, Clone)]
pub struct Fleet {
    options: FleetOptions,
    ssh_user: String,
    ssh_key: Option<std::path::PathBuf>,
    local: bool,
}

impl Fleet {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            options: FleetOptions {
                per_host_timeout: config.per_host_timeout(),
                max_in_flight: config.max_in_flight,
            },
            ssh_user: config.ssh_user.clone(),
            ssh_key: config.ssh_key.clone(),
            local: config.testbed.is_local(),
        }
    }

    pub fn machine_for(&self, host: &Host) -> Machine {
        if self.local {
            Machine::Local
        } else {
            Machine::ssh(&self.ssh_user, &host.external_addr, self.ssh_key.clone())
        }
    }

    /// Dispatches `command` to every host under the given policy.
    pub async fn run_on(
        &self,
        hosts: &[Host],
        command: &RemoteCommand,
        policy: FailurePolicy,
    ) -> Result<FleetResult, Report> {
        let rendered = command.render();
        self.run_with(hosts, policy, |host| {
            let machine = self.machine_for(&host);
            let command = rendered.clone();
            async move { machine.exec_status(command).await }
        })
        .await
    }

    /// Copies a local script to every host as `remote_name` and executes it
    /// there. Used by the setup path (toolchain install, checkout, build).
    pub async fn run_script(
        &self,
        hosts: &[Host],
        local_script: impl AsRef<std::path::Path>,
        remote_name: &str,
        args: Vec<String>,
        policy: FailurePolicy,
    ) -> Result<FleetResult, Report> {
        let local_script = local_script.as_ref();
        self.run_with(hosts, policy, |host| {
            let machine = self.machine_for(&host);
            let args = args.clone();
            async move {
                machine.copy_to(local_script, remote_name).await?;
                let output = machine.script_exec(remote_name, args).await?;
                Ok((0, output))
            }
        })
        .await
    }

    /// Generic core: `f` produces the per-host execution future, which lets
    /// the lifecycle controller issue host-specific commands and lets tests
    /// observe dispatch order without a network.
    pub async fn run_with<F, Fut>(
        &self,
        hosts: &[Host],
        policy: FailurePolicy,
        f: F,
    ) -> Result<FleetResult, Report>
    where
        F: Fn(Host) -> Fut,
        Fut: Future<Output = Result<(i32, String), Report>>,
    {
        let result = match policy {
            FailurePolicy::FailFast => self.run_fail_fast(hosts, f).await,
            FailurePolicy::WarnAndContinue => self.run_warn_and_continue(hosts, f).await,
        };
        for (host, outcome) in result.failures() {
            tracing::warn!("command on {} did not succeed: {:?}", host.name, outcome);
        }

        if policy == FailurePolicy::WarnAndContinue
            && !result.outcomes.is_empty()
            && result
                .outcomes
                .iter()
                .all(|(_, outcome)| outcome.is_connection_failure())
        {
            let hosts = result.outcomes.iter().map(|(host, _)| host.name.clone()).collect();
            return Err(OrchestratorError::FleetUnreachable { hosts }.into());
        }
        Ok(result)
    }

    async fn run_warn_and_continue<F, Fut>(&self, hosts: &[Host], f: F) -> FleetResult
    where
        F: Fn(Host) -> Fut,
        Fut: Future<Output = Result<(i32, String), Report>>,
    {
        let timeout = self.options.per_host_timeout;
        let mut stream = futures::stream::iter(hosts.iter().cloned().enumerate().map(
            |(index, host)| {
                let fut = f(host.clone());
                async move {
                    let outcome = Self::outcome(timeout, fut).await;
                    (index, host, outcome)
                }
            },
        ))
        .buffer_unordered(self.options.max_in_flight.max(1));

        let mut outcomes: Vec<Option<(Host, HostOutcome)>> =
            hosts.iter().map(|_| None).collect();
        while let Some((index, host, outcome)) = stream.next().await {
            outcomes[index] = Some((host, outcome));
        }
        drop(stream);
        FleetResult {
            outcomes: outcomes.into_iter().flatten().collect(),
        }
    }

    async fn run_fail_fast<F, Fut>(&self, hosts: &[Host], f: F) -> FleetResult
    where
        F: Fn(Host) -> Fut,
        Fut: Future<Output = Result<(i32, String), Report>>,
    {
        let timeout = self.options.per_host_timeout;
        let mut outcomes = Vec::with_capacity(hosts.len());
        let mut failed = false;
        // strict dispatch order so that nothing past the first failure is
        // ever attempted
        for host in hosts {
            if failed {
                outcomes.push((host.clone(), HostOutcome::Unreached));
                continue;
            }
            let outcome = Self::outcome(timeout, f(host.clone())).await;
            failed = !outcome.is_success();
            outcomes.push((host.clone(), outcome));
        }
        FleetResult { outcomes }
    }

    async fn outcome<Fut>(timeout: Duration, fut: Fut) -> HostOutcome
    where
        Fut: Future<Output = Result<(i32, String), Report>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Err(_) => HostOutcome::TimedOut,
            Ok(Err(e)) => HostOutcome::Failed {
                code: -1,
                output: format!("{:#}", e),
            },
            Ok(Ok((0, output))) => HostOutcome::Success(output),
            Ok(Ok((code, output))) => HostOutcome::Failed { code, output },
        }
    }
}
