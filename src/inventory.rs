use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::machine::Machine;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Replica,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostStatus {
    Running,
    Stopped,
    Unknown,
}

impl HostStatus {
    fn parse(token: &str) -> Self {
        match token {
            "RUNNING" => Self::Running,
            "STOPPED" | "TERMINATED" | "STOPPING" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub internal_addr: String,
    pub external_addr: String,
    pub status: HostStatus,
    pub role: Option<Role>,
}

/// Discovers and classifies the remote hosts backing a deployment by
/// querying the cloud provider's instance listing. Queries are never
/// cached: instance state can change between calls.
#[derive(Debug, Clone)]
pub struct Inventory {
    list_command: String,
    replica_keyword: String,
    client_keyword: String,
}

impl Inventory {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            list_command: config.list_command.clone(),
            replica_keyword: config.replica_keyword.clone(),
            client_keyword: config.client_keyword.clone(),
        }
    }

    /// Returns the RUNNING hosts whose name contains `role_filter` (when
    /// set), in listing order.
    pub async fn resolve(&self, role_filter: Option<&str>) -> Result<Vec<Host>, Report> {
        let machine = Machine::Local;
        let (code, output) = machine
            .exec_status(&self.list_command)
            .await
            .map_err(|e| OrchestratorError::InventoryUnavailable {
                reason: format!("{}: {}", self.list_command, e),
            })?;
        if code != 0 {
            return Err(OrchestratorError::InventoryUnavailable {
                reason: format!("{} exited with status {}: {}", self.list_command, code, output),
            }
            .into());
        }
        let hosts = self.parse_listing(&output, role_filter)?;
        tracing::info!("inventory resolved {} running host(s)", hosts.len());
        Ok(hosts)
    }

    /// Parses the whitespace-tokenized instance table. The header row is
    /// only validated; data columns are located from the end of each row
    /// (status is the last token, the two addresses precede it), which is
    /// stable even when optional middle columns are empty.
    pub fn parse_listing(
        &self,
        output: &str,
        role_filter: Option<&str>,
    ) -> Result<Vec<Host>, OrchestratorError> {
        let mut lines = output.lines().filter(|line| !line.trim().is_empty());
        let header = lines.next().ok_or_else(|| OrchestratorError::InventoryUnavailable {
            reason: "empty listing output".to_string(),
        })?;
        if !header.contains("NAME") || !header.contains("STATUS") {
            return Err(OrchestratorError::InventoryUnavailable {
                reason: format!("unrecognized listing header: {}", header),
            });
        }

        let mut hosts = Vec::new();
        let mut rows = 0;
        for line in lines {
            rows += 1;
            let tokens: Vec<_> = line.split_whitespace().collect();
            if tokens.len() < 4 {
                return Err(OrchestratorError::InventoryUnavailable {
                    reason: format!("malformed listing row: {}", line),
                });
            }
            let name = tokens[0];
            let status = HostStatus::parse(tokens[tokens.len() - 1]);
            if status != HostStatus::Running {
                continue;
            }
            if let Some(filter) = role_filter {
                if !name.contains(filter) {
                    continue;
                }
            }
            hosts.push(Host {
                name: name.to_string(),
                internal_addr: tokens[tokens.len() - 3].to_string(),
                external_addr: tokens[tokens.len() - 2].to_string(),
                status,
                role: self.classify(name),
            });
        }
        if rows == 0 {
            return Err(OrchestratorError::InventoryUnavailable {
                reason: "header-only listing output".to_string(),
            });
        }
        Ok(hosts)
    }

    fn classify(&self, name: &str) -> Option<Role> {
        if name.contains(&self.replica_keyword) {
            Some(Role::Replica)
        } else if name.contains(&self.client_keyword) {
            Some(Role::Client)
        } else {
            None
        }
    }
}

/// Writes the replica-pairs listing consumed by the provisioning tooling:
/// one `external    internal` line per host, repeated `dup_count` times
/// (the duplication count depends on the deployment topology, so it is
/// explicit configuration).
pub fn write_replicas_file(
    hosts: &[Host],
    path: impl AsRef<Path>,
    dup_count: usize,
) -> Result<(), Report> {
    let mut content = String::new();
    for host in hosts {
        for _ in 0..dup_count {
            content.push_str(&format!("{}    {}\n", host.external_addr, host.internal_addr));
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Writes the client-address listing: one external address per line.
pub fn write_clients_file(hosts: &[Host], path: impl AsRef<Path>) -> Result<(), Report> {
    let mut content = String::new();
    for host in hosts {
        content.push_str(&host.external_addr);
        content.push('\n');
    }
    std::fs::write(path, content)?;
    Ok(())
}
