use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::path::{Path, PathBuf};

/// A remote execution channel: either a VM reached over ssh/scp or the
/// local machine (used by the local testbed and by tests).
#[derive(Debug, Clone)]
pub enum Machine {
    Ssh {
        username: String,
        address: String,
        private_key: Option<PathBuf>,
    },
    Local,
}

impl Machine {
    pub fn ssh(
        username: impl ToString,
        address: impl ToString,
        private_key: Option<PathBuf>,
    ) -> Self {
        Self::Ssh {
            username: username.to_string(),
            address: address.to_string(),
            private_key,
        }
    }

    pub fn address(&self) -> String {
        match self {
            Self::Ssh { address, .. } => address.clone(),
            Self::Local => String::from("127.0.0.1"),
        }
    }

    /// Runs `command` and returns its trimmed output, failing on a non-zero
    /// exit status.
    pub async fn exec(&self, command: impl ToString) -> Result<String, Report> {
        let (code, output) = self.exec_status(command).await?;
        if code == 0 {
            Ok(output)
        } else {
            Err(Report::msg(format!(
                "command exited with status {}: {}",
                code, output
            )))
        }
    }

    /// Runs `command` and returns its exit code together with the combined
    /// stdout/stderr, trimmed.
    pub async fn exec_status(
        &self,
        command: impl ToString,
    ) -> Result<(i32, String), Report> {
        Self::exec_command(self.prepare_exec(command)).await
    }

    pub fn prepare_exec(&self, command: impl ToString) -> tokio::process::Command {
        match self {
            Self::Ssh {
                username,
                address,
                private_key,
            } => Self::prepare_ssh_exec(username, address, private_key.as_deref(), command),
            Self::Local => Self::create_command(command),
        }
    }

    pub async fn script_exec(
        &self,
        path: &str,
        args: Vec<String>,
    ) -> Result<String, Report> {
        let args = args.join(" ");
        // absolute paths run as-is, relative ones from the remote home dir
        let run = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("./{}", path)
        };
        let command = format!("chmod u+x {} && {} {}", path, run, args);
        self.exec(command).await.wrap_err("chmod && ./script")
    }

    pub async fn copy_to(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: impl AsRef<Path>,
    ) -> Result<(), Report> {
        match self {
            Self::Ssh {
                username,
                address,
                private_key,
            } => {
                let to = format!(
                    "{}@{}:{}",
                    username,
                    address,
                    remote_path.as_ref().display()
                );
                Self::scp(private_key.as_deref(), &local_path.as_ref().display().to_string(), &to)
                    .await
            }
            Self::Local => Self::local_copy(local_path, remote_path).await,
        }
    }

    pub async fn copy_from(
        &self,
        remote_path: impl AsRef<Path>,
        local_path: impl AsRef<Path>,
    ) -> Result<(), Report> {
        match self {
            Self::Ssh {
                username,
                address,
                private_key,
            } => {
                let from = format!(
                    "{}@{}:{}",
                    username,
                    address,
                    remote_path.as_ref().display()
                );
                Self::scp(private_key.as_deref(), &from, &local_path.as_ref().display().to_string())
                    .await
            }
            Self::Local => Self::local_copy(remote_path, local_path).await,
        }
    }

    async fn scp(private_key: Option<&Path>, from: &str, to: &str) -> Result<(), Report> {
        let scp_command = format!(
            "scp -r -o StrictHostKeyChecking=no {} {} {}",
            Self::key_arg(private_key),
            from,
            to,
        );
        tracing::debug!("{}", scp_command);
        let status = Self::create_command(scp_command)
            .status()
            .await
            .wrap_err("scp")?;
        if status.success() {
            Ok(())
        } else {
            Err(Report::msg(format!("scp {} -> {} failed", from, to)))
        }
    }

    async fn local_copy(
        from: impl AsRef<Path>,
        to: impl AsRef<Path>,
    ) -> Result<(), Report> {
        let cp_command = format!(
            "cp -r {} {}",
            from.as_ref().display(),
            to.as_ref().display()
        );
        let status = Self::create_command(cp_command)
            .status()
            .await
            .wrap_err("cp")?;
        if status.success() {
            Ok(())
        } else {
            Err(Report::msg(format!(
                "cp {} -> {} failed",
                from.as_ref().display(),
                to.as_ref().display()
            )))
        }
    }

    fn prepare_ssh_exec(
        username: &str,
        address: &str,
        private_key: Option<&Path>,
        command: impl ToString,
    ) -> tokio::process::Command {
        let ssh_command = format!(
            "ssh -o StrictHostKeyChecking=no {} {}@{} {}",
            Self::key_arg(private_key),
            username,
            address,
            Self::escape(command)
        );
        Self::create_command(ssh_command)
    }

    fn key_arg(private_key: Option<&Path>) -> String {
        match private_key {
            Some(key) => format!("-i {}", key.display()),
            None => String::new(),
        }
    }

    fn create_command(command_arg: impl ToString) -> tokio::process::Command {
        let command_arg = command_arg.to_string();
        tracing::debug!("{}", command_arg);
        let mut command = tokio::process::Command::new("bash");
        command.arg("-c");
        command.arg(command_arg);
        command
    }

    async fn exec_command(
        mut command: tokio::process::Command,
    ) -> Result<(i32, String), Report> {
        let out = command.output().await.wrap_err("spawn command")?;
        // ssh reports connection-level failures with exit code 255
        let code = out.status.code().unwrap_or(-1);
        let mut output = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&out.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(stderr);
        }
        Ok((code, output))
    }

    /// Double-quotes `command` for the remote shell, escaping the
    /// characters the local shell would otherwise expand. Keeps the
    /// single-quoting done by `RemoteCommand::render` intact.
    fn escape(command: impl ToString) -> String {
        let escaped = command
            .to_string()
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('`', "\\`");
        format!("\"{}\"", escaped)
    }
}
