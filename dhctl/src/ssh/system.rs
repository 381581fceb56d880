use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::RwLock;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{SshClient, SshClientFactory, SshError, SshSettings, DEFAULT_SSH_PORT};

const CONNECT_TIMEOUT_SECONDS: u32 = 10;

/// Ssh session driven through the system `ssh` and `ssh-add` binaries.
pub struct SystemSshClient {
    settings: RwLock<SshSettings>,
    current_host: RwLock<Option<String>>,
    cancellation: CancellationToken,
}

impl SystemSshClient {
    pub fn new(settings: SshSettings, cancellation: CancellationToken) -> Self {
        Self {
            settings: RwLock::new(settings),
            current_host: RwLock::new(None),
            cancellation,
        }
    }

    fn check_command(&self, host: &str) -> Command {
        let settings = self.settings.read().clone();
        let mut command = ssh_command(&settings);

        command
            .arg(format!("{}@{host}", settings.user))
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }

    async fn run(&self, mut command: Command, name: &str) -> Result<std::process::Output, SshError> {
        tokio::select! {
            _ = self.cancellation.cancelled() => Err(SshError::Interrupted),
            output = command.output() => output.map_err(|source| SshError::Spawn {
                command: name.to_owned(),
                source,
            }),
        }
    }
}

#[async_trait]
impl SshClient for SystemSshClient {
    fn settings(&self) -> SshSettings {
        self.settings.read().clone()
    }

    fn current_host(&self) -> Option<String> {
        self.current_host.read().clone()
    }

    fn add_host(&self, host: &str) {
        let mut settings = self.settings.write();
        if !settings.hosts.iter().any(|known| known == host) {
            settings.hosts.push(host.to_owned());
        }
    }

    async fn start(&self) -> Result<(), SshError> {
        let hosts = self.settings.read().hosts.clone();

        for host in &hosts {
            match self.check_host(host).await {
                Ok(()) => {
                    info!("Ssh session pinned to '{host}'");
                    *self.current_host.write() = Some(host.clone());
                    return Ok(());
                }
                Err(SshError::Interrupted) => return Err(SshError::Interrupted),
                Err(error) => debug!("{error}"),
            }
        }

        Err(SshError::NoReachableHost(hosts))
    }

    async fn stop(&self) {
        if let Some(host) = self.current_host.write().take() {
            debug!("Ssh session to '{host}' stopped");
        }
    }

    async fn check_host(&self, host: &str) -> Result<(), SshError> {
        let output = self.run(self.check_command(host), "ssh").await?;

        if output.status.success() {
            return Ok(());
        }

        Err(SshError::Unreachable {
            host: host.to_owned(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    async fn add_key_to_agent(&self, key_path: &Path) -> Result<(), SshError> {
        let mut command = Command::new("ssh-add");
        command
            .arg(key_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = self.run(command, "ssh-add").await?;

        if !output.status.success() {
            return Err(SshError::Agent(
                key_path.to_owned(),
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }

        Ok(())
    }
}

/// `ssh` with the session's port, keys and bastion, but no destination yet.
pub(super) fn ssh_command(settings: &SshSettings) -> Command {
    let mut command = Command::new("ssh");

    command
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-o")
        .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECONDS}"))
        .arg("-p")
        .arg(settings.port.to_string());

    for key in &settings.private_keys {
        command.arg("-i").arg(key);
    }

    if let Some(bastion) = &settings.bastion_host {
        let user = settings.bastion_user.as_deref().unwrap_or(&settings.user);
        let port = settings.bastion_port.unwrap_or(DEFAULT_SSH_PORT);
        command.arg("-J").arg(format!("{user}@{bastion}:{port}"));
    }

    command
}

pub struct SystemSshClientFactory {
    cancellation: CancellationToken,
}

impl SystemSshClientFactory {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }
}

impl SshClientFactory for SystemSshClientFactory {
    fn create(&self, settings: SshSettings) -> Arc<dyn SshClient> {
        Arc::new(SystemSshClient::new(settings, self.cancellation.clone()))
    }
}

/// Arguments `command` would be spawned with.
#[cfg(test)]
pub(super) fn command_arguments(command: &Command) -> Vec<String> {
    command
        .as_std()
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}
