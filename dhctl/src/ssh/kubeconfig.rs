use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use dhctl_core::kubernetes::{
    operations::{create_forwarded_client, KubeClusterApi},
    KubeApi,
};
use log::{debug, info};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;

use crate::retry::RetryLoop;

use super::{system::ssh_command, KubeConnector, SshClient, SshError, SshSettings};

/// Where kube-apiserver listens on every master.
const API_SERVER_ON_MASTER: &str = "127.0.0.1:6443";
const TUNNEL_READY_ATTEMPTS: u32 = 20;
const TUNNEL_READY_WAIT: Duration = Duration::from_secs(1);

/// Reaches the API server of the master the ssh session is pinned to
/// through an `ssh -L` port forward, with credentials from the kubeconfig.
pub struct KubeconfigConnector {
    kube_config: Option<String>,
    kube_context: Option<String>,
    cancellation: CancellationToken,
    tunnel: Mutex<Option<Child>>,
}

impl KubeconfigConnector {
    pub fn new(
        kube_config: Option<String>,
        kube_context: Option<String>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            kube_config,
            kube_context,
            cancellation,
            tunnel: Mutex::new(None),
        }
    }

    async fn open_client(&self, local_port: u16) -> Result<Arc<dyn KubeApi>, SshError> {
        wait_for_tunnel(local_port, &self.cancellation).await?;

        let client = create_forwarded_client(&self.kube_config, &self.kube_context, local_port)
            .await
            .map_err(|error| SshError::KubeConnect(format!("{error:#}")))?;

        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

#[async_trait]
impl KubeConnector for KubeconfigConnector {
    async fn connect(&self, ssh: Arc<dyn SshClient>) -> Result<Arc<dyn KubeApi>, SshError> {
        let host = ssh
            .current_host()
            .ok_or_else(|| SshError::KubeConnect("the ssh session isn't started".to_owned()))?;
        let local_port = free_local_port().await?;

        debug!("Forwarding 127.0.0.1:{local_port} to {API_SERVER_ON_MASTER} on '{host}'");
        let mut child = tunnel_command(&ssh.settings(), &host, local_port)
            .spawn()
            .map_err(|source| SshError::Spawn {
                command: "ssh".to_owned(),
                source,
            })?;

        let client = match self.open_client(local_port).await {
            Ok(client) => client,
            Err(error) => {
                kill_tunnel(&mut child).await;
                return Err(error);
            }
        };

        let previous = self.tunnel.lock().replace(child);
        if let Some(mut previous) = previous {
            kill_tunnel(&mut previous).await;
        }

        info!("Kubernetes API is reachable through '{host}'");

        Ok(client)
    }

    async fn stop(&self) {
        let tunnel = self.tunnel.lock().take();
        if let Some(mut tunnel) = tunnel {
            kill_tunnel(&mut tunnel).await;
            debug!("Kubernetes API tunnel closed");
        }
    }
}

fn tunnel_command(settings: &SshSettings, host: &str, local_port: u16) -> Command {
    let mut command = ssh_command(settings);

    command
        .args(["-N", "-o", "ExitOnForwardFailure=yes"])
        .args(["-o", "ServerAliveInterval=10"])
        .arg("-L")
        .arg(format!("{local_port}:{API_SERVER_ON_MASTER}"))
        .arg(format!("{}@{host}", settings.user))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    command
}

async fn free_local_port() -> Result<u16, SshError> {
    let bind = |source| SshError::Spawn {
        command: "bind 127.0.0.1".to_owned(),
        source,
    };
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(bind)?;

    Ok(listener.local_addr().map_err(bind)?.port())
}

async fn wait_for_tunnel(local_port: u16, cancellation: &CancellationToken) -> Result<(), SshError> {
    RetryLoop::silent("Waiting for the API server tunnel", TUNNEL_READY_ATTEMPTS, TUNNEL_READY_WAIT)
        .break_if(|error| matches!(error, SshError::Interrupted))
        .with_cancellation(cancellation)
        .run(|| async {
            TcpStream::connect(("127.0.0.1", local_port))
                .await
                .map(|_| ())
                .map_err(|error| {
                    SshError::KubeConnect(format!("tunnel on port {local_port} isn't up: {error}"))
                })
        })
        .await
}

async fn kill_tunnel(child: &mut Child) {
    if let Err(error) = child.kill().await {
        debug!("Couldn't stop the ssh tunnel: {error}");
    }
}

#[cfg(test)]
mod tests {
    use crate::{ssh::system::command_arguments, testing::TestEnvironment};

    use super::*;

    #[test]
    fn tunnel_forwards_a_local_port_to_the_master_api_server() {
        let settings = SshSettings {
            user: "dhctl-converge-0a1b2c3d".into(),
            bastion_host: Some("bastion.example.com".into()),
            private_keys: vec!["/tmp/user.key".into()],
            ..Default::default()
        };

        let args = command_arguments(&tunnel_command(&settings, "203.0.113.10", 40123));

        assert!(args.contains(&"-N".to_owned()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_owned()));
        assert!(args.contains(&"40123:127.0.0.1:6443".to_owned()));
        assert!(args.contains(&"dhctl-converge-0a1b2c3d@bastion.example.com:22".to_owned()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("dhctl-converge-0a1b2c3d@203.0.113.10")
        );
    }

    #[tokio::test]
    async fn connecting_needs_a_started_session() {
        let env = TestEnvironment::new();
        let connector = KubeconfigConnector::new(None, None, CancellationToken::new());
        let session = env.ssh.session(SshSettings::default());

        let error = connector.connect(session).await.err().unwrap();

        assert!(matches!(error, SshError::KubeConnect(_)));
        connector.stop().await;
        assert!(connector.tunnel.lock().is_none());
    }
}
