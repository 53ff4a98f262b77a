//! Local TCP tunnel to a pod port over the Kubernetes port-forward API.
//!
//! The listener is bound before [`PortForward::start`] returns, so the local
//! port is usable immediately. [`PortForward::close`] (or dropping the
//! handle) stops accepting and releases the port.

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};

pub struct PortForward {
    namespace: String,
    pod: String,
    remote_port: u16,
    local_port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PortForward {
    /// Forwards an ephemeral local port to `remote_port` of `pod`.
    pub async fn start(
        client: Client,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_port = listener.local_addr()?.port();
        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(accept_loop(
            listener,
            pods,
            pod.to_string(),
            remote_port,
            shutdown_rx,
        ));
        info!(namespace, pod, remote_port, local_port, "port-forward listening");

        Ok(Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            remote_port,
            local_port,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    /// Stops the tunnel and waits until the local port is released.
    pub async fn close(mut self) -> Result<()> {
        self.signal_stop();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| HarnessError::InternalError(format!("port-forward task: {}", e)))?;
        }
        debug!(
            namespace = %self.namespace,
            pod = %self.pod,
            remote_port = self.remote_port,
            "port-forward closed"
        );
        Ok(())
    }

    fn signal_stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    pods: Api<Pod>,
    pod: String,
    remote_port: u16,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, pod = %pod, "port-forward connection");
                    let pods = pods.clone();
                    let pod = pod.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward(pods, &pod, remote_port, stream).await {
                            warn!(pod = %pod, error = %e, "port-forward connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "port-forward accept failed"),
            },
        }
    }
}

async fn forward(pods: Api<Pod>, pod: &str, remote_port: u16, mut local: TcpStream) -> Result<()> {
    let mut forwarder = pods.portforward(pod, &[remote_port]).await?;
    let mut upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
        HarnessError::InternalError(format!("no stream for port {} of {}", remote_port, pod))
    })?;
    tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| HarnessError::InternalError(format!("port-forward to {}: {}", pod, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_kube::FakeKube;
    use std::time::Duration;

    async fn port_is_free(port: u16) -> bool {
        for _ in 0..50 {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn close_releases_local_port() {
        let client = FakeKube::new().client().await;
        let forward = PortForward::start(client, "dev", "pg-0", 5432).await.unwrap();
        let port = forward.local_port();
        assert!(port > 0);
        assert_eq!(forward.local_addr(), format!("127.0.0.1:{}", port));

        forward.close().await.unwrap();
        assert!(port_is_free(port).await);
    }

    #[tokio::test]
    async fn drop_releases_local_port() {
        let client = FakeKube::new().client().await;
        let forward = PortForward::start(client, "dev", "pg-0", 5432).await.unwrap();
        let port = forward.local_port();
        drop(forward);
        assert!(port_is_free(port).await);
    }
}
