use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::{Error, ErrorKind, Result, TaskSupervisor};

/// TCP accept loop shared by the provider server and the registry node.
pub struct Listener {
    task_supervisor: TaskSupervisor,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Listener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// Binds `addr` and hands every accepted stream to `on_accept`.
    ///
    /// # Errors
    ///
    /// Returns `TcpBindFailed` if the address cannot be bound.
    pub async fn start_listen<F>(&self, addr: SocketAddr, on_accept: F) -> Result<SocketAddr>
    where
        F: Fn(TcpStream, SocketAddr) + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        self.task_supervisor.spawn("accept loop", async move {
            tracing::info!("start listening: {listener_addr}");
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => on_accept(stream, peer),
                    Err(e) => {
                        tracing::error!("accept on {listener_addr} failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(listener_addr)
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}
