use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use super::{
    DefaultProviderProcessor, ProviderContainer, ProviderProcessor, ServiceWrapper,
    processor::ProviderHandler,
};
use crate::{
    Error, ErrorKind, Result, TaskSupervisor,
    config::Config,
    meta::{Address, RegisterMeta, ServiceMeta},
    registry::RegistryService,
    transport::{FrameHandler, IdlePolicy, Listener, start_channel},
};

/// Serves the services of a [`ProviderContainer`] and publishes them to the registry.
///
/// ```rust,no_run
/// # use flarepc::{Config, ServiceMeta, provider::{ProviderServer, ServiceWrapper}};
/// # #[tokio::main]
/// # async fn main() -> flarepc::Result<()> {
/// let server = ProviderServer::new(&Config::default());
/// server.add_service(
///     ServiceWrapper::new(ServiceMeta::new("demo", "echo", "1.0.0"))
///         .method("echo", |_ctx, (text,): (String,)| async move { Ok(text) }),
/// );
/// server.connect_to_registry_server("127.0.0.1:20001")?;
/// server.start("0.0.0.0:18090".parse().unwrap()).await?;
/// server.publish_all()?;
/// server.join().await;
/// # Ok(())
/// # }
/// ```
pub struct ProviderServer {
    config: Config,
    container: Arc<ProviderContainer>,
    handler: Arc<ProviderHandler>,
    registry: Arc<RegistryService>,
    listener: Listener,
    supervisor: Arc<TaskSupervisor>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProviderServer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let container = Arc::new(ProviderContainer::default());
        let processor = Arc::new(DefaultProviderProcessor::new(
            container.clone(),
            config.provider.max_in_flight,
        ));
        Self::with_processor(config, container, processor)
    }

    #[must_use]
    pub fn with_processor(
        config: &Config,
        container: Arc<ProviderContainer>,
        processor: Arc<dyn ProviderProcessor>,
    ) -> Self {
        Self {
            config: config.clone(),
            container,
            handler: Arc::new(ProviderHandler(processor)),
            registry: RegistryService::new(config),
            listener: Listener::new(),
            supervisor: Arc::new(TaskSupervisor::create()),
            local_addr: Mutex::default(),
        }
    }

    #[must_use]
    pub fn container(&self) -> &Arc<ProviderContainer> {
        &self.container
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    pub fn add_service(&self, wrapper: ServiceWrapper) -> Arc<ServiceWrapper> {
        self.container.register(wrapper)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if an entry is not `host:port`.
    pub fn connect_to_registry_server(&self, addresses: &str) -> Result<()> {
        self.registry.connect_to_registry_server(addresses)
    }

    /// Binds `addr` and starts serving.
    ///
    /// # Errors
    ///
    /// Returns `TcpBindFailed` if the address cannot be bound.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let handler: Arc<dyn FrameHandler> = self.handler.clone();
        let supervisor = self.supervisor.clone();
        let transport = self.config.transport.clone();
        let addr = self
            .listener
            .start_listen(addr, move |stream, peer| {
                let idle = IdlePolicy::acceptor(&transport);
                match start_channel(stream, handler.clone(), &supervisor, &transport, idle) {
                    Ok(channel) => tracing::debug!("accepted {peer} as channel {}", channel.id()),
                    Err(e) => tracing::error!("accept {peer} failed: {e}"),
                }
            })
            .await?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!("provider listening on {addr}");
        Ok(addr)
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn register_meta(&self, wrapper: &ServiceWrapper) -> Result<RegisterMeta> {
        let Some(addr) = self.local_addr() else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("publish {} before the server is started", wrapper.meta()),
            ));
        };
        let address = Address::new(self.config.provider.advertise_host.clone(), addr.port());
        Ok(RegisterMeta::new(address, wrapper.meta().clone())
            .with_weight(wrapper.weight())
            .with_conn_count(1))
    }

    fn wrapper(&self, service: &ServiceMeta) -> Result<Arc<ServiceWrapper>> {
        self.container.lookup(service).ok_or_else(|| {
            Error::new(
                ErrorKind::ServiceNotFound,
                format!("service not found: {service}"),
            )
        })
    }

    /// Registers `service` with the registry.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` for an unknown service, `InvalidArgument` before `start`.
    pub fn publish(&self, service: &ServiceMeta) -> Result<()> {
        let meta = self.register_meta(&*self.wrapper(service)?)?;
        self.registry.register(meta);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` before `start`.
    pub fn publish_all(&self) -> Result<()> {
        for wrapper in self.container.services() {
            self.registry.register(self.register_meta(&wrapper)?);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ServiceNotFound` for an unknown service, `InvalidArgument` before `start`.
    pub fn unpublish(&self, service: &ServiceMeta) -> Result<()> {
        let meta = self.register_meta(&*self.wrapper(service)?)?;
        self.registry.unregister(&meta);
        Ok(())
    }

    pub fn unpublish_all(&self) {
        for meta in self.registry.registered_metas() {
            self.registry.unregister(&meta);
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("shutting down provider {}", self.config.app_name);
        self.unpublish_all();
        self.registry.shutdown_gracefully();
        self.listener.stop();
        self.supervisor.stop();
    }

    pub async fn join(&self) {
        self.listener.join().await;
        self.supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for ProviderServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderServer")
            .field("app_name", &self.config.app_name)
            .field("local_addr", &self.local_addr())
            .field("services", &self.container.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisterState;

    fn echo() -> ServiceWrapper {
        ServiceWrapper::new(ServiceMeta::new("g", "echo", "1.0"))
            .with_weight(70)
            .method("echo", |_ctx, (text,): (String,)| async move { Ok(text) })
    }

    #[tokio::test]
    async fn test_publish_requires_start() {
        let server = ProviderServer::new(&Config::default());
        server.add_service(echo());
        let error = server.publish_all().unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidArgument);

        let error = server
            .publish(&ServiceMeta::new("g", "nope", "1.0"))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::ServiceNotFound);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_published_meta_carries_port_and_weight() {
        let server = ProviderServer::new(&Config::default());
        server.add_service(echo());
        let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        server.publish_all().unwrap();

        let metas = server.registry().registered_metas();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].address.port, addr.port());
        assert_eq!(metas[0].address.host, "");
        assert_eq!(metas[0].weight, 70);
        assert_eq!(metas[0].conn_count, 1);
        assert!(matches!(
            server.registry().register_state(&metas[0]),
            Some(RegisterState::Queued | RegisterState::Prepare)
        ));

        server.unpublish(&ServiceMeta::new("g", "echo", "1.0")).unwrap();
        assert!(server.registry().registered_metas().is_empty());
        server.shutdown();
        server.join().await;
    }
}
