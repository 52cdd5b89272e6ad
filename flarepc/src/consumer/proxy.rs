use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use super::{
    BroadcastDispatcher, Client, ClusterStrategyBridging, ClusterStrategyConfig,
    ConnectionWatcher, ConsumerHook, DispatchOptions, DispatchType, Dispatcher, InvokeFuture,
    LoadBalancerType, MethodSpecialConfig, RoundDispatcher, Strategy,
};
use crate::{
    Error, ErrorKind, Result, SerializerType,
    meta::{Address, NotifyEvent, RegisterMeta, ServiceMeta},
    registry::NotifyListener,
};

/// Builds a [`ServiceProxy`].
///
/// ```rust,no_run
/// # use flarepc::{Config, ServiceMeta, consumer::{Client, Strategy}};
/// # #[tokio::main]
/// # async fn main() -> flarepc::Result<()> {
/// let client = Client::new(&Config::default());
/// client.connect_to_registry_server("127.0.0.1:20001")?;
/// let proxy = client
///     .proxy(ServiceMeta::new("demo", "echo", "1.0.0"))
///     .strategy(Strategy::FailOver)
///     .timeout(std::time::Duration::from_millis(500))
///     .build();
/// let reply: String = proxy.invoke("echo", &("hello",)).await?;
/// # Ok(())
/// # }
/// ```
pub struct ProxyBuilder<'a> {
    client: &'a Client,
    options: DispatchOptions,
    load_balancer: LoadBalancerType,
    strategy: ClusterStrategyConfig,
    methods: Vec<MethodSpecialConfig>,
    dispatch_type: DispatchType,
    addresses: Vec<Address>,
}

impl<'a> ProxyBuilder<'a> {
    pub(crate) fn new(client: &'a Client, service: ServiceMeta) -> Self {
        let config = client.config();
        let mut options = DispatchOptions::new(config.app_name.clone(), service);
        options.timeout = config.invoke.default_timeout;
        Self {
            client,
            options,
            load_balancer: LoadBalancerType::default(),
            strategy: ClusterStrategyConfig::default(),
            methods: Vec::new(),
            dispatch_type: DispatchType::default(),
            addresses: Vec::new(),
        }
    }

    #[must_use]
    pub fn load_balancer(mut self, load_balancer: LoadBalancerType) -> Self {
        self.load_balancer = load_balancer;
        self
    }

    #[must_use]
    pub fn serializer(mut self, serializer: SerializerType) -> Self {
        self.options.serializer = serializer;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    #[must_use]
    pub fn method_config(mut self, config: MethodSpecialConfig) -> Self {
        self.methods.push(config);
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy.strategy = strategy;
        self
    }

    #[must_use]
    pub fn strategy_config(mut self, strategy: ClusterStrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn ConsumerHook>) -> Self {
        self.options.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn dispatch_type(mut self, dispatch_type: DispatchType) -> Self {
        self.dispatch_type = dispatch_type;
        self
    }

    /// Connects straight to `address` instead of discovering providers through the registry.
    #[must_use]
    pub fn direct(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    #[must_use]
    pub fn build(mut self) -> ServiceProxy {
        for method in &self.methods {
            if let Some(timeout) = method.timeout {
                self.options
                    .method_timeouts
                    .insert(method.method.clone(), timeout);
            }
        }

        let service = self.options.service.clone();
        let serializer = self.options.serializer;
        if self.addresses.is_empty() {
            self.client.watch_connections(&service);
        } else {
            let watcher = ConnectionWatcher::new(
                service.clone(),
                self.client.connector().clone(),
                self.client.registry().clone(),
            );
            for address in self.addresses {
                watcher.notify(
                    &RegisterMeta::new(address, service.clone()),
                    NotifyEvent::ChildAdded,
                );
            }
        }

        let connector = self.client.connector();
        let futures = self.client.futures().clone();
        let target = match self.dispatch_type {
            DispatchType::Round => {
                let dispatcher: Arc<dyn Dispatcher> = Arc::new(RoundDispatcher::new(
                    self.options,
                    self.load_balancer.create(),
                    connector.clone(),
                    futures,
                ));
                Target::Round(ClusterStrategyBridging::new(
                    &dispatcher,
                    self.strategy,
                    &self.methods,
                ))
            }
            DispatchType::Broadcast => {
                Target::Broadcast(BroadcastDispatcher::new(self.options, connector, futures))
            }
        };
        ServiceProxy {
            service,
            serializer,
            target,
        }
    }
}

enum Target {
    Round(ClusterStrategyBridging),
    Broadcast(BroadcastDispatcher),
}

/// Generic call entry point for one remote service.
pub struct ServiceProxy {
    service: ServiceMeta,
    serializer: SerializerType,
    target: Target,
}

impl ServiceProxy {
    #[must_use]
    pub fn service(&self) -> &ServiceMeta {
        &self.service
    }

    #[must_use]
    pub fn dispatch_type(&self) -> DispatchType {
        match self.target {
            Target::Round(_) => DispatchType::Round,
            Target::Broadcast(_) => DispatchType::Broadcast,
        }
    }

    /// Calls `method` and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns the call's error; `InvalidArgument` on a broadcast proxy.
    pub async fn invoke<Rsp, Args>(&self, method: &str, args: &Args) -> Result<Rsp>
    where
        Rsp: DeserializeOwned,
        Args: Serialize + ?Sized,
    {
        self.invoke_async(method, args).await?.get().await
    }

    /// Sends a call to `method` without waiting for its result.
    ///
    /// # Errors
    ///
    /// Returns a dispatch error; `InvalidArgument` on a broadcast proxy.
    pub async fn invoke_async<Args>(&self, method: &str, args: &Args) -> Result<InvokeFuture>
    where
        Args: Serialize + ?Sized,
    {
        let Target::Round(bridging) = &self.target else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{} is a broadcast proxy, use broadcast()", self.service),
            ));
        };
        let args = self.serializer.serialize(args)?;
        bridging.invoker(method).invoke(method, args).await
    }

    /// Sends a call to every available provider.
    ///
    /// # Errors
    ///
    /// Returns `NoChannel` if no provider is available; `InvalidArgument` on a round proxy.
    pub async fn broadcast<Args>(&self, method: &str, args: &Args) -> Result<Vec<InvokeFuture>>
    where
        Args: Serialize + ?Sized,
    {
        let Target::Broadcast(dispatcher) = &self.target else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{} is not a broadcast proxy", self.service),
            ));
        };
        let args = self.serializer.serialize(args)?;
        dispatcher.dispatch_all(method, args).await
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service)
            .field("dispatch_type", &self.dispatch_type())
            .finish()
    }
}
