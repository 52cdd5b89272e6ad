use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{ConsumerHook, Connector, FutureTable, InvokeFuture, LoadBalancer};
use crate::{
    Error, ErrorKind, Result, SerializerType,
    meta::ServiceMeta,
    protocol::{Request, RequestMeta},
    transport::{Channel, CopyOnWriteGroupList},
};

#[derive(
    clap::ValueEnum, Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash,
)]
pub enum DispatchType {
    /// One provider per call, chosen by the load balancer.
    #[default]
    Round,
    /// Every available provider.
    Broadcast,
}

/// What every dispatch of one service proxy shares.
#[derive(Clone)]
pub struct DispatchOptions {
    pub app_name: String,
    pub service: ServiceMeta,
    pub serializer: SerializerType,
    pub timeout: Duration,
    pub method_timeouts: HashMap<String, Duration>,
    pub hooks: Vec<Arc<dyn ConsumerHook>>,
}

impl DispatchOptions {
    #[must_use]
    pub fn new(app_name: impl Into<String>, service: ServiceMeta) -> Self {
        Self {
            app_name: app_name.into(),
            service,
            serializer: SerializerType::default(),
            timeout: Duration::from_secs(3),
            method_timeouts: HashMap::new(),
            hooks: Vec::new(),
        }
    }

    /// Per-method override, else the proxy-wide timeout.
    #[must_use]
    pub fn timeout_of(&self, method: &str) -> Duration {
        self.method_timeouts
            .get(method)
            .copied()
            .unwrap_or(self.timeout)
    }

    fn request(&self, invoke_id: u64, method: &str, args: Bytes) -> Request {
        Request {
            invoke_id,
            serializer: self.serializer,
            meta: RequestMeta {
                app_name: self.app_name.clone(),
                service: self.service.clone(),
                method: method.to_string(),
                trace_id: None,
            },
            args,
            timestamp: std::time::Instant::now(),
        }
    }
}

impl std::fmt::Debug for DispatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("service", &self.service)
            .field("serializer", &self.serializer)
            .field("timeout", &self.timeout)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Turns a method call into an outstanding request. `args` are already serialized with the
/// dispatcher's serializer.
pub trait Dispatcher: Send + Sync {
    fn dispatch<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>>;

    fn options(&self) -> &DispatchOptions;
}

/// Writes an encoded request and settles the future's send state.
async fn write_request(
    futures: &FutureTable,
    future: &InvokeFuture,
    request: &Request,
    channel: &Channel,
    bytes: Bytes,
    hooks: &[Arc<dyn ConsumerHook>],
) {
    match channel.write(bytes).await {
        Ok(()) => {
            future.mark_sent();
            for hook in hooks {
                hook.before(request, channel);
            }
        }
        Err(e) => {
            tracing::error!(
                "write request {} to {} failed: {e}",
                request.invoke_id,
                channel.remote()
            );
            futures.failed(future, &e);
        }
    }
}

/// Unicast dispatch through the load balancer.
pub struct RoundDispatcher {
    options: DispatchOptions,
    load_balancer: Arc<dyn LoadBalancer>,
    groups: Arc<CopyOnWriteGroupList>,
    connector: Arc<Connector>,
    futures: Arc<FutureTable>,
}

impl RoundDispatcher {
    #[must_use]
    pub fn new(
        options: DispatchOptions,
        load_balancer: Arc<dyn LoadBalancer>,
        connector: Arc<Connector>,
        futures: Arc<FutureTable>,
    ) -> Self {
        Self {
            groups: connector.directory(&options.service),
            options,
            load_balancer,
            connector,
            futures,
        }
    }

    /// Picks a live channel for the next call.
    ///
    /// # Errors
    ///
    /// Returns `NoConnections` if the directory stays empty for the connect wait, `NoChannel`
    /// if none of its groups has a live connection.
    pub async fn select(&self) -> Result<Arc<Channel>> {
        let directory = &self.options.service;
        let snapshot = self.groups.snapshot();
        match self.load_balancer.select(&snapshot, directory) {
            Some(group) => {
                if group.is_available() {
                    return group.next().await;
                }
                if group.is_expired() && self.connector.remove_channel_group(directory, &group) {
                    tracing::warn!(
                        "evict {} from {directory}: no connection for too long",
                        group.address()
                    );
                }
            }
            None => {
                let wait = self.connector.config().invoke.await_connections;
                if !self.connector.wait_for_available(directory, wait).await {
                    return Err(Error::new(
                        ErrorKind::NoConnections,
                        format!("no connections to {directory} after {wait:?}"),
                    ));
                }
            }
        }

        for group in self.groups.snapshot().iter() {
            if group.is_available() {
                return group.next().await;
            }
        }
        Err(Error::new(
            ErrorKind::NoChannel,
            format!("no available channel for {directory}"),
        ))
    }

    async fn dispatch_inner(&self, method: &str, args: Bytes) -> Result<InvokeFuture> {
        // 1. select a channel.
        let channel = self.select().await?;

        // 2. build the request.
        let request = self
            .options
            .request(self.futures.next_invoke_id(), method, args);
        let bytes = request.encode()?;

        // 3. register before writing: the response may arrive before the write returns.
        let future = InvokeFuture::new(
            request.invoke_id,
            channel.clone(),
            false,
            self.options.serializer,
            self.options.timeout_of(method),
            self.options.hooks.clone(),
        );
        self.futures.register(&future);

        // 4. write.
        write_request(
            &self.futures,
            &future,
            &request,
            &channel,
            bytes,
            &self.options.hooks,
        )
        .await;
        Ok(future)
    }
}

impl Dispatcher for RoundDispatcher {
    fn dispatch<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>> {
        Box::pin(self.dispatch_inner(method, args))
    }

    fn options(&self) -> &DispatchOptions {
        &self.options
    }
}

/// Sends one request to every provider that currently has a live connection.
pub struct BroadcastDispatcher {
    options: DispatchOptions,
    groups: Arc<CopyOnWriteGroupList>,
    futures: Arc<FutureTable>,
}

impl BroadcastDispatcher {
    #[must_use]
    pub fn new(options: DispatchOptions, connector: &Connector, futures: Arc<FutureTable>) -> Self {
        Self {
            groups: connector.directory(&options.service),
            options,
            futures,
        }
    }

    #[must_use]
    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// One future per available provider, all sharing one invoke id.
    ///
    /// # Errors
    ///
    /// Returns `NoChannel` if no provider is available.
    pub async fn dispatch_all(&self, method: &str, args: Bytes) -> Result<Vec<InvokeFuture>> {
        let mut channels = Vec::new();
        for group in self.groups.snapshot().iter() {
            if group.is_available() {
                channels.push(group.next().await?);
            }
        }
        if channels.is_empty() {
            return Err(Error::new(
                ErrorKind::NoChannel,
                format!("no available channel for {}", self.options.service),
            ));
        }

        let request = self
            .options
            .request(self.futures.next_invoke_id(), method, args);
        let bytes = request.encode()?;
        let timeout = self.options.timeout_of(method);

        let mut futures = Vec::with_capacity(channels.len());
        for channel in channels {
            let future = InvokeFuture::new(
                request.invoke_id,
                channel.clone(),
                true,
                self.options.serializer,
                timeout,
                self.options.hooks.clone(),
            );
            self.futures.register(&future);
            write_request(
                &self.futures,
                &future,
                &request,
                &channel,
                bytes.clone(),
                &self.options.hooks,
            )
            .await;
            futures.push(future);
        }
        Ok(futures)
    }
}
