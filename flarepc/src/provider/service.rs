use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    Error, ErrorKind, Result,
    meta::{DEFAULT_WEIGHT, MAX_WEIGHT, ServiceMeta},
    protocol::{Request, RequestMeta},
    transport::Channel,
};

/// Per-call information handed to a provider method.
#[derive(Clone, Debug)]
pub struct InvokeContext {
    pub invoke_id: u64,
    pub meta: RequestMeta,
    pub channel: Arc<Channel>,
}

impl InvokeContext {
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.meta.app_name
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.meta.method
    }

    #[must_use]
    pub fn remote(&self) -> std::net::SocketAddr {
        self.channel.remote()
    }
}

pub type Method = Box<dyn Fn(InvokeContext, Request) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// One published service: its directory key, its weight and its method table.
///
/// ```rust
/// # use flarepc::{ServiceMeta, provider::ServiceWrapper};
/// let echo = ServiceWrapper::new(ServiceMeta::new("demo", "echo", "1.0.0"))
///     .with_weight(80)
///     .method("echo", |_ctx, (text,): (String,)| async move { Ok(text) })
///     .method("len", |_ctx, (text,): (String,)| async move { Ok(text.len()) });
/// assert_eq!(echo.method_names().count(), 2);
/// ```
pub struct ServiceWrapper {
    meta: ServiceMeta,
    weight: u32,
    methods: HashMap<String, Method, RandomState>,
}

impl ServiceWrapper {
    #[must_use]
    pub fn new(meta: ServiceMeta) -> Self {
        Self {
            meta,
            weight: DEFAULT_WEIGHT,
            methods: HashMap::default(),
        }
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.min(MAX_WEIGHT);
        self
    }

    /// Adds a typed method. Arguments are decoded with the serializer of the incoming request,
    /// and the result is encoded with the same one.
    #[must_use]
    pub fn method<Req, Rsp, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(InvokeContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let method: Method = Box::new(move |ctx, request| {
            let serializer = request.serializer;
            let args = match request.args::<Req>() {
                Ok(args) => args,
                Err(e) => {
                    let error = Error::new(
                        ErrorKind::BadRequest,
                        format!("invalid arguments for {}: {}", ctx.method(), e.msg),
                    );
                    return Box::pin(async move { Err(error) });
                }
            };
            let fut = f(ctx, args);
            Box::pin(async move {
                let rsp = fut.await?;
                serializer.serialize(&rsp)
            })
        });
        self.methods.insert(name.into(), method);
        self
    }

    #[must_use]
    pub fn meta(&self) -> &ServiceMeta {
        &self.meta
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    /// Starts the call named by the request.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnexpectedError` if the method does not exist.
    pub fn call(&self, ctx: InvokeContext, request: Request) -> Result<BoxFuture<'static, Result<Bytes>>> {
        match self.methods.get(&request.meta.method) {
            Some(method) => Ok(method(ctx, request)),
            None => Err(Error::new(
                ErrorKind::ServiceUnexpectedError,
                format!("method not found: {}.{}", self.meta, request.meta.method),
            )),
        }
    }
}

impl std::fmt::Debug for ServiceWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWrapper")
            .field("meta", &self.meta)
            .field("weight", &self.weight)
            .field("methods", &self.methods.keys())
            .finish()
    }
}

/// Service wrappers keyed by directory.
#[derive(Default, Debug)]
pub struct ProviderContainer {
    services: DashMap<String, Arc<ServiceWrapper>, RandomState>,
}

impl ProviderContainer {
    /// Adds `wrapper`, replacing any service with the same directory.
    pub fn register(&self, wrapper: ServiceWrapper) -> Arc<ServiceWrapper> {
        let wrapper = Arc::new(wrapper);
        if self
            .services
            .insert(wrapper.meta().directory(), wrapper.clone())
            .is_some()
        {
            tracing::warn!("service {} replaced", wrapper.meta());
        }
        wrapper
    }

    pub fn remove(&self, service: &ServiceMeta) -> Option<Arc<ServiceWrapper>> {
        self.services.remove(&service.directory()).map(|(_, v)| v)
    }

    #[must_use]
    pub fn lookup(&self, service: &ServiceMeta) -> Option<Arc<ServiceWrapper>> {
        self.services.get(&service.directory()).map(|v| v.clone())
    }

    #[must_use]
    pub fn services(&self) -> Vec<Arc<ServiceWrapper>> {
        self.services.iter().map(|v| v.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SerializerType, transport::detached_channel};

    fn call(wrapper: &ServiceWrapper, method: &str, args: &impl Serialize) -> Result<BoxFuture<'static, Result<Bytes>>> {
        let meta = RequestMeta {
            app_name: "test".into(),
            service: wrapper.meta().clone(),
            method: method.into(),
            trace_id: None,
        };
        let request = Request::new(1, SerializerType::Json, meta.clone(), args)?;
        let ctx = InvokeContext {
            invoke_id: 1,
            meta,
            channel: detached_channel(4).0,
        };
        wrapper.call(ctx, request)
    }

    fn adder() -> ServiceWrapper {
        ServiceWrapper::new(ServiceMeta::new("g", "math", "1.0"))
            .method("add", |_ctx, (a, b): (i64, i64)| async move { Ok(a + b) })
            .method("fail", |_ctx, (): ()| async move {
                Err::<(), _>(Error::new(ErrorKind::Unknown("Overdrawn".into()), "no".into()))
            })
    }

    #[tokio::test]
    async fn test_typed_method() {
        let wrapper = adder();
        let payload = call(&wrapper, "add", &(2, 3)).unwrap().await.unwrap();
        assert_eq!(SerializerType::Json.deserialize::<i64>(&payload).unwrap(), 5);

        let error = call(&wrapper, "fail", &()).unwrap().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Unknown("Overdrawn".into()));
    }

    #[tokio::test]
    async fn test_bad_arguments_and_missing_method() {
        let wrapper = adder();
        let error = call(&wrapper, "add", &"nope").unwrap().await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::BadRequest);

        let error = call(&wrapper, "mul", &(2, 3)).err().unwrap();
        assert_eq!(error.kind, ErrorKind::ServiceUnexpectedError);
    }

    #[test]
    fn test_container_lookup_by_directory() {
        let container = ProviderContainer::default();
        container.register(adder().with_weight(300));
        let found = container
            .lookup(&ServiceMeta::new("g", "math", "1.0"))
            .unwrap();
        assert_eq!(found.weight(), MAX_WEIGHT);
        assert!(container.lookup(&ServiceMeta::new("g", "math", "2.0")).is_none());
        assert!(container.remove(&ServiceMeta::new("g", "math", "1.0")).is_some());
        assert!(container.is_empty());
    }
}
