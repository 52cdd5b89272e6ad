use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use super::{Dispatcher, InvokeFuture};
use crate::Result;

/// Fault tolerance applied on top of a dispatcher.
#[derive(
    clap::ValueEnum, Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash,
)]
pub enum Strategy {
    /// One attempt; its outcome is the call's outcome.
    #[default]
    FailFast,
    /// Retries calls that provably never reached a provider.
    FailOver,
    /// Failures resolve to an empty result, decoded as null.
    FailSafe,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy)]
pub struct ClusterStrategyConfig {
    #[serde_inline_default(Strategy::FailFast)]
    pub strategy: Strategy,
    /// Extra attempts of `FailOver`.
    #[serde_inline_default(2)]
    pub retries: u32,
}

impl Default for ClusterStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::FailFast,
            retries: 2,
        }
    }
}

impl ClusterStrategyConfig {
    #[must_use]
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn create(&self, dispatcher: Arc<dyn Dispatcher>) -> Arc<dyn ClusterInvoker> {
        match self.strategy {
            Strategy::FailFast => Arc::new(FailFastClusterInvoker { dispatcher }),
            Strategy::FailOver => Arc::new(FailOverClusterInvoker {
                dispatcher,
                retries: self.retries,
            }),
            Strategy::FailSafe => Arc::new(FailSafeClusterInvoker { dispatcher }),
        }
    }
}

/// Settings overriding the proxy-wide ones for one method.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct MethodSpecialConfig {
    pub method: String,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub strategy: Option<ClusterStrategyConfig>,
}

impl MethodSpecialConfig {
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            timeout: None,
            strategy: None,
        }
    }
}

pub trait ClusterInvoker: Send + Sync {
    fn strategy(&self) -> Strategy;

    fn invoke<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>>;
}

pub struct FailFastClusterInvoker {
    dispatcher: Arc<dyn Dispatcher>,
}

impl ClusterInvoker for FailFastClusterInvoker {
    fn strategy(&self) -> Strategy {
        Strategy::FailFast
    }

    fn invoke<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>> {
        self.dispatcher.dispatch(method, args)
    }
}

/// Dispatches again, up to `retries` more times, while the failure is retry safe. The
/// returned future is detached (invoke id 0) and completed by a background task.
pub struct FailOverClusterInvoker {
    dispatcher: Arc<dyn Dispatcher>,
    retries: u32,
}

impl FailOverClusterInvoker {
    async fn attempt(dispatcher: &dyn Dispatcher, method: &str, args: Bytes) -> Result<Bytes> {
        dispatcher.dispatch(method, args).await?.outcome().await
    }
}

impl ClusterInvoker for FailOverClusterInvoker {
    fn strategy(&self) -> Strategy {
        Strategy::FailOver
    }

    fn invoke<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>> {
        let result = InvokeFuture::detached(0, self.dispatcher.options().serializer);
        let dispatcher = self.dispatcher.clone();
        let retries = self.retries;
        let method = method.to_string();
        let completion = result.clone();
        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                let outcome = Self::attempt(dispatcher.as_ref(), &method, args.clone()).await;
                match outcome {
                    Err(e) if e.kind.is_retry_safe() && attempt < retries => {
                        attempt += 1;
                        tracing::warn!("{method} failed: {e}, retry {attempt}/{retries}");
                    }
                    outcome => {
                        completion.complete(outcome);
                        return;
                    }
                }
            }
        });
        Box::pin(async move { Ok(result) })
    }
}

/// Swallows every failure; the caller observes an empty result instead.
pub struct FailSafeClusterInvoker {
    dispatcher: Arc<dyn Dispatcher>,
}

impl ClusterInvoker for FailSafeClusterInvoker {
    fn strategy(&self) -> Strategy {
        Strategy::FailSafe
    }

    fn invoke<'a>(&'a self, method: &'a str, args: Bytes) -> BoxFuture<'a, Result<InvokeFuture>> {
        Box::pin(async move {
            let serializer = self.dispatcher.options().serializer;
            let future = match self.dispatcher.dispatch(method, args).await {
                Ok(future) => future,
                Err(e) => {
                    tracing::warn!("{method} failed safe: {e}");
                    let result = InvokeFuture::detached(0, serializer);
                    result.complete(Ok(Bytes::new()));
                    return Ok(result);
                }
            };

            let result = InvokeFuture::detached(future.invoke_id(), serializer);
            let completion = result.clone();
            let method = method.to_string();
            future.add_listener(move |outcome| {
                completion.complete(match outcome {
                    Ok(payload) => Ok(payload.clone()),
                    Err(e) => {
                        tracing::warn!("{method} failed safe: {e}");
                        Ok(Bytes::new())
                    }
                });
            });
            Ok(result)
        })
    }
}

/// The cluster invoker of each method: a per-method override, else the default.
pub struct ClusterStrategyBridging {
    default: Arc<dyn ClusterInvoker>,
    methods: HashMap<String, Arc<dyn ClusterInvoker>>,
}

impl ClusterStrategyBridging {
    #[must_use]
    pub fn new(
        dispatcher: &Arc<dyn Dispatcher>,
        default: ClusterStrategyConfig,
        methods: &[MethodSpecialConfig],
    ) -> Self {
        Self {
            default: default.create(dispatcher.clone()),
            methods: methods
                .iter()
                .filter_map(|m| {
                    let strategy = m.strategy?;
                    Some((m.method.clone(), strategy.create(dispatcher.clone())))
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn invoker(&self, method: &str) -> &Arc<dyn ClusterInvoker> {
        self.methods.get(method).unwrap_or(&self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Error, ErrorKind, SerializerType,
        consumer::DispatchOptions,
        meta::ServiceMeta,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted outcomes, one per dispatch.
    struct Scripted {
        options: DispatchOptions,
        outcomes: Mutex<VecDeque<Result<Result<Bytes>>>>,
        dispatched: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Result<Bytes>>>) -> Arc<Self> {
            Arc::new(Self {
                options: DispatchOptions::new("test", ServiceMeta::new("g", "svc", "1.0")),
                outcomes: Mutex::new(outcomes.into()),
                dispatched: Mutex::default(),
            })
        }
    }

    impl Dispatcher for Scripted {
        fn dispatch<'a>(
            &'a self,
            method: &'a str,
            _args: Bytes,
        ) -> BoxFuture<'a, Result<InvokeFuture>> {
            self.dispatched.lock().push(method.to_string());
            let next = self.outcomes.lock().pop_front().unwrap();
            Box::pin(async move {
                let future = InvokeFuture::detached(1, self.options.serializer);
                future.complete(next?);
                Ok(future)
            })
        }

        fn options(&self) -> &DispatchOptions {
            &self.options
        }
    }

    fn ok(value: &str) -> Result<Result<Bytes>> {
        Ok(SerializerType::MessagePack.serialize(value))
    }

    fn failed(kind: ErrorKind) -> Result<Result<Bytes>> {
        Ok(Err(Error::kind(kind)))
    }

    #[tokio::test]
    async fn test_fail_fast_makes_one_attempt() {
        let scripted = Scripted::new(vec![failed(ErrorKind::ClientTimeout)]);
        let invoker = ClusterStrategyConfig::new(Strategy::FailFast).create(scripted.clone());
        let future = invoker.invoke("m", Bytes::new()).await.unwrap();
        assert_eq!(
            future.outcome().await.unwrap_err().kind,
            ErrorKind::ClientTimeout
        );
        assert_eq!(scripted.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_over_retries_safe_failures_only() {
        let scripted = Scripted::new(vec![
            Err(Error::kind(ErrorKind::NoChannel)),
            failed(ErrorKind::ClientTimeout),
            ok("third"),
        ]);
        let invoker = ClusterStrategyConfig::new(Strategy::FailOver).create(scripted.clone());
        let future = invoker.invoke("m", Bytes::new()).await.unwrap();
        assert_eq!(future.get::<String>().await.unwrap(), "third");
        assert_eq!(scripted.dispatched.lock().len(), 3);

        let scripted = Scripted::new(vec![failed(ErrorKind::ServerTimeout), ok("unused")]);
        let invoker = ClusterStrategyConfig::new(Strategy::FailOver).create(scripted.clone());
        let future = invoker.invoke("m", Bytes::new()).await.unwrap();
        assert_eq!(
            future.outcome().await.unwrap_err().kind,
            ErrorKind::ServerTimeout
        );
        assert_eq!(scripted.dispatched.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_over_gives_up_after_retries() {
        let scripted = Scripted::new(vec![
            failed(ErrorKind::ClientError),
            failed(ErrorKind::ClientError),
            failed(ErrorKind::ClientError),
        ]);
        let config = ClusterStrategyConfig {
            strategy: Strategy::FailOver,
            retries: 2,
        };
        let future = config
            .create(scripted.clone())
            .invoke("m", Bytes::new())
            .await
            .unwrap();
        assert_eq!(future.outcome().await.unwrap_err().kind, ErrorKind::ClientError);
        assert_eq!(scripted.dispatched.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_fail_safe_swallows_errors() {
        let scripted = Scripted::new(vec![
            failed(ErrorKind::ServiceExpectedError),
            Err(Error::kind(ErrorKind::NoConnections)),
            ok("fine"),
        ]);
        let invoker = ClusterStrategyConfig::new(Strategy::FailSafe).create(scripted);
        for expected in [None, None, Some("fine".to_string())] {
            let future = invoker.invoke("m", Bytes::new()).await.unwrap();
            assert_eq!(future.get::<Option<String>>().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_bridging_per_method() {
        let scripted: Arc<dyn Dispatcher> = Scripted::new(vec![]);
        let mut special = MethodSpecialConfig::new("audit");
        special.strategy = Some(ClusterStrategyConfig::new(Strategy::FailSafe));
        let bridging = ClusterStrategyBridging::new(
            &scripted,
            ClusterStrategyConfig::default(),
            &[special, MethodSpecialConfig::new("plain")],
        );
        assert_eq!(bridging.invoker("audit").strategy(), Strategy::FailSafe);
        assert_eq!(bridging.invoker("plain").strategy(), Strategy::FailFast);
        assert_eq!(bridging.invoker("other").strategy(), Strategy::FailFast);
    }

    #[test]
    fn test_method_config_from_json() {
        let config: MethodSpecialConfig = serde_json::from_str(
            r#"{"method": "slow", "timeout": "250ms", "strategy": {"strategy": "FailOver"}}"#,
        )
        .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.strategy.unwrap().retries, 2);
    }
}
