mod future;
pub use future::{FutureTable, InvokeFuture};

mod hook;
pub use hook::{ConsumerHook, TracingHook};

mod load_balancer;
pub use load_balancer::{
    LoadBalancer, LoadBalancerType, RandomLoadBalancer, RoundRobinLoadBalancer, effective_weight,
};

mod processor;
pub use processor::{ConsumerProcessor, DefaultConsumerProcessor};

mod connector;
pub use connector::Connector;

mod dispatcher;
pub use dispatcher::{BroadcastDispatcher, DispatchOptions, DispatchType, Dispatcher, RoundDispatcher};

mod cluster;
pub use cluster::{
    ClusterInvoker, ClusterStrategyBridging, ClusterStrategyConfig, FailFastClusterInvoker,
    FailOverClusterInvoker, FailSafeClusterInvoker, MethodSpecialConfig, Strategy,
};

mod watcher;
pub use watcher::ConnectionWatcher;

mod client;
pub use client::Client;

mod proxy;
pub use proxy::{ProxyBuilder, ServiceProxy};
