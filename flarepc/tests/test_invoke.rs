use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use flarepc::{
    consumer::{ClusterStrategyConfig, DispatchType, MethodSpecialConfig, Strategy},
    *,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Greeting {
    name: String,
    times: u32,
}

fn config() -> Config {
    let mut config = Config::default();
    config.registry.register_retry = Duration::from_millis(50);
    config.registry.ack_scan_interval = Duration::from_millis(50);
    config
}

fn greeter() -> ServiceMeta {
    ServiceMeta::new("test", "greeter", "1.0.0")
}

async fn start_provider(registry: Option<SocketAddr>) -> (ProviderServer, SocketAddr) {
    let server = ProviderServer::new(&config());
    let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let port = addr.port();
    server.add_service(
        ServiceWrapper::new(greeter())
            .method("greet", |_ctx, (greeting,): (Greeting,)| async move {
                Ok(vec![format!("hello {}", greeting.name); greeting.times as usize])
            })
            .method("port", move |_ctx, (): ()| async move { Ok(port) })
            .method("sleep", |_ctx, (millis,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(millis)
            })
            .method("fail", |_ctx, (): ()| async move {
                Err::<u32, _>(Error::new(ErrorKind::Unknown("Declined".into()), "no".into()))
            }),
    );
    if let Some(registry) = registry {
        server
            .connect_to_registry_server(&registry.to_string())
            .unwrap();
        server.publish_all().unwrap();
    }
    (server, addr)
}

fn direct(addr: SocketAddr) -> Address {
    Address::from(addr)
}

#[tokio::test]
async fn test_invoke_through_registry() {
    let _ = tracing_subscriber::fmt().try_init();

    let registry = RegistryServer::new(&config());
    let registry_addr = registry.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let (provider, _) = start_provider(Some(registry_addr)).await;

    let client = Client::new(&config());
    client
        .connect_to_registry_server(&registry_addr.to_string())
        .unwrap();
    let proxy = client.proxy(greeter()).build();
    assert!(client.await_connections(&greeter(), Duration::from_secs(5)).await);

    let greeting = Greeting {
        name: "flare".into(),
        times: 2,
    };
    let rsp: Vec<String> = proxy.invoke("greet", &(&greeting,)).await.unwrap();
    assert_eq!(rsp, vec!["hello flare", "hello flare"]);

    let futures: Vec<_> = (0..64)
        .map(|i| {
            let proxy = &proxy;
            async move { proxy.invoke::<u64, _>("sleep", &(i % 4,)).await }
        })
        .collect();
    for (i, rsp) in futures_util::future::join_all(futures).await.into_iter().enumerate() {
        assert_eq!(rsp.unwrap(), i as u64 % 4);
    }
    assert!(client.futures().is_empty());

    let error = proxy.invoke::<u32, _>("fail", &()).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::Unknown("Declined".into()));
    let error = proxy.invoke::<u32, _>("missing", &()).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ServiceUnexpectedError);
    assert!(error.remote.is_some());

    client.shutdown();
    provider.shutdown();
    registry.shutdown();
}

#[tokio::test]
async fn test_server_timeout_fires_on_time() {
    let _ = tracing_subscriber::fmt().try_init();

    let (provider, addr) = start_provider(None).await;
    let client = Client::new(&config());
    let proxy = client
        .proxy(greeter())
        .direct(direct(addr))
        .timeout(Duration::from_millis(100))
        .build();
    assert!(client.await_connections(&greeter(), Duration::from_secs(5)).await);

    let start = Instant::now();
    let error = proxy.invoke::<u64, _>("sleep", &(1000,)).await.unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(error.kind, ErrorKind::ServerTimeout);
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    assert!(client.futures().is_empty());

    client.shutdown();
    provider.shutdown();
}

#[tokio::test]
async fn test_fail_safe_method_and_method_timeout() {
    let _ = tracing_subscriber::fmt().try_init();

    let (provider, addr) = start_provider(None).await;
    let client = Client::new(&config());
    let mut fail_safe = MethodSpecialConfig::new("fail");
    fail_safe.strategy = Some(ClusterStrategyConfig::new(Strategy::FailSafe));
    let mut quick = MethodSpecialConfig::new("sleep");
    quick.timeout = Some(Duration::from_millis(50));
    let proxy = client
        .proxy(greeter())
        .direct(direct(addr))
        .method_config(fail_safe)
        .method_config(quick)
        .build();
    assert!(client.await_connections(&greeter(), Duration::from_secs(5)).await);

    let rsp: Option<u32> = proxy.invoke("fail", &()).await.unwrap();
    assert_eq!(rsp, None);
    let error = proxy.invoke::<u64, _>("sleep", &(500,)).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ServerTimeout);

    client.shutdown();
    provider.shutdown();
}

#[tokio::test]
async fn test_broadcast_reaches_every_provider() {
    let _ = tracing_subscriber::fmt().try_init();

    let (first, first_addr) = start_provider(None).await;
    let (second, second_addr) = start_provider(None).await;
    let client = Client::new(&config());
    let proxy = client
        .proxy(greeter())
        .direct(direct(first_addr))
        .direct(direct(second_addr))
        .dispatch_type(DispatchType::Broadcast)
        .build();
    let directory = client.connector().directory(&greeter());
    for _ in 0..500 {
        if directory.snapshot().iter().filter(|g| g.is_available()).count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let futures = proxy.broadcast("port", &()).await.unwrap();
    assert_eq!(futures.len(), 2);
    assert_eq!(futures[0].invoke_id(), futures[1].invoke_id());
    let mut ports = Vec::new();
    for future in futures {
        ports.push(future.get::<u16>().await.unwrap());
    }
    ports.sort_unstable();
    let mut expected = vec![first_addr.port(), second_addr.port()];
    expected.sort_unstable();
    assert_eq!(ports, expected);

    let error = proxy.invoke::<u16, _>("port", &()).await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::InvalidArgument);

    client.shutdown();
    first.shutdown();
    second.shutdown();
}
