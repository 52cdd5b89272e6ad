use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use flarepc::{
    Client, SerializerType, ServiceProxy,
    consumer::{LoadBalancerType, Strategy, TracingHook},
};
use flarepc_demo::{Request, echo_service, load_config};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Registry addresses, `host:port[,host:port]`.
    #[arg(long, default_value = "127.0.0.1:20001")]
    pub registry: String,

    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    #[arg(long, default_value = "message-pack")]
    pub serializer: SerializerType,

    #[arg(long, default_value = "random")]
    pub load_balancer: LoadBalancerType,

    #[arg(long, default_value = "fail-fast")]
    pub strategy: Strategy,

    /// Invoke timeout in milliseconds.
    #[arg(long, default_value = "3000")]
    pub timeout_ms: u64,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,

    /// JSON config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, proxy: Arc<ServiceProxy>) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let secs = args.secs;
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let value = (Request(args.value.clone()),);
        let state = state.clone();
        let proxy = proxy.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = proxy.invoke::<String, _>("echo", &value).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        () = async {
            for task in tasks {
                let _ = task.await;
            }
        } => {}
        () = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> flarepc::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = load_config(args.config.as_deref(), "flarepc-consumer")?;
    let client = Client::new(&config);
    client.connect_to_registry_server(&args.registry)?;
    let mut builder = client
        .proxy(echo_service())
        .serializer(args.serializer)
        .load_balancer(args.load_balancer)
        .strategy(args.strategy)
        .timeout(Duration::from_millis(args.timeout_ms));
    if !args.stress {
        builder = builder.hook(Arc::new(TracingHook));
    }
    let proxy = Arc::new(builder.build());

    if !client
        .await_connections(&echo_service(), config.invoke.await_connections)
        .await
    {
        tracing::warn!("no provider of {} is connected yet", echo_service());
    }

    if args.stress {
        stress_test(args, proxy).await;
    } else {
        let rsp = proxy
            .invoke::<String, _>("echo", &(Request(args.value.clone()),))
            .await;
        tracing::info!("echo rsp: {:?}", rsp);

        let rsp = proxy
            .invoke::<String, _>("greet", &(Request(args.value.clone()),))
            .await;
        tracing::info!("greet rsp: {:?}", rsp);
    }
    client.shutdown();
    Ok(())
}
