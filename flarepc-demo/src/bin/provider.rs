use std::path::PathBuf;

use clap::Parser;
use flarepc::ProviderServer;
use flarepc_demo::{echo_wrapper, load_config};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:18090")]
    pub addr: std::net::SocketAddr,

    /// Registry addresses, `host:port[,host:port]`.
    #[arg(long, default_value = "127.0.0.1:20001")]
    pub registry: String,

    /// Load balancing weight.
    #[arg(long, default_value = "50")]
    pub weight: u32,

    /// JSON config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> flarepc::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let config = load_config(args.config.as_deref(), "flarepc-provider")?;
    let server = ProviderServer::new(&config);
    let wrapper = server.add_service(echo_wrapper(args.weight));
    server.connect_to_registry_server(&args.registry)?;
    let addr = server.start(args.addr).await?;
    server.publish_all()?;
    tracing::info!("serving {} {:?} on {addr}...", wrapper.meta(), wrapper.method_names().collect::<Vec<_>>());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| flarepc::Error::new(flarepc::ErrorKind::Shutdown, e.to_string()))?;
    server.shutdown();
    server.join().await;
    Ok(())
}
